use crate::dependency::DependencyRef;
use crate::lock::LockTable;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File name of a manifest, both at the project root and inside cached dependencies.
pub const MANIFEST_FILE_NAME: &str = "pollapo.yml";

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read manifest '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse manifest '{}': {message}", path.display())]
    Parse { path: PathBuf, message: String },
    #[error("failed to parse manifest: {0}")]
    Syntax(#[from] serde_yaml::Error),
    #[error("invalid dependency '{input}': {reason}")]
    InvalidDependency { input: String, reason: String },
    #[error("failed to write manifest '{}': {source}", path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("manifest '{}' is not a YAML mapping", path.display())]
    NotAMapping { path: PathBuf },
}

impl ManifestError {
    /// Attach the manifest path to a syntax error.
    fn at(self, path: &Path) -> Self {
        match self {
            ManifestError::Syntax(e) => ManifestError::Parse {
                path: path.to_owned(),
                message: e.to_string(),
            },
            other => other,
        }
    }
}

/// A `pollapo.yml` document.
///
/// Unknown keys are accepted: nested manifests come from third-party
/// repositories and may carry fields this version does not understand.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Manifest {
    #[serde(default, deserialize_with = "null_as_default")]
    pub deps: Vec<DependencyRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<RootSection>,
}

/// Settings that only take effect in the project's own manifest.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct RootSection {
    #[serde(default, deserialize_with = "null_as_default")]
    pub lock: LockTable,
    #[serde(
        default,
        rename = "replace-file-option",
        deserialize_with = "null_as_default",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub replace_file_option: BTreeMap<String, ReplaceFileOption>,
}

/// Rewrites `option <name> = "...";` in installed proto files whose path matches `regex`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ReplaceFileOption {
    pub regex: String,
    pub value: String,
}

impl Manifest {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ManifestError> {
        parse_manifest_file(path)
    }

    pub fn dependencies(&self) -> &[DependencyRef] {
        &self.deps
    }

    /// The lock table of a root manifest; empty when the manifest has none.
    pub fn lock_table(&self) -> LockTable {
        self.root
            .as_ref()
            .map(|root| root.lock.clone())
            .unwrap_or_default()
    }

    pub fn replace_file_options(&self) -> BTreeMap<String, ReplaceFileOption> {
        self.root
            .as_ref()
            .map(|root| root.replace_file_option.clone())
            .unwrap_or_default()
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

pub fn parse_manifest_str(input: &str) -> Result<Manifest, ManifestError> {
    if input.trim().is_empty() {
        return Ok(Manifest::default());
    }
    Ok(serde_yaml::from_str(input)?)
}

pub fn parse_manifest_file(path: impl AsRef<Path>) -> Result<Manifest, ManifestError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|source| ManifestError::Read {
        path: path.to_owned(),
        source,
    })?;
    parse_manifest_str(&content).map_err(|e| e.at(path))
}
