use crate::manifest::ManifestError;
use crate::types::Revision;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// One dependency occurrence: a repository at a revision.
///
/// Equality and hashing are structural over the full triple, which makes the
/// type usable directly as the traversal-node and lock-table key. The
/// `owner/repo@revision` string is only a serialization format.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DependencyRef {
    pub owner: String,
    pub repo: String,
    pub revision: Revision,
}

impl DependencyRef {
    pub fn new(
        owner: impl Into<String>,
        repo: impl Into<String>,
        revision: impl Into<Revision>,
    ) -> Result<Self, ManifestError> {
        let dep = Self {
            owner: owner.into(),
            repo: repo.into(),
            revision: revision.into(),
        };
        dep.validate()?;
        Ok(dep)
    }

    /// The same repository at a different revision.
    #[must_use]
    pub fn with_revision(&self, revision: impl Into<Revision>) -> Self {
        Self {
            owner: self.owner.clone(),
            repo: self.repo.clone(),
            revision: revision.into(),
        }
    }

    /// True when both refs name the same repository, regardless of revision.
    pub fn same_repository(&self, other: &Self) -> bool {
        self.owner == other.owner && self.repo == other.repo
    }

    /// `owner/repo` without the revision.
    pub fn repository(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }

    fn validate(&self) -> Result<(), ManifestError> {
        validate_segment("owner", &self.owner, self)?;
        validate_segment("repo", &self.repo, self)?;
        if self.revision.is_empty() {
            return Err(invalid(self, "revision must not be empty"));
        }
        if self.revision.chars().any(char::is_whitespace) {
            return Err(invalid(self, "revision must not contain whitespace"));
        }
        Ok(())
    }
}

fn validate_segment(what: &str, value: &str, dep: &DependencyRef) -> Result<(), ManifestError> {
    if value.is_empty() {
        return Err(invalid(dep, &format!("{what} must not be empty")));
    }
    if value == "." || value == ".." {
        return Err(invalid(dep, &format!("{what} must not be '{value}'")));
    }
    if value
        .chars()
        .any(|c| c == '/' || c == '@' || c == '\\' || c.is_whitespace())
    {
        return Err(invalid(
            dep,
            &format!("{what} must not contain '/', '@', '\\' or whitespace"),
        ));
    }
    Ok(())
}

fn invalid(dep: &DependencyRef, reason: &str) -> ManifestError {
    ManifestError::InvalidDependency {
        input: dep.to_string(),
        reason: reason.to_owned(),
    }
}

impl fmt::Display for DependencyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.owner, self.repo, self.revision)
    }
}

impl FromStr for DependencyRef {
    type Err = ManifestError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let trimmed = input.trim();
        let malformed = || ManifestError::InvalidDependency {
            input: input.to_owned(),
            reason: "expected 'owner/repo@revision'".to_owned(),
        };
        let (owner, rest) = trimmed.split_once('/').ok_or_else(malformed)?;
        let (repo, revision) = rest.split_once('@').ok_or_else(malformed)?;
        Self::new(owner, repo, revision)
    }
}

impl Serialize for DependencyRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DependencyRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
