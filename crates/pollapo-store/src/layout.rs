use pollapo_schema::{DependencyRef, MANIFEST_FILE_NAME};
use std::path::{Path, PathBuf};

/// Record written last into every complete cache entry.
pub const ENTRY_RECORD_FILE: &str = ".pollapo-entry.json";

/// Directory layout of the dependency cache.
///
/// ```text
/// <root>/
///   .staging/                 in-progress materializations
///   .locks/<owner>/<repo>@<rev>.lock
///   <owner>/<repo>@<rev>/     one complete entry per immutable revision
/// <root>.lock                 cache-wide lock, outside the root so clearing keeps it
/// ```
///
/// Revisions are escaped (`%` → `%25`, `/` → `%2F`) and owner/repo names never
/// contain `/` or `@`, so distinct triples never share a directory.
#[derive(Debug, Clone)]
pub struct CacheLayout {
    root: PathBuf,
}

impl CacheLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn staging_dir(&self) -> PathBuf {
        self.root.join(".staging")
    }

    #[inline]
    pub fn locks_dir(&self) -> PathBuf {
        self.root.join(".locks")
    }

    pub fn lock_file(&self) -> PathBuf {
        let mut name = self
            .root
            .file_name()
            .map(std::ffi::OsStr::to_os_string)
            .unwrap_or_else(|| "cache".into());
        name.push(".lock");
        self.root.with_file_name(name)
    }

    #[inline]
    pub fn owner_dir(&self, owner: &str) -> PathBuf {
        self.root.join(owner)
    }

    pub fn entry_dir(&self, dep: &DependencyRef) -> PathBuf {
        self.owner_dir(&dep.owner).join(entry_name(dep))
    }

    #[inline]
    pub fn manifest_path(&self, dep: &DependencyRef) -> PathBuf {
        self.entry_dir(dep).join(MANIFEST_FILE_NAME)
    }

    #[inline]
    pub fn record_path(&self, dep: &DependencyRef) -> PathBuf {
        self.entry_dir(dep).join(ENTRY_RECORD_FILE)
    }

    pub fn entry_lock_path(&self, dep: &DependencyRef) -> PathBuf {
        self.locks_dir()
            .join(&dep.owner)
            .join(format!("{}.lock", entry_name(dep)))
    }
}

fn entry_name(dep: &DependencyRef) -> String {
    format!("{}@{}", dep.repo, escape_revision(&dep.revision))
}

pub fn escape_revision(revision: &str) -> String {
    let mut out = String::with_capacity(revision.len());
    for c in revision.chars() {
        match c {
            '%' => out.push_str("%25"),
            '/' => out.push_str("%2F"),
            other => out.push(other),
        }
    }
    out
}
