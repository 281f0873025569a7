//! Dependency cache for pollapo.
//!
//! This crate provides the storage layer: `CacheLayout` maps an
//! `(owner, repo, immutable revision)` triple to a deterministic directory,
//! `CacheStore` materializes `FileTree`s into those directories atomically and
//! answers existence queries, and `EntryRecord` marks an entry as complete.

pub mod entries;
pub mod layout;
pub mod tree;

pub use entries::{CacheStore, EntryRecord, Materialized, ENTRY_FORMAT_VERSION};
pub use layout::{escape_revision, CacheLayout, ENTRY_RECORD_FILE};
pub use tree::FileTree;

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Fsync a directory so that a preceding `rename()` is durable.
///
/// POSIX does not guarantee rename durability without syncing the parent.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache entry not found: {0}")]
    EntryNotFound(String),
    #[error("integrity check failed for cache entry '{entry}': expected {expected}, got {actual}")]
    IntegrityFailure {
        entry: String,
        expected: String,
        actual: String,
    },
    #[error("invalid path in file tree: '{0}'")]
    InvalidPath(String),
    #[error("failed to clear cache '{}': {source}", path.display())]
    ClearFailed {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("manifest error: {0}")]
    Manifest(#[from] pollapo_schema::ManifestError),
}
