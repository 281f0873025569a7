//! Dependency references, revision classification, manifests and lock tables for pollapo.
//!
//! This crate defines the schema layer: the structured `DependencyRef` identity
//! (`owner/repo@revision`), the syntax-only revision classifier, `pollapo.yml`
//! parsing (`Manifest`), and the `LockTable` that pins branch dependencies to
//! commits, including atomic write-back into the root manifest.

pub mod dependency;
pub mod lock;
pub mod manifest;
pub mod revision;
pub mod types;

pub use dependency::DependencyRef;
pub use lock::{write_lock_table, LockTable};
pub use manifest::{
    parse_manifest_file, parse_manifest_str, Manifest, ManifestError, ReplaceFileOption,
    RootSection, MANIFEST_FILE_NAME,
};
pub use revision::{classify, is_commit_hash, RevisionKind, COMMIT_HASH_LEN};
pub use types::{CommitHash, Revision};
