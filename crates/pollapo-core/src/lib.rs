//! Resolution engine for pollapo.
//!
//! This crate walks a manifest's dependency graph breadth-first, pins branch
//! dependencies to commits, fills the local cache through a `RemoteClient`, and
//! installs the resolved trees into an output directory. It also provides the
//! file locks and cancellation token that keep concurrent runs from corrupting
//! the cache.

pub mod concurrency;
pub mod install;
pub mod lock;
pub mod resolver;

pub use concurrency::{install_signal_handler, CacheLock, CancelToken};
pub use install::{install, Conflict, InstallOptions, InstallReport};
pub use lock::{prune, reconcile};
pub use resolver::{
    Resolution, ResolutionEvent, ResolutionEventKind, ResolveOptions, Resolver,
};

use pollapo_remote::RemoteError;
use pollapo_schema::{DependencyRef, ManifestError};
use pollapo_store::StoreError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),
    #[error("invalid manifest in {dep}: {source}")]
    ManifestParse {
        dep: DependencyRef,
        source: ManifestError,
    },
    #[error("{dep} does not exist on the remote: {message}")]
    RemoteNotFound { dep: DependencyRef, message: String },
    #[error("remote unavailable for {dep} after {attempts} attempt(s): {message}")]
    RemoteTransient {
        dep: DependencyRef,
        attempts: u32,
        message: String,
    },
    #[error("remote call for {dep} timed out after {attempts} attempt(s): {message}")]
    RemoteTimeout {
        dep: DependencyRef,
        attempts: u32,
        message: String,
    },
    #[error("fetching {dep} failed: {source}")]
    RemoteFetch {
        dep: DependencyRef,
        source: RemoteError,
    },
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),
    #[error("failed to write cache entry {dep}: {source}")]
    CacheWrite {
        dep: DependencyRef,
        source: StoreError,
    },
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("dependency graph exceeds {limit} nodes")]
    CycleBudgetExceeded { limit: usize },
    #[error("resolution cancelled")]
    Cancelled,
    #[error("refusing to use '{}' as out dir: {reason}", path.display())]
    UnsafeOutDir { path: PathBuf, reason: String },
    #[error("invalid replace-file-option '{name}': {message}")]
    InvalidReplaceRule { name: String, message: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Map a remote failure for `dep` onto the engine's error kinds.
    pub(crate) fn from_remote(dep: &DependencyRef, err: RemoteError, attempts: u32) -> Self {
        match err {
            RemoteError::NotFound(message) => CoreError::RemoteNotFound {
                dep: dep.clone(),
                message,
            },
            RemoteError::AuthFailed(message) => CoreError::AuthenticationFailed(message),
            RemoteError::RateLimited(message) | RemoteError::Network(message) => {
                CoreError::RemoteTransient {
                    dep: dep.clone(),
                    attempts,
                    message,
                }
            }
            RemoteError::Timeout(message) => CoreError::RemoteTimeout {
                dep: dep.clone(),
                attempts,
                message,
            },
            source => CoreError::RemoteFetch {
                dep: dep.clone(),
                source,
            },
        }
    }

    /// Errors caused by the manifest a user wrote rather than by the environment.
    pub fn is_manifest_error(&self) -> bool {
        matches!(
            self,
            CoreError::Manifest(_)
                | CoreError::ManifestParse { .. }
                | CoreError::InvalidReplaceRule { .. }
        )
    }

    pub fn is_store_error(&self) -> bool {
        matches!(self, CoreError::Store(_) | CoreError::CacheWrite { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dep() -> DependencyRef {
        "acme/widget@main".parse().unwrap()
    }

    #[test]
    fn remote_errors_map_to_engine_kinds() {
        assert!(matches!(
            CoreError::from_remote(&dep(), RemoteError::NotFound("gone".into()), 1),
            CoreError::RemoteNotFound { .. }
        ));
        assert!(matches!(
            CoreError::from_remote(&dep(), RemoteError::AuthFailed("bad".into()), 1),
            CoreError::AuthenticationFailed(_)
        ));
        assert!(matches!(
            CoreError::from_remote(&dep(), RemoteError::RateLimited("slow".into()), 3),
            CoreError::RemoteTransient { attempts: 3, .. }
        ));
        assert!(matches!(
            CoreError::from_remote(&dep(), RemoteError::Timeout("30s".into()), 3),
            CoreError::RemoteTimeout { .. }
        ));
        assert!(matches!(
            CoreError::from_remote(&dep(), RemoteError::InvalidArchive("eof".into()), 1),
            CoreError::RemoteFetch { .. }
        ));
    }

    #[test]
    fn not_found_message_names_dependency() {
        let err = CoreError::from_remote(&dep(), RemoteError::NotFound("404".into()), 1);
        assert!(err.to_string().contains("acme/widget@main"));
    }
}
