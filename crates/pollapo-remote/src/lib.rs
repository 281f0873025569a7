//! Remote repository access for pollapo.
//!
//! This crate provides the `RemoteClient` trait the resolver talks to, the
//! `GithubClient` HTTP implementation (branch-head lookup, tarball download,
//! token validation), an in-memory `MockClient`, remote configuration, and
//! credential discovery.

pub mod config;
pub mod credentials;
pub mod github;
pub mod mock;

pub use config::RemoteConfig;
pub use credentials::load_token;
pub use github::GithubClient;
pub use mock::{MockCall, MockClient, MockFailure};

use pollapo_schema::CommitHash;
use pollapo_store::FileTree;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("invalid archive: {0}")]
    InvalidArchive(String),
    #[error("remote I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("remote config error: {0}")]
    Config(String),
}

impl RemoteError {
    /// Errors worth retrying after a short backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RemoteError::RateLimited(_) | RemoteError::Network(_) | RemoteError::Timeout(_)
        )
    }
}

/// Access to remote repositories.
pub trait RemoteClient: Send + Sync {
    /// Check the configured credentials once, before any resolution starts.
    fn validate_token(&self) -> Result<(), RemoteError>;

    /// Resolve a branch to the commit it currently points at.
    fn resolve_branch_head(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
    ) -> Result<CommitHash, RemoteError>;

    /// Download the repository's files at an immutable revision.
    fn fetch_tree(&self, owner: &str, repo: &str, revision: &str)
        -> Result<FileTree, RemoteError>;
}
