//! Revision classification.
//!
//! A revision is classified purely from its spelling. Full commit hashes and
//! version-looking tags are immutable and can be used verbatim as cache keys;
//! anything else is treated as a branch and must be resolved to a commit.

use serde::{Deserialize, Serialize};

/// Length of a full SHA-1 commit hash in hex.
pub const COMMIT_HASH_LEN: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RevisionKind {
    /// Mutable reference, resolved indirectly to a commit.
    Branch,
    /// Tag or commit hash.
    Immutable,
}

impl RevisionKind {
    pub fn is_branch(self) -> bool {
        self == RevisionKind::Branch
    }
}

impl std::fmt::Display for RevisionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RevisionKind::Branch => write!(f, "branch"),
            RevisionKind::Immutable => write!(f, "immutable"),
        }
    }
}

pub fn classify(revision: &str) -> RevisionKind {
    if is_commit_hash(revision) || is_version_tag(revision) {
        RevisionKind::Immutable
    } else {
        RevisionKind::Branch
    }
}

pub fn is_commit_hash(revision: &str) -> bool {
    revision.len() == COMMIT_HASH_LEN && revision.bytes().all(|b| b.is_ascii_hexdigit())
}

/// `v1`, `v1.2.3`, `2.0.0-rc.1`, `V3+build.7`: an optional `v` then a leading digit.
fn is_version_tag(revision: &str) -> bool {
    let body = revision
        .strip_prefix('v')
        .or_else(|| revision.strip_prefix('V'))
        .unwrap_or(revision);
    let mut bytes = body.bytes();
    match bytes.next() {
        Some(b) if b.is_ascii_digit() => {}
        _ => return false,
    }
    bytes.all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-' | b'+'))
}
