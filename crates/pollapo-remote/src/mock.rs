//! In-memory [`RemoteClient`] for tests and offline runs.

use crate::{RemoteClient, RemoteError};
use pollapo_schema::{CommitHash, DependencyRef};
use pollapo_store::FileTree;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

/// One recorded call against a [`MockClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    ValidateToken,
    ResolveBranchHead(DependencyRef),
    FetchTree(DependencyRef),
}

/// Failure injected into the next matching call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    NotFound,
    AuthFailed,
    RateLimited,
    Network,
    Timeout,
}

impl MockFailure {
    fn into_error(self, what: &str) -> RemoteError {
        let detail = format!("injected failure for {what}");
        match self {
            MockFailure::NotFound => RemoteError::NotFound(detail),
            MockFailure::AuthFailed => RemoteError::AuthFailed(detail),
            MockFailure::RateLimited => RemoteError::RateLimited(detail),
            MockFailure::Network => RemoteError::Network(detail),
            MockFailure::Timeout => RemoteError::Timeout(detail),
        }
    }
}

#[derive(Default)]
struct MockState {
    branches: HashMap<(String, String, String), CommitHash>,
    trees: HashMap<(String, String, String), FileTree>,
    token_rejected: bool,
    failures: HashMap<MockCallKey, VecDeque<MockFailure>>,
    calls: Vec<MockCall>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum MockCallKey {
    Resolve(String, String, String),
    Fetch(String, String, String),
}

/// Remote backed by in-memory branch heads and file trees.
///
/// Every call is recorded so tests can assert on how often the resolver
/// went to the network.
#[derive(Default)]
pub struct MockClient {
    state: Mutex<MockState>,
    latency: Option<Duration>,
}

fn key(owner: &str, repo: &str, revision: &str) -> (String, String, String) {
    (owner.to_owned(), repo.to_owned(), revision.to_owned())
}

fn call_dep(owner: &str, repo: &str, revision: &str) -> DependencyRef {
    DependencyRef {
        owner: owner.to_owned(),
        repo: repo.to_owned(),
        revision: revision.into(),
    }
}

impl MockClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long in every remote call. Useful to make concurrency observable.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn with_branch(self, owner: &str, repo: &str, branch: &str, hash: &str) -> Self {
        self.set_branch(owner, repo, branch, hash);
        self
    }

    pub fn with_tree(self, owner: &str, repo: &str, revision: &str, tree: FileTree) -> Self {
        self.set_tree(owner, repo, revision, tree);
        self
    }

    pub fn reject_token(self) -> Self {
        self.state().token_rejected = true;
        self
    }

    /// Move a branch to another commit.
    pub fn set_branch(&self, owner: &str, repo: &str, branch: &str, hash: &str) {
        self.state()
            .branches
            .insert(key(owner, repo, branch), CommitHash::new(hash));
    }

    pub fn set_tree(&self, owner: &str, repo: &str, revision: &str, tree: FileTree) {
        self.state().trees.insert(key(owner, repo, revision), tree);
    }

    /// Queue a failure for the next call of `call`'s kind on the same triple.
    /// Queued failures are consumed in order before normal answers resume.
    pub fn fail_next(&self, call: &MockCall, failure: MockFailure) {
        let call_key = match call {
            MockCall::ResolveBranchHead(d) => {
                MockCallKey::Resolve(d.owner.clone(), d.repo.clone(), d.revision.to_string())
            }
            MockCall::FetchTree(d) => {
                MockCallKey::Fetch(d.owner.clone(), d.repo.clone(), d.revision.to_string())
            }
            MockCall::ValidateToken => {
                if failure == MockFailure::AuthFailed {
                    self.state().token_rejected = true;
                }
                return;
            }
        };
        self.state()
            .failures
            .entry(call_key)
            .or_default()
            .push_back(failure);
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.state().calls.clone()
    }

    pub fn total_calls(&self) -> usize {
        self.state().calls.len()
    }

    /// Number of branch lookups, across all repositories.
    pub fn resolve_calls(&self) -> usize {
        self.count(|c| matches!(c, MockCall::ResolveBranchHead(_)))
    }

    pub fn fetch_calls(&self) -> usize {
        self.count(|c| matches!(c, MockCall::FetchTree(_)))
    }

    pub fn resolve_calls_for(&self, dep: &DependencyRef) -> usize {
        self.count(|c| matches!(c, MockCall::ResolveBranchHead(d) if d == dep))
    }

    pub fn fetch_calls_for(&self, dep: &DependencyRef) -> usize {
        self.count(|c| matches!(c, MockCall::FetchTree(d) if d == dep))
    }

    pub fn reset_calls(&self) {
        self.state().calls.clear();
    }

    fn count(&self, pred: impl Fn(&MockCall) -> bool) -> usize {
        self.state().calls.iter().filter(|c| pred(c)).count()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        // a panicking test thread must not wedge the others
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn pause(&self) {
        if let Some(latency) = self.latency {
            std::thread::sleep(latency);
        }
    }

    fn take_failure(&self, call_key: &MockCallKey) -> Option<MockFailure> {
        self.state()
            .failures
            .get_mut(call_key)
            .and_then(VecDeque::pop_front)
    }
}

impl RemoteClient for MockClient {
    fn validate_token(&self) -> Result<(), RemoteError> {
        let mut state = self.state();
        state.calls.push(MockCall::ValidateToken);
        if state.token_rejected {
            return Err(RemoteError::AuthFailed("token rejected".to_owned()));
        }
        Ok(())
    }

    fn resolve_branch_head(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
    ) -> Result<CommitHash, RemoteError> {
        let dep = call_dep(owner, repo, branch);
        self.state().calls.push(MockCall::ResolveBranchHead(dep.clone()));
        self.pause();
        let call_key = MockCallKey::Resolve(owner.to_owned(), repo.to_owned(), branch.to_owned());
        if let Some(failure) = self.take_failure(&call_key) {
            return Err(failure.into_error(&dep.to_string()));
        }
        self.state()
            .branches
            .get(&key(owner, repo, branch))
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(format!("branch {dep}")))
    }

    fn fetch_tree(
        &self,
        owner: &str,
        repo: &str,
        revision: &str,
    ) -> Result<FileTree, RemoteError> {
        let dep = call_dep(owner, repo, revision);
        self.state().calls.push(MockCall::FetchTree(dep.clone()));
        self.pause();
        let call_key = MockCallKey::Fetch(owner.to_owned(), repo.to_owned(), revision.to_owned());
        if let Some(failure) = self.take_failure(&call_key) {
            return Err(failure.into_error(&dep.to_string()));
        }
        self.state()
            .trees
            .get(&key(owner, repo, revision))
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(format!("tree {dep}")))
    }
}
