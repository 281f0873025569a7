use crate::concurrency::{CacheLock, CancelToken};
use crate::CoreError;
use pollapo_remote::{RemoteClient, RemoteError};
use pollapo_schema::{classify, CommitHash, DependencyRef, LockTable, Revision, RevisionKind};
use pollapo_store::{CacheStore, Materialized, StoreError};
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_JOBS: usize = 8;
pub const DEFAULT_MAX_RETRIES: u32 = 2;
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(200);
pub const DEFAULT_MAX_NODES: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionEventKind {
    /// Immutable revision already present in the cache.
    CacheHit,
    /// Branch pinned by the root lock table; no remote call made.
    LockedHashReused,
    /// Branch resolved against the remote; the lock table was updated.
    HashCheckedAndUpdated,
    /// Immutable revision fetched and written to the cache.
    Downloaded,
}

impl ResolutionEventKind {
    pub fn is_branch(self) -> bool {
        matches!(
            self,
            ResolutionEventKind::LockedHashReused | ResolutionEventKind::HashCheckedAndUpdated
        )
    }
}

/// One visited traversal node and what the engine did with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolutionEvent {
    pub kind: ResolutionEventKind,
    pub dep: DependencyRef,
    pub resolved_revision: Revision,
}

#[derive(Debug, Clone)]
pub struct ResolveOptions {
    /// Clear the whole cache before traversal.
    pub clean: bool,
    /// Resolve branches against the remote even when the lock table pins them.
    pub revalidate: bool,
    /// Upper bound on concurrent remote calls.
    pub jobs: usize,
    pub max_retries: u32,
    /// Delay before the first retry; doubled for every further attempt.
    pub retry_backoff: Duration,
    pub max_nodes: usize,
    pub cancel: CancelToken,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            clean: false,
            revalidate: false,
            jobs: DEFAULT_JOBS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            max_nodes: DEFAULT_MAX_NODES,
            cancel: CancelToken::new(),
        }
    }
}

/// Outcome of a completed traversal.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    /// Events in dequeue order, one per visited node.
    pub events: Vec<ResolutionEvent>,
    /// The input lock table amended with every branch resolved in this run.
    pub lock_table: LockTable,
    pub nodes_visited: usize,
}

impl Resolution {
    pub fn count(&self, kind: ResolutionEventKind) -> usize {
        self.events.iter().filter(|e| e.kind == kind).count()
    }
}

/// A queued traversal node. `pinned` marks a commit derived from a branch,
/// which is immutable whatever its spelling.
#[derive(Debug, Clone)]
struct Node {
    dep: DependencyRef,
    pinned: bool,
}

impl Node {
    fn listed(dep: DependencyRef) -> Self {
        Self { dep, pinned: false }
    }

    fn kind(&self) -> RevisionKind {
        if self.pinned {
            RevisionKind::Immutable
        } else {
            classify(&self.dep.revision)
        }
    }
}

/// What to do with a dequeued node, decided without I/O.
enum Step {
    CacheHit(DependencyRef),
    Download(DependencyRef),
    ReuseLocked(DependencyRef, CommitHash),
    ResolveBranch(DependencyRef),
}

/// Result of the I/O part of a step.
enum Work {
    None,
    Fetched(Materialized),
    Resolved(CommitHash),
}

/// Breadth-first resolver over a dependency graph.
///
/// All traversal state (queue, visited set, lock table) lives inside a single
/// [`Resolver::resolve`] call, so independent resolutions never share state.
/// The queue is processed one BFS level at a time: decisions are made in
/// dequeue order on the calling thread, remote I/O for the level runs on up to
/// `jobs` worker threads, and results are applied back in dequeue order. The
/// event sequence is therefore the same as a strictly sequential walk.
pub struct Resolver<'a> {
    store: &'a CacheStore,
    remote: &'a dyn RemoteClient,
    options: ResolveOptions,
    /// Tripped by the first fatal worker error.
    abort: AtomicBool,
}

impl<'a> Resolver<'a> {
    pub fn new(store: &'a CacheStore, remote: &'a dyn RemoteClient, options: ResolveOptions) -> Self {
        Self {
            store,
            remote,
            options,
            abort: AtomicBool::new(false),
        }
    }

    pub fn resolve(
        &self,
        roots: &[DependencyRef],
        lock: &LockTable,
    ) -> Result<Resolution, CoreError> {
        self.resolve_with(roots, lock, &mut |_| {})
    }

    /// Like [`Resolver::resolve`], calling `observer` for every event as it is emitted.
    pub fn resolve_with(
        &self,
        roots: &[DependencyRef],
        lock: &LockTable,
        observer: &mut dyn FnMut(&ResolutionEvent),
    ) -> Result<Resolution, CoreError> {
        self.abort.store(false, Ordering::SeqCst);
        let lock_path = self.store.layout().lock_file();

        if self.options.clean {
            let _exclusive = CacheLock::acquire(&lock_path)?;
            info!("clearing cache {}", self.store.layout().root().display());
            self.store.clear()?;
        } else if let Some(_exclusive) = CacheLock::try_acquire(&lock_path)? {
            self.store.initialize()?;
            self.store.purge_staging()?;
        }
        self.store.initialize()?;
        let _shared = CacheLock::acquire_shared(&lock_path)?;

        let mut queue: VecDeque<Node> = roots.iter().cloned().map(Node::listed).collect();
        let mut visited: HashSet<DependencyRef> = HashSet::new();
        let mut lock_table = lock.clone();
        let mut events = Vec::new();

        info!("resolving {} direct dependencies", roots.len());
        while !queue.is_empty() {
            self.check_cancelled()?;

            let level: Vec<Node> = queue.drain(..).collect();
            let mut steps = Vec::with_capacity(level.len());
            for node in level {
                if !visited.insert(node.dep.clone()) {
                    continue;
                }
                if visited.len() > self.options.max_nodes {
                    return Err(CoreError::CycleBudgetExceeded {
                        limit: self.options.max_nodes,
                    });
                }
                steps.push(self.plan(node, &lock_table));
            }

            let results = self.run_level(&steps)?;

            for (step, work) in steps.into_iter().zip(results) {
                let (event, next) = self.apply(step, work, &mut lock_table)?;
                debug!(
                    "{:?} {} -> {}",
                    event.kind, event.dep, event.resolved_revision
                );
                observer(&event);
                events.push(event);
                queue.extend(next);
            }
        }

        info!("resolved {} nodes", visited.len());
        Ok(Resolution {
            events,
            lock_table,
            nodes_visited: visited.len(),
        })
    }

    fn plan(&self, node: Node, lock_table: &LockTable) -> Step {
        match node.kind() {
            RevisionKind::Immutable => {
                if self.store.exists(&node.dep) {
                    Step::CacheHit(node.dep)
                } else {
                    Step::Download(node.dep)
                }
            }
            RevisionKind::Branch => match lock_table.get(&node.dep) {
                Some(hash) if !self.options.revalidate => {
                    Step::ReuseLocked(node.dep, hash.clone())
                }
                _ => Step::ResolveBranch(node.dep),
            },
        }
    }

    /// Run the remote I/O of one BFS level. Results are returned in step order.
    fn run_level(&self, steps: &[Step]) -> Result<Vec<Work>, CoreError> {
        let pending: Vec<usize> = steps
            .iter()
            .enumerate()
            .filter(|(_, s)| matches!(s, Step::Download(_) | Step::ResolveBranch(_)))
            .map(|(i, _)| i)
            .collect();

        let slots: Vec<Mutex<Option<Result<Work, CoreError>>>> =
            steps.iter().map(|_| Mutex::new(None)).collect();
        let next = AtomicUsize::new(0);
        let workers = self.options.jobs.max(1).min(pending.len());

        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| loop {
                    if self.should_stop() {
                        break;
                    }
                    let Some(&idx) = pending.get(next.fetch_add(1, Ordering::SeqCst)) else {
                        break;
                    };
                    let result = self.perform(&steps[idx]);
                    if result.is_err() {
                        self.abort.store(true, Ordering::SeqCst);
                    }
                    *slots[idx]
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(result);
                });
            }
        });

        let mut results = Vec::with_capacity(steps.len());
        let mut incomplete = false;
        for (step, slot) in steps.iter().zip(slots) {
            let slot = slot
                .into_inner()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            match (step, slot) {
                (Step::CacheHit(_) | Step::ReuseLocked(..), _) => results.push(Work::None),
                (_, Some(Ok(work))) => results.push(work),
                // first failure in dequeue order wins
                (_, Some(Err(e))) => return Err(e),
                (_, None) => {
                    incomplete = true;
                    results.push(Work::None);
                }
            }
        }
        if incomplete {
            return Err(CoreError::Cancelled);
        }
        Ok(results)
    }

    fn perform(&self, step: &Step) -> Result<Work, CoreError> {
        match step {
            Step::Download(dep) => self.download(dep).map(Work::Fetched),
            Step::ResolveBranch(dep) => {
                let hash = self.with_retry(dep, || {
                    self.remote
                        .resolve_branch_head(&dep.owner, &dep.repo, &dep.revision)
                })?;
                Ok(Work::Resolved(hash))
            }
            Step::CacheHit(_) | Step::ReuseLocked(..) => Ok(Work::None),
        }
    }

    /// Fetch and materialize `dep` under its entry lock.
    fn download(&self, dep: &DependencyRef) -> Result<Materialized, CoreError> {
        let _entry = CacheLock::acquire(&self.store.layout().entry_lock_path(dep))?;
        if self.store.exists(dep) {
            debug!("{dep} materialized by another writer");
            return Ok(Materialized::AlreadyPresent);
        }
        let tree = self.with_retry(dep, || {
            self.remote.fetch_tree(&dep.owner, &dep.repo, &dep.revision)
        })?;
        self.store
            .materialize(dep, &tree)
            .map_err(|source| CoreError::CacheWrite {
                dep: dep.clone(),
                source,
            })
    }

    fn with_retry<T>(
        &self,
        dep: &DependencyRef,
        mut call: impl FnMut() -> Result<T, RemoteError>,
    ) -> Result<T, CoreError> {
        let mut delay = self.options.retry_backoff;
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match call() {
                Ok(value) => return Ok(value),
                Err(e)
                    if e.is_transient()
                        && attempts <= self.options.max_retries
                        && !self.should_stop() =>
                {
                    warn!(
                        "{dep}: {e}; retrying in {delay:?} ({attempts}/{})",
                        self.options.max_retries
                    );
                    std::thread::sleep(delay);
                    delay = delay.saturating_mul(2);
                }
                Err(e) => return Err(CoreError::from_remote(dep, e, attempts)),
            }
        }
    }

    /// Turn a planned step and its I/O result into an event and the nodes to enqueue.
    fn apply(
        &self,
        step: Step,
        work: Work,
        lock_table: &mut LockTable,
    ) -> Result<(ResolutionEvent, Vec<Node>), CoreError> {
        match (step, work) {
            (Step::CacheHit(dep), _)
            | (Step::Download(dep), Work::Fetched(Materialized::AlreadyPresent)) => {
                let children = self.children(&dep)?;
                let hit = event(ResolutionEventKind::CacheHit, &dep, dep.revision.clone());
                Ok((hit, children))
            }
            (Step::Download(dep), _) => {
                let children = self.children(&dep)?;
                let fetched = event(ResolutionEventKind::Downloaded, &dep, dep.revision.clone());
                Ok((fetched, children))
            }
            (Step::ReuseLocked(dep, hash), _) => {
                let derived = Node {
                    dep: dep.with_revision(hash.clone()),
                    pinned: true,
                };
                Ok((
                    event(ResolutionEventKind::LockedHashReused, &dep, hash.into()),
                    vec![derived],
                ))
            }
            (Step::ResolveBranch(dep), work) => {
                let Work::Resolved(hash) = work else {
                    return Err(CoreError::Cancelled);
                };
                lock_table.insert(dep.clone(), hash.clone());
                let derived = Node {
                    dep: dep.with_revision(hash.clone()),
                    pinned: true,
                };
                Ok((
                    event(ResolutionEventKind::HashCheckedAndUpdated, &dep, hash.into()),
                    vec![derived],
                ))
            }
        }
    }

    /// Dependencies declared by a cached entry's own manifest. Its lock and
    /// replace rules are ignored.
    fn children(&self, dep: &DependencyRef) -> Result<Vec<Node>, CoreError> {
        match self.store.load_manifest(dep) {
            Ok(Some(manifest)) => Ok(manifest.deps.into_iter().map(Node::listed).collect()),
            Ok(None) => Ok(Vec::new()),
            Err(StoreError::Manifest(source)) => Err(CoreError::ManifestParse {
                dep: dep.clone(),
                source,
            }),
            Err(e) => Err(CoreError::Store(e)),
        }
    }

    fn should_stop(&self) -> bool {
        self.abort.load(Ordering::SeqCst) || self.options.cancel.is_cancelled()
    }

    fn check_cancelled(&self) -> Result<(), CoreError> {
        if self.options.cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }
        Ok(())
    }
}

fn event(kind: ResolutionEventKind, dep: &DependencyRef, resolved: Revision) -> ResolutionEvent {
    ResolutionEvent {
        kind,
        dep: dep.clone(),
        resolved_revision: resolved,
    }
}
