//! Lock table reconciliation.

use crate::resolver::{ResolutionEvent, ResolutionEventKind};
use pollapo_schema::{CommitHash, DependencyRef, LockTable};
use std::collections::HashSet;

/// Build the final lock table from `base` and a run's events.
///
/// Every branch dependency seen in the run gets an entry, whether it was
/// reused from the lock or freshly resolved. Entries for dependencies that
/// were not reached are kept.
pub fn reconcile(base: &LockTable, events: &[ResolutionEvent]) -> LockTable {
    let mut table = base.clone();
    for ev in events.iter().filter(|e| e.kind.is_branch()) {
        table.insert(
            ev.dep.clone(),
            CommitHash::new(ev.resolved_revision.as_str()),
        );
    }
    table
}

/// Drop lock entries for branch dependencies not reached in this run.
/// Returns the removed dependencies, sorted.
pub fn prune(table: &mut LockTable, events: &[ResolutionEvent]) -> Vec<DependencyRef> {
    let reached: HashSet<&DependencyRef> = events
        .iter()
        .filter(|e| e.kind.is_branch())
        .map(|e| &e.dep)
        .collect();
    let mut removed = Vec::new();
    table.retain(|dep, _| {
        let keep = reached.contains(dep);
        if !keep {
            removed.push(dep.clone());
        }
        keep
    });
    removed
}
