use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

use tracing::debug;

use super::{TransactionError, TransactionManager};

/// A write deferred until the surrounding transaction commits.
pub type StagedOp = Box<dyn FnOnce() + Send>;

/// Counters for assertions in tests and diagnostics.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct TransactionStats {
    pub begun: u64,
    pub committed: u64,
    pub released: u64,
    /// Releases that discarded staged writes.
    pub rolled_back: u64,
}

#[derive(Default)]
struct State {
    bound: HashMap<ThreadId, Vec<StagedOp>>,
    stats: TransactionStats,
    fail_begin: bool,
    /// Number of commits that still succeed before one is forced to fail.
    commits_before_failure: Option<u64>,
}

/// Thread-bound transaction manager backed by an in-process staging buffer.
///
/// Each thread holds at most one transaction. Writes registered through
/// [`stage`](Self::stage) run on commit and are dropped on release, which gives
/// hosts without a database the same all-or-nothing batch semantics.
#[derive(Default)]
pub struct InMemoryTransactionManager {
    state: Mutex<State>,
}

impl InMemoryTransactionManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Defer `op` until the calling thread's transaction commits.
    ///
    /// Without a bound transaction the write is applied immediately.
    pub fn stage(&self, op: StagedOp) {
        let mut state = self.state();
        match state.bound.get_mut(&thread::current().id()) {
            Some(ops) => ops.push(op),
            None => {
                drop(state);
                op();
            }
        }
    }

    pub fn stats(&self) -> TransactionStats {
        self.state().stats
    }

    pub fn fail_next_begin(&self) {
        self.state().fail_begin = true;
    }

    pub fn fail_next_commit(&self) {
        self.fail_commit_after(0);
    }

    /// Let `successes` more commits through, then fail the following one.
    pub fn fail_commit_after(&self, successes: u64) {
        self.state().commits_before_failure = Some(successes);
    }
}

impl TransactionManager for InMemoryTransactionManager {
    fn is_bound(&self) -> bool {
        self.state().bound.contains_key(&thread::current().id())
    }

    fn begin(&self) -> Result<(), TransactionError> {
        let mut state = self.state();
        if std::mem::take(&mut state.fail_begin) {
            return Err(TransactionError::Begin("injected failure".to_string()));
        }

        let id = thread::current().id();
        if state.bound.contains_key(&id) {
            return Err(TransactionError::Begin(
                "transaction already bound to this thread".to_string(),
            ));
        }
        state.bound.insert(id, Vec::new());
        state.stats.begun += 1;
        Ok(())
    }

    fn commit(&self) -> Result<(), TransactionError> {
        let ops = {
            let mut state = self.state();
            let id = thread::current().id();
            if !state.bound.contains_key(&id) {
                return Err(TransactionError::State(
                    "no transaction bound to this thread".to_string(),
                ));
            }

            match state.commits_before_failure {
                Some(0) => {
                    state.commits_before_failure = None;
                    return Err(TransactionError::Commit("injected failure".to_string()));
                }
                Some(n) => state.commits_before_failure = Some(n - 1),
                None => {}
            }

            state.stats.committed += 1;
            state
                .bound
                .get_mut(&id)
                .map(std::mem::take)
                .unwrap_or_default()
        };

        debug!(writes = ops.len(), "applying staged writes");
        for op in ops {
            op();
        }
        Ok(())
    }

    fn release(&self) {
        let mut state = self.state();
        if let Some(ops) = state.bound.remove(&thread::current().id()) {
            state.stats.released += 1;
            if !ops.is_empty() {
                state.stats.rolled_back += 1;
                debug!(writes = ops.len(), "discarding staged writes");
            }
        }
    }
}

impl std::fmt::Debug for InMemoryTransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryTransactionManager")
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn counter_op(counter: &Arc<AtomicU32>) -> StagedOp {
        let counter = counter.clone();
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn staged_writes_apply_on_commit() {
        let tx = InMemoryTransactionManager::new();
        let applied = Arc::new(AtomicU32::new(0));

        tx.begin().unwrap();
        tx.stage(counter_op(&applied));
        tx.stage(counter_op(&applied));
        assert_eq!(applied.load(Ordering::SeqCst), 0);

        tx.commit().unwrap();
        tx.release();

        assert_eq!(applied.load(Ordering::SeqCst), 2);
        assert_eq!(tx.stats().rolled_back, 0);
    }

    #[test]
    fn release_without_commit_discards_staged_writes() {
        let tx = InMemoryTransactionManager::new();
        let applied = Arc::new(AtomicU32::new(0));

        tx.begin().unwrap();
        tx.stage(counter_op(&applied));
        tx.release();

        assert_eq!(applied.load(Ordering::SeqCst), 0);
        assert_eq!(tx.stats().rolled_back, 1);
    }

    #[test]
    fn unbound_writes_apply_immediately() {
        let tx = InMemoryTransactionManager::new();
        let applied = Arc::new(AtomicU32::new(0));

        tx.stage(counter_op(&applied));

        assert_eq!(applied.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn binding_is_per_thread() {
        let tx = Arc::new(InMemoryTransactionManager::new());
        tx.begin().unwrap();

        let other = tx.clone();
        let bound_elsewhere = thread::spawn(move || other.is_bound()).join().unwrap();

        assert!(tx.is_bound());
        assert!(!bound_elsewhere);
        tx.release();
    }

    #[test]
    fn injected_commit_failure_hits_the_requested_commit() {
        let tx = InMemoryTransactionManager::new();
        tx.fail_commit_after(1);

        tx.begin().unwrap();
        assert!(tx.commit().is_ok());
        tx.release();

        tx.begin().unwrap();
        assert!(matches!(tx.commit(), Err(TransactionError::Commit(_))));
        tx.release();

        tx.begin().unwrap();
        assert!(tx.commit().is_ok());
        tx.release();
    }
}
