//! Transaction boundary: scoped commit of a unit of work.
//!
//! ```text
//! Owning boundary, nothing bound      Owning boundary, already bound     Participating boundary
//! ─────────────────────────────       ──────────────────────────────     ──────────────────────
//! begin()                             work()                             work()
//! work()                              (outer code commits)               (outer code commits)
//! commit() on Ok
//! release() always
//! ```
//!
//! `begin` / `commit` failures surface as [`BoundaryError::System`]; they are
//! fatal for the current attempt. Errors returned by the work itself come back
//! unchanged as [`BoundaryError::Work`] after the transaction is released
//! without commit.

pub mod in_memory;

use std::sync::Arc;

use thiserror::Error;
use tracing::{trace, warn};

pub use in_memory::InMemoryTransactionManager;

/// Failure of the transactional resource itself.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransactionError {
    #[error("failed to begin transaction: {0}")]
    Begin(String),

    #[error("failed to commit transaction: {0}")]
    Commit(String),

    #[error("transaction state unavailable: {0}")]
    State(String),
}

/// Outcome of a failed `TransactionBoundary::execute`.
#[derive(Debug, Error)]
pub enum BoundaryError<E> {
    /// The unit of work returned an error; nothing was committed by this boundary.
    #[error("unit of work failed: {0}")]
    Work(E),

    /// Opening or committing the transaction failed.
    #[error(transparent)]
    System(TransactionError),
}

/// The transactional resource bound to the calling thread.
///
/// Implementations decide what "bound" means (a thread-local connection, a
/// framework-managed transaction, ...). `release` must be safe to call after
/// `commit` and must roll back anything not committed.
pub trait TransactionManager: Send + Sync {
    /// Whether a transaction is already active on the calling thread.
    fn is_bound(&self) -> bool;

    /// Open a transaction and bind it to the calling thread.
    fn begin(&self) -> Result<(), TransactionError>;

    fn commit(&self) -> Result<(), TransactionError>;

    /// Roll back anything uncommitted and unbind.
    fn release(&self);
}

impl<T> TransactionManager for Arc<T>
where
    T: TransactionManager + ?Sized,
{
    fn is_bound(&self) -> bool {
        (**self).is_bound()
    }

    fn begin(&self) -> Result<(), TransactionError> {
        (**self).begin()
    }

    fn commit(&self) -> Result<(), TransactionError> {
        (**self).commit()
    }

    fn release(&self) {
        (**self).release()
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BoundaryMode {
    /// Open, commit and release a transaction unless one is already bound.
    Owning,
    /// Never open or commit; the surrounding framework owns the transaction.
    Participating,
}

/// Runs units of work inside a transaction according to its [`BoundaryMode`].
#[derive(Clone)]
pub struct TransactionBoundary {
    manager: Arc<dyn TransactionManager>,
    mode: BoundaryMode,
}

impl TransactionBoundary {
    pub fn owning(manager: Arc<dyn TransactionManager>) -> Self {
        Self {
            manager,
            mode: BoundaryMode::Owning,
        }
    }

    pub fn participating(manager: Arc<dyn TransactionManager>) -> Self {
        Self {
            manager,
            mode: BoundaryMode::Participating,
        }
    }

    pub fn mode(&self) -> BoundaryMode {
        self.mode
    }

    pub fn manager(&self) -> &Arc<dyn TransactionManager> {
        &self.manager
    }

    pub fn execute<T, E>(
        &self,
        work: impl FnOnce() -> Result<T, E>,
    ) -> Result<T, BoundaryError<E>> {
        if self.mode == BoundaryMode::Participating || self.manager.is_bound() {
            trace!(mode = ?self.mode, "participating in ambient transaction");
            return work().map_err(BoundaryError::Work);
        }

        self.manager.begin().map_err(BoundaryError::System)?;
        let guard = ReleaseGuard {
            manager: self.manager.as_ref(),
        };

        let value = work().map_err(BoundaryError::Work)?;
        guard.manager.commit().map_err(|e| {
            warn!(error = %e, "commit failed");
            BoundaryError::System(e)
        })?;
        Ok(value)
    }
}

impl std::fmt::Debug for TransactionBoundary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionBoundary")
            .field("mode", &self.mode)
            .finish()
    }
}

/// Releases the owned transaction on every exit path, including unwinding.
struct ReleaseGuard<'a> {
    manager: &'a dyn TransactionManager,
}

impl Drop for ReleaseGuard<'_> {
    fn drop(&mut self) {
        self.manager.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> Arc<InMemoryTransactionManager> {
        Arc::new(InMemoryTransactionManager::new())
    }

    #[test]
    fn owning_boundary_commits_and_releases_on_success() {
        let tx = manager();
        let boundary = TransactionBoundary::owning(tx.clone());

        let value: Result<u32, BoundaryError<String>> = boundary.execute(|| Ok(7));

        assert_eq!(value.unwrap(), 7);
        let stats = tx.stats();
        assert_eq!((stats.begun, stats.committed, stats.released), (1, 1, 1));
        assert!(!tx.is_bound());
    }

    #[test]
    fn owning_boundary_releases_without_commit_on_work_error() {
        let tx = manager();
        let boundary = TransactionBoundary::owning(tx.clone());

        let err = boundary
            .execute(|| Err::<(), _>("domain failure".to_string()))
            .unwrap_err();

        assert!(matches!(err, BoundaryError::Work(ref msg) if msg == "domain failure"));
        let stats = tx.stats();
        assert_eq!((stats.begun, stats.committed, stats.released), (1, 0, 1));
        assert!(!tx.is_bound());
    }

    #[test]
    fn commit_failure_is_a_system_error() {
        let tx = manager();
        tx.fail_next_commit();
        let boundary = TransactionBoundary::owning(tx.clone());

        let err = boundary.execute(|| Ok::<_, String>(())).unwrap_err();

        assert!(matches!(err, BoundaryError::System(TransactionError::Commit(_))));
        assert_eq!(tx.stats().released, 1);
    }

    #[test]
    fn begin_failure_skips_the_work() {
        let tx = manager();
        tx.fail_next_begin();
        let boundary = TransactionBoundary::owning(tx.clone());
        let mut ran = false;

        let err = boundary
            .execute(|| {
                ran = true;
                Ok::<_, String>(())
            })
            .unwrap_err();

        assert!(matches!(err, BoundaryError::System(TransactionError::Begin(_))));
        assert!(!ran);
    }

    #[test]
    fn nested_owning_boundary_participates_in_outer_transaction() {
        let tx = manager();
        let boundary = TransactionBoundary::owning(tx.clone());

        boundary
            .execute(|| boundary.execute(|| Ok::<_, String>(())).map_err(|e| e.to_string()))
            .unwrap();

        let stats = tx.stats();
        assert_eq!((stats.begun, stats.committed), (1, 1));
    }

    #[test]
    fn participating_boundary_never_opens_or_commits() {
        let tx = manager();
        let boundary = TransactionBoundary::participating(tx.clone());

        boundary.execute(|| Ok::<_, String>(())).unwrap();

        let stats = tx.stats();
        assert_eq!((stats.begun, stats.committed, stats.released), (0, 0, 0));
    }
}
