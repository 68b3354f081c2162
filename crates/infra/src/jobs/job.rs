//! The unit of work a claimed record resolves to.

use chrono::{DateTime, Utc};
use thiserror::Error;

use caseflow_core::DomainError;
use caseflow_events::BrokerError;
use caseflow_spi::DecisionError;

use super::store::JobStoreError;
use super::types::JobRecord;
use crate::config::JobSettings;
use crate::transaction::{BoundaryError, TransactionBoundary, TransactionError};

/// Why one execution attempt failed.
///
/// Every variant aborts only the current attempt; the record stays leased and
/// becomes claimable again once the lease expires.
#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("no job registered for type '{0}'")]
    UnknownType(String),

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error(transparent)]
    Store(#[from] JobStoreError),

    #[error(transparent)]
    Decision(#[from] DecisionError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("system error: {0}")]
    System(String),
}

impl JobError {
    pub fn system(msg: impl Into<String>) -> Self {
        Self::System(msg.into())
    }

    /// Failures of the infrastructure rather than of the job's own logic.
    pub fn is_system(&self) -> bool {
        matches!(
            self,
            JobError::Transaction(_) | JobError::Store(_) | JobError::System(_)
        )
    }
}

impl From<BoundaryError<JobError>> for JobError {
    fn from(err: BoundaryError<JobError>) -> Self {
        match err {
            BoundaryError::Work(inner) => inner,
            BoundaryError::System(tx) => JobError::Transaction(tx),
        }
    }
}

/// Where a job's write-set is committed.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum TransactionScope {
    /// The runner wraps the whole `execute` call in one boundary.
    #[default]
    Job,
    /// The job opens one boundary per batch through [`JobContext::in_transaction`].
    PerBatch,
}

/// Everything an execution attempt may look at.
#[derive(Debug, Clone, Copy)]
pub struct JobContext<'a> {
    pub record: &'a JobRecord,
    pub settings: &'a JobSettings,
    pub boundary: &'a TransactionBoundary,
    /// The time the record was claimed.
    pub now: DateTime<Utc>,
}

impl JobContext<'_> {
    /// Run `work` in the runner's transaction boundary.
    pub fn in_transaction<T>(
        &self,
        work: impl FnOnce() -> Result<T, JobError>,
    ) -> Result<T, JobError> {
        self.boundary.execute(work).map_err(JobError::from)
    }
}

/// A schedulable unit of work.
///
/// A fresh instance is built by the registry for every execution attempt and
/// dropped afterwards; jobs keep no state across attempts.
pub trait Job: Send {
    fn job_type(&self) -> &str;

    fn transaction_scope(&self) -> TransactionScope {
        TransactionScope::Job
    }

    fn execute(&mut self, ctx: &JobContext<'_>) -> Result<(), JobError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_errors_unwrap_into_job_errors() {
        let work: JobError = BoundaryError::Work(JobError::UnknownType("x".to_string())).into();
        assert!(matches!(work, JobError::UnknownType(_)));
        assert!(!work.is_system());

        let system: JobError =
            BoundaryError::<JobError>::System(TransactionError::Commit("down".to_string())).into();
        assert!(matches!(system, JobError::Transaction(_)));
        assert!(system.is_system());
    }
}
