//! Infrastructure layer: job scheduling, transactions, configuration.

pub mod config;
pub mod jobs;
pub mod transaction;

pub use config::{ConfigError, JobSettings, SchedulerConfig};
pub use transaction::{
    BoundaryError, BoundaryMode, InMemoryTransactionManager, TransactionBoundary,
    TransactionError, TransactionManager,
};
