//! Database-backed job scheduler.
//!
//! ## Design
//!
//! - Records carry only a type string and timing; the type resolves to code
//!   through a closed [`JobRegistry`]
//! - Runners in any number of processes share one [`JobStore`]; its atomic
//!   `claim` is the only coordination between them
//! - A claim is a lease: if the runner dies or the job fails, the record becomes
//!   claimable again once `lock_expires` has passed
//! - Recurring types insert their own successor when an attempt succeeds
//!
//! ## Components
//!
//! - `JobRecord`: persisted descriptor of one pending unit of work
//! - `JobStore`: persistence (in-memory or Postgres)
//! - `Job` / `JobRegistry`: executable logic keyed by type string
//! - `JobRunner`: poll loop that claims, executes and completes records
//! - `builtin`: priority recalculation and task cleanup

pub mod builtin;
pub mod job;
pub mod postgres;
pub mod registry;
pub mod runner;
pub mod store;
pub mod types;

pub use job::{Job, JobContext, JobError, TransactionScope};
pub use postgres::PostgresJobStore;
pub use registry::{JobFactory, JobRegistry, RegistryError};
pub use runner::{JobRunner, JobRunnerHandle, PollSummary, RunnerError, RunnerStats};
pub use store::{InMemoryJobStore, JobStore, JobStoreError};
pub use types::{JobId, JobRecord, JobState};
