//! Job runner: poll, claim, execute, complete.
//!
//! ```text
//! find_due_jobs(now) ──► claim(id) ──lost──► skip
//!                           │
//!                          won
//!                           ▼
//!                 registry.create(record) ──unknown──► leave leased
//!                           ▼
//!         boundary.execute(job.execute) ──err/panic──► leave leased
//!                           ▼
//!   complete(record, successor at now + run_every if recurring) ──err──► leave leased
//! ```
//!
//! A failed attempt is never rescheduled explicitly. Its lease runs out and a
//! later cycle (of any runner) claims the record again. A panicking job counts
//! as a failed attempt; it never takes the runner thread down.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{mpsc, Arc, Mutex, PoisonError};
use std::thread;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use caseflow_core::{Clock, SystemClock};

use super::job::{JobContext, JobError, TransactionScope};
use super::registry::JobRegistry;
use super::store::{JobStore, JobStoreError};
use super::types::{JobId, JobRecord};
use crate::config::{ConfigError, JobSettings, SchedulerConfig};
use crate::transaction::{TransactionBoundary, TransactionManager};

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Store(#[from] JobStoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("no job registered for type '{0}'")]
    UnknownType(String),

    #[error("scheduling {job_type} overflows the calendar")]
    OutOfRange { job_type: String },

    #[error("failed to spawn runner thread: {0}")]
    Spawn(String),
}

/// Outcome of one poll cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PollSummary {
    /// Due, claimable records seen.
    pub found: usize,
    pub claimed: usize,
    /// Records another runner claimed first.
    pub lost_races: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Totals across the lifetime of a spawned runner.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunnerStats {
    pub cycles: u64,
    pub claimed: u64,
    pub lost_races: u64,
    pub succeeded: u64,
    pub failed: u64,
}

impl RunnerStats {
    fn record(&mut self, summary: &PollSummary) {
        self.cycles += 1;
        self.claimed += summary.claimed as u64;
        self.lost_races += summary.lost_races as u64;
        self.succeeded += summary.succeeded as u64;
        self.failed += summary.failed as u64;
    }
}

/// Handle to control a running runner.
#[derive(Debug)]
pub struct JobRunnerHandle {
    name: String,
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<RunnerStats>>,
}

impl JobRunnerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop after the current cycle and wait for the thread to exit.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            if j.join().is_err() {
                error!(runner = %self.name, "runner thread panicked");
            }
        }
    }

    pub fn stats(&self) -> RunnerStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Polls a job store and executes whatever is due.
///
/// Any number of runners may share one store, in one process or many. The
/// store's `claim` decides which of them executes a record.
pub struct JobRunner<S: JobStore> {
    store: S,
    registry: JobRegistry,
    boundary: TransactionBoundary,
    config: SchedulerConfig,
    clock: Arc<dyn Clock>,
}

impl<S: JobStore> JobRunner<S> {
    /// A runner that opens its own transaction for every attempt.
    pub fn new(
        store: S,
        registry: JobRegistry,
        transactions: Arc<dyn TransactionManager>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            registry,
            boundary: TransactionBoundary::owning(transactions),
            config,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the owning boundary, e.g. with a participating one when the
    /// host already manages the transaction.
    pub fn with_boundary(mut self, boundary: TransactionBoundary) -> Self {
        self.boundary = boundary;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Run one poll cycle.
    ///
    /// Job failures are counted and logged, never returned. An error means the
    /// store itself failed and the rest of the cycle was skipped.
    pub fn run_once(&self) -> Result<PollSummary, RunnerError> {
        let due = self.store.find_due_jobs(self.clock.now())?;
        let mut summary = PollSummary {
            found: due.len(),
            ..PollSummary::default()
        };

        for record in &due {
            let settings = self.config.settings_for(&record.job_type);
            let now = self.clock.now();

            if !self.store.claim(record.id, now, settings.lease())? {
                debug!(
                    runner = %self.config.runner_name,
                    job_id = %record.id,
                    job_type = %record.job_type,
                    "claimed by another runner"
                );
                summary.lost_races += 1;
                continue;
            }
            summary.claimed += 1;
            debug!(
                runner = %self.config.runner_name,
                job_id = %record.id,
                job_type = %record.job_type,
                "claimed job"
            );

            let attempt = panic::catch_unwind(AssertUnwindSafe(|| {
                self.execute_claimed(record, settings, now)
            }))
            .unwrap_or_else(|payload| {
                Err(JobError::system(format!("job panicked: {}", panic_message(&*payload))))
            });

            match attempt {
                Ok(()) => {
                    summary.succeeded += 1;
                    debug!(job_id = %record.id, job_type = %record.job_type, "job completed");
                }
                Err(e) => {
                    summary.failed += 1;
                    error!(
                        runner = %self.config.runner_name,
                        job_id = %record.id,
                        job_type = %record.job_type,
                        system = e.is_system(),
                        error = %e,
                        "job attempt failed, record stays leased"
                    );
                }
            }
        }

        if summary.found > 0 {
            debug!(
                runner = %self.config.runner_name,
                found = summary.found,
                claimed = summary.claimed,
                lost_races = summary.lost_races,
                succeeded = summary.succeeded,
                failed = summary.failed,
                "poll cycle finished"
            );
        }
        Ok(summary)
    }

    fn execute_claimed(
        &self,
        record: &JobRecord,
        settings: &JobSettings,
        now: DateTime<Utc>,
    ) -> Result<(), JobError> {
        let mut job = self.registry.create(record, settings)?;
        let ctx = JobContext {
            record,
            settings,
            boundary: &self.boundary,
            now,
        };

        match job.transaction_scope() {
            TransactionScope::Job => ctx.in_transaction(|| job.execute(&ctx))?,
            TransactionScope::PerBatch => job.execute(&ctx)?,
        }

        self.complete(record, settings, now)
    }

    /// Replace the finished record with its successor (recurring types) or
    /// just remove it, as one store write.
    fn complete(
        &self,
        record: &JobRecord,
        settings: &JobSettings,
        now: DateTime<Utc>,
    ) -> Result<(), JobError> {
        let successor = match settings.interval() {
            Some(every) => {
                let due = now
                    .checked_add_signed(every)
                    .ok_or_else(|| JobError::system("next due time out of range"))?;
                Some(JobRecord::new(record.job_type.clone(), due, now))
            }
            None => None,
        };
        let next = successor.as_ref().map(|r| (r.id, r.due));

        if !self.store.complete(record.id, successor)? {
            // The lease ran out mid-execution and another runner finished the
            // record first; it owns the successor.
            warn!(job_id = %record.id, job_type = %record.job_type, "record vanished before completion");
            return Ok(());
        }

        if let Some((successor, due)) = next {
            debug!(
                job_id = %record.id,
                successor = %successor,
                job_type = %record.job_type,
                due = %due,
                "scheduled next run"
            );
        }
        Ok(())
    }

    /// Make sure every registered recurring type has exactly one record.
    ///
    /// The due time of a fresh record is the first `first_run + k * run_every`
    /// that is not in the past. An unleased record already due in the future is
    /// moved to that time; an overdue one is left to run on the next cycle.
    /// Extra records of the type are deleted. Types with a leased record are
    /// skipped, since the runner holding it inserts the successor.
    ///
    /// Returns the number of types that were touched.
    pub fn schedule_recurring(&self) -> Result<usize, RunnerError> {
        let now = self.clock.now();
        let mut touched = 0;

        for job_type in self.registry.types() {
            let settings = self.config.settings_for(job_type);
            let Some(every) = settings.interval() else {
                continue;
            };
            let due = next_occurrence(settings.first_run, every, now).ok_or_else(|| {
                RunnerError::OutOfRange {
                    job_type: job_type.to_string(),
                }
            })?;

            let existing = self.store.find_by_type(job_type)?;
            if existing.iter().any(|r| !r.is_claimable(now)) {
                debug!(job_type, "recurring job currently leased, leaving it alone");
                continue;
            }

            match existing.split_first() {
                None => {
                    let id = self.store.insert(JobRecord::new(job_type, due, now))?;
                    info!(job_type, job_id = %id, due = %due, "scheduled recurring job");
                }
                Some((keep, extra)) => {
                    if keep.due > now && keep.due != due {
                        self.store.reschedule(keep.id, due)?;
                        info!(job_type, job_id = %keep.id, due = %due, "rescheduled recurring job");
                    }
                    for duplicate in extra {
                        self.store.delete(duplicate.id)?;
                        warn!(job_type, job_id = %duplicate.id, "removed duplicate recurring record");
                    }
                }
            }
            touched += 1;
        }

        Ok(touched)
    }

    /// Insert a one-shot record for a registered type.
    pub fn schedule_once(&self, job_type: &str, due: DateTime<Utc>) -> Result<JobId, RunnerError> {
        if !self.registry.contains(job_type) {
            return Err(RunnerError::UnknownType(job_type.to_string()));
        }
        let id = self.store.insert(JobRecord::new(job_type, due, self.clock.now()))?;
        debug!(job_type, job_id = %id, due = %due, "scheduled job");
        Ok(id)
    }
}

impl<S: JobStore + 'static> JobRunner<S> {
    /// Run poll cycles on a dedicated thread until the handle shuts it down.
    pub fn spawn(self) -> Result<JobRunnerHandle, RunnerError> {
        self.config.validate()?;

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(RunnerStats::default()));
        let stats_clone = stats.clone();

        let name = self.config.runner_name.clone();
        let join = thread::Builder::new()
            .name(name.clone())
            .spawn(move || runner_loop(self, shutdown_rx, stats_clone))
            .map_err(|e| RunnerError::Spawn(e.to_string()))?;

        Ok(JobRunnerHandle {
            name,
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        })
    }
}

impl<S: JobStore> std::fmt::Debug for JobRunner<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRunner")
            .field("name", &self.config.runner_name)
            .field("registry", &self.registry)
            .field("boundary", &self.boundary)
            .finish()
    }
}

fn runner_loop<S: JobStore>(
    runner: JobRunner<S>,
    shutdown_rx: mpsc::Receiver<()>,
    stats: Arc<Mutex<RunnerStats>>,
) {
    let name = runner.config.runner_name.clone();
    let poll_interval = runner.config.poll_interval;
    info!(runner = %name, poll_interval_ms = poll_interval.as_millis() as u64, "job runner started");

    loop {
        match runner.run_once() {
            Ok(summary) => stats
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .record(&summary),
            Err(e) => {
                error!(runner = %name, error = %e, "poll cycle aborted");
                stats.lock().unwrap_or_else(PoisonError::into_inner).cycles += 1;
            }
        }

        match shutdown_rx.recv_timeout(poll_interval) {
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    info!(runner = %name, "job runner stopped");
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// First `first_run + k * every` (k >= 0) that is not before `now`.
fn next_occurrence(first_run: DateTime<Utc>, every: Duration, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if first_run >= now {
        return Some(first_run);
    }
    let step = every.num_milliseconds().max(1);
    let elapsed = (now - first_run).num_milliseconds();
    let periods = elapsed.checked_add(step - 1)? / step;
    let offset = Duration::try_milliseconds(periods.checked_mul(step)?)?;
    first_run.checked_add_signed(offset)
}
