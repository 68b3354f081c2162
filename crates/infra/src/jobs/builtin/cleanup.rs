use std::sync::Arc;

use chrono::Duration;
use tracing::{debug, info};

use super::TaskMaintenance;
use crate::jobs::job::{Job, JobContext, JobError, TransactionScope};

/// Deletes completed tasks older than a minimum age.
pub struct TaskCleanupJob {
    tasks: Arc<dyn TaskMaintenance>,
    min_age: Duration,
}

impl TaskCleanupJob {
    pub const TYPE: &'static str = "task.cleanup";

    pub fn new(tasks: Arc<dyn TaskMaintenance>, min_age: Duration) -> Self {
        Self { tasks, min_age }
    }
}

impl Job for TaskCleanupJob {
    fn job_type(&self) -> &str {
        Self::TYPE
    }

    fn transaction_scope(&self) -> TransactionScope {
        TransactionScope::PerBatch
    }

    fn execute(&mut self, ctx: &JobContext<'_>) -> Result<(), JobError> {
        let cutoff = ctx
            .now
            .checked_sub_signed(self.min_age)
            .ok_or_else(|| JobError::system("cleanup cutoff out of range"))?;
        let limit = ctx.settings.batch_size.max(1);
        let mut after = None;
        let mut deleted = 0usize;

        loop {
            let (last, found, removed) = ctx.in_transaction(|| {
                let ids = self.tasks.completed_tasks_before(cutoff, after, limit)?;
                if ids.is_empty() {
                    return Ok((None, 0, 0));
                }
                let removed = self.tasks.delete_tasks(&ids)?;
                Ok((ids.last().copied(), ids.len(), removed))
            })?;
            deleted += removed;
            debug!(job_id = %ctx.record.id, found, removed, "cleanup batch committed");

            match last {
                Some(last) if found == limit => after = Some(last),
                _ => break,
            }
        }

        info!(job_id = %ctx.record.id, cutoff = %cutoff, deleted, "completed tasks cleaned up");
        Ok(())
    }
}
