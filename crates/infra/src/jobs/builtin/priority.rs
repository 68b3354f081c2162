use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info};

use caseflow_core::TaskId;
use caseflow_events::{CaseEvent, CaseEventKind, EventBroker};
use caseflow_spi::PriorityManager;

use super::TaskMaintenance;
use crate::jobs::job::{Job, JobContext, JobError, TransactionScope};

struct PriorityChange {
    task: TaskId,
    previous: i32,
    priority: i32,
}

struct BatchOutcome {
    last: Option<TaskId>,
    seen: usize,
    changes: Vec<PriorityChange>,
}

/// Re-applies the priority providers to every open task.
///
/// Tasks whose computed priority equals the stored one are not written. A task
/// for which the providers reach no decision keeps its priority.
///
/// `TaskUpdated` events go out after each batch commits and are best-effort:
/// a dispatch error is logged and does not fail the job. A re-run finds those
/// tasks already up to date, so nothing is announced twice.
pub struct PriorityRecalculationJob {
    tasks: Arc<dyn TaskMaintenance>,
    priorities: Arc<PriorityManager>,
    events: Option<Arc<EventBroker<CaseEvent>>>,
}

impl PriorityRecalculationJob {
    pub const TYPE: &'static str = "task.priority.recalculate";

    pub fn new(
        tasks: Arc<dyn TaskMaintenance>,
        priorities: Arc<PriorityManager>,
        events: Option<Arc<EventBroker<CaseEvent>>>,
    ) -> Self {
        Self {
            tasks,
            priorities,
            events,
        }
    }

    fn recalculate_batch(&self, after: Option<TaskId>, limit: usize) -> Result<BatchOutcome, JobError> {
        let tasks = self.tasks.open_tasks(after, limit)?;

        let mut changes = Vec::new();
        for task in &tasks {
            if let Some(priority) = self.priorities.calculate_priority(task)? {
                if priority != task.priority {
                    changes.push(PriorityChange {
                        task: task.id,
                        previous: task.priority,
                        priority,
                    });
                }
            }
        }

        if !changes.is_empty() {
            let updates: Vec<_> = changes.iter().map(|c| (c.task, c.priority)).collect();
            self.tasks.set_priorities(&updates)?;
        }

        Ok(BatchOutcome {
            last: tasks.last().map(|t| t.id),
            seen: tasks.len(),
            changes,
        })
    }

    /// Returns how many events could not be delivered.
    fn announce(&self, changes: &[PriorityChange], at: DateTime<Utc>) -> usize {
        let Some(broker) = self.events.as_ref().filter(|b| b.is_enabled()) else {
            return 0;
        };
        let mut undelivered = 0;
        for change in changes {
            let event = CaseEvent::new(CaseEventKind::TaskUpdated, change.task.to_string())
                .with_details(serde_json::json!({
                    "field": "priority",
                    "previous": change.previous,
                    "priority": change.priority,
                }))
                .occurred(at);
            if let Err(e) = broker.forward(&event) {
                undelivered += 1;
                error!(task_id = %change.task, error = %e, "priority change not announced");
            }
        }
        undelivered
    }
}

impl Job for PriorityRecalculationJob {
    fn job_type(&self) -> &str {
        Self::TYPE
    }

    fn transaction_scope(&self) -> TransactionScope {
        TransactionScope::PerBatch
    }

    fn execute(&mut self, ctx: &JobContext<'_>) -> Result<(), JobError> {
        let limit = ctx.settings.batch_size.max(1);
        let mut after = None;
        let (mut batches, mut changed, mut undelivered) = (0usize, 0usize, 0usize);

        loop {
            let outcome = ctx.in_transaction(|| self.recalculate_batch(after, limit))?;
            batches += 1;
            changed += outcome.changes.len();
            debug!(
                job_id = %ctx.record.id,
                batch = batches,
                tasks = outcome.seen,
                changed = outcome.changes.len(),
                "priority batch committed"
            );
            undelivered += self.announce(&outcome.changes, ctx.now);

            match outcome.last {
                Some(last) if outcome.seen == limit => after = Some(last),
                _ => break,
            }
        }

        info!(job_id = %ctx.record.id, batches, changed, undelivered, "priorities recalculated");
        Ok(())
    }
}
