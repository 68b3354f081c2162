//! Maintenance jobs shipped with the engine.
//!
//! | Type | Job | Transactions |
//! |---|---|---|
//! | `task.priority.recalculate` | [`PriorityRecalculationJob`] | one per batch |
//! | `task.cleanup` | [`TaskCleanupJob`] | one per batch |
//!
//! Both walk the task table in id order with keyset pagination, so a re-run
//! after a failed attempt starts from the beginning and skips nothing. The work
//! they do per task is absolute (set a priority, delete a row), which makes
//! repeating an already committed batch harmless.

pub mod cleanup;
pub mod in_memory;
pub mod priority;

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use caseflow_core::TaskId;
use caseflow_events::{CaseEvent, EventBroker};
use caseflow_spi::{PriorityManager, TaskSnapshot};

use super::job::{Job, JobError};
use super::registry::{JobRegistry, RegistryError};

pub use cleanup::TaskCleanupJob;
pub use in_memory::InMemoryTaskMaintenance;
pub use priority::PriorityRecalculationJob;

/// Task access the maintenance jobs need from the business layer.
///
/// Writes are expected to join the transaction bound to the calling thread.
pub trait TaskMaintenance: Send + Sync {
    /// Open tasks with `id > after`, ascending by id, at most `limit`.
    fn open_tasks(&self, after: Option<TaskId>, limit: usize) -> Result<Vec<TaskSnapshot>, JobError>;

    fn set_priorities(&self, updates: &[(TaskId, i32)]) -> Result<(), JobError>;

    /// Ids of tasks completed before `cutoff` with `id > after`, ascending, at most `limit`.
    fn completed_tasks_before(
        &self,
        cutoff: DateTime<Utc>,
        after: Option<TaskId>,
        limit: usize,
    ) -> Result<Vec<TaskId>, JobError>;

    /// Returns the number of tasks removed.
    fn delete_tasks(&self, ids: &[TaskId]) -> Result<usize, JobError>;
}

/// Collaborators of the built-in jobs.
#[derive(Clone)]
pub struct MaintenanceServices {
    pub tasks: Arc<dyn TaskMaintenance>,
    pub priorities: Arc<PriorityManager>,
    /// Receives `TaskUpdated` for every committed priority change.
    pub events: Option<Arc<EventBroker<CaseEvent>>>,
    /// Completed tasks younger than this survive cleanup.
    pub cleanup_min_age: Duration,
}

impl MaintenanceServices {
    pub fn new(tasks: Arc<dyn TaskMaintenance>, priorities: Arc<PriorityManager>) -> Self {
        Self {
            tasks,
            priorities,
            events: None,
            cleanup_min_age: Duration::days(14),
        }
    }

    pub fn with_events(mut self, broker: Arc<EventBroker<CaseEvent>>) -> Self {
        self.events = Some(broker);
        self
    }

    pub fn with_cleanup_min_age(mut self, age: Duration) -> Self {
        self.cleanup_min_age = age;
        self
    }
}

/// Register every built-in job type.
pub fn register_builtin_jobs(
    registry: &mut JobRegistry,
    services: MaintenanceServices,
) -> Result<(), RegistryError> {
    let recalc = services.clone();
    registry.register(PriorityRecalculationJob::TYPE, move |_, _| {
        Ok(Box::new(PriorityRecalculationJob::new(
            recalc.tasks.clone(),
            recalc.priorities.clone(),
            recalc.events.clone(),
        )) as Box<dyn Job>)
    })?;

    let cleanup = services;
    registry.register(TaskCleanupJob::TYPE, move |_, _| {
        Ok(Box::new(TaskCleanupJob::new(
            cleanup.tasks.clone(),
            cleanup.cleanup_min_age,
        )) as Box<dyn Job>)
    })?;

    Ok(())
}
