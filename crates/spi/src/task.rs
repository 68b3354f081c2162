use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use caseflow_core::{TaskId, WorkbasketId};

/// The view of a task that routing and priority providers decide on.
///
/// Task persistence lives outside the kernel; business services build this
/// snapshot from their own model before asking for a decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub classification_key: Option<String>,
    pub domain: Option<String>,
    /// Workbasket already assigned by the caller, if any.
    pub workbasket: Option<WorkbasketId>,
    pub priority: i32,
    /// Priority set by a user; takes precedence over any provider.
    pub manual_priority: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub due_at: Option<DateTime<Utc>>,
}

impl TaskSnapshot {
    pub fn new(id: TaskId) -> Self {
        Self {
            id,
            classification_key: None,
            domain: None,
            workbasket: None,
            priority: 0,
            manual_priority: None,
            created_at: Utc::now(),
            due_at: None,
        }
    }

    pub fn with_classification(mut self, key: impl Into<String>) -> Self {
        self.classification_key = Some(key.into());
        self
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn in_workbasket(mut self, workbasket: WorkbasketId) -> Self {
        self.workbasket = Some(workbasket);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_manual_priority(mut self, priority: i32) -> Self {
        self.manual_priority = Some(priority);
        self
    }
}
