//! Events emitted by the case engine's business services.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::{Event, EventKind};

/// Kinds of case events, arranged in a hierarchy.
///
/// ```text
/// Task
/// ├── TaskCreated
/// ├── TaskClaimed
/// ├── TaskUpdated
/// ├── TaskTransferred
/// └── TaskEnded
///     ├── TaskCompleted
///     ├── TaskCancelled
///     └── TaskTerminated
/// Workbasket
/// ├── WorkbasketCreated
/// └── WorkbasketDeleted
/// ```
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseEventKind {
    Task,
    TaskCreated,
    TaskClaimed,
    TaskUpdated,
    TaskTransferred,
    TaskEnded,
    TaskCompleted,
    TaskCancelled,
    TaskTerminated,
    Workbasket,
    WorkbasketCreated,
    WorkbasketDeleted,
}

impl EventKind for CaseEventKind {
    fn parent(self) -> Option<Self> {
        use CaseEventKind::*;
        match self {
            Task | Workbasket => None,
            TaskCreated | TaskClaimed | TaskUpdated | TaskTransferred | TaskEnded => Some(Task),
            TaskCompleted | TaskCancelled | TaskTerminated => Some(TaskEnded),
            WorkbasketCreated | WorkbasketDeleted => Some(Workbasket),
        }
    }

    fn name(self) -> &'static str {
        use CaseEventKind::*;
        match self {
            Task => "task",
            TaskCreated => "task.created",
            TaskClaimed => "task.claimed",
            TaskUpdated => "task.updated",
            TaskTransferred => "task.transferred",
            TaskEnded => "task.ended",
            TaskCompleted => "task.completed",
            TaskCancelled => "task.cancelled",
            TaskTerminated => "task.terminated",
            Workbasket => "workbasket",
            WorkbasketCreated => "workbasket.created",
            WorkbasketDeleted => "workbasket.deleted",
        }
    }
}

/// A case event instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseEvent {
    pub event_id: Uuid,
    pub kind: CaseEventKind,
    /// Identifier of the entity the event is about (task or workbasket id).
    pub subject: String,
    /// Acting user, when the change was user-initiated.
    pub user_id: Option<String>,
    pub occurred_at: DateTime<Utc>,
    pub details: serde_json::Value,
}

impl CaseEvent {
    pub fn new(kind: CaseEventKind, subject: impl Into<String>) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            kind,
            subject: subject.into(),
            user_id: None,
            occurred_at: Utc::now(),
            details: serde_json::Value::Null,
        }
    }

    pub fn by_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    pub fn occurred(mut self, at: DateTime<Utc>) -> Self {
        self.occurred_at = at;
        self
    }
}

impl Event for CaseEvent {
    type Kind = CaseEventKind;

    fn kind(&self) -> CaseEventKind {
        self.kind
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lineage_walks_to_the_top_level_kind() {
        let lineage: Vec<_> = CaseEventKind::TaskCompleted.lineage().collect();
        assert_eq!(
            lineage,
            vec![
                CaseEventKind::TaskCompleted,
                CaseEventKind::TaskEnded,
                CaseEventKind::Task
            ]
        );
    }

    #[test]
    fn is_a_follows_ancestors_only() {
        assert!(CaseEventKind::TaskCancelled.is_a(CaseEventKind::Task));
        assert!(CaseEventKind::TaskCancelled.is_a(CaseEventKind::TaskCancelled));
        assert!(!CaseEventKind::Task.is_a(CaseEventKind::TaskCancelled));
        assert!(!CaseEventKind::WorkbasketCreated.is_a(CaseEventKind::Task));
    }

    #[test]
    fn kind_serializes_as_snake_case() {
        let json = serde_json::to_string(&CaseEventKind::TaskTransferred).unwrap();
        assert_eq!(json, "\"task_transferred\"");
    }
}
