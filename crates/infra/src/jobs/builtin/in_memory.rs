use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use caseflow_core::TaskId;
use caseflow_spi::TaskSnapshot;

use super::TaskMaintenance;
use crate::jobs::job::JobError;
use crate::transaction::InMemoryTransactionManager;

#[derive(Debug, Clone)]
struct StoredTask {
    snapshot: TaskSnapshot,
    completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Tables {
    tasks: BTreeMap<TaskId, StoredTask>,
    priority_writes: HashMap<TaskId, u32>,
}

/// In-memory task table for tests/dev.
///
/// With [`with_transactions`](Self::with_transactions) set, writes are staged
/// on the manager and only become visible when the surrounding transaction
/// commits.
#[derive(Debug, Default, Clone)]
pub struct InMemoryTaskMaintenance {
    tables: Arc<RwLock<Tables>>,
    transactions: Option<Arc<InMemoryTransactionManager>>,
}

impl InMemoryTaskMaintenance {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_transactions(mut self, transactions: Arc<InMemoryTransactionManager>) -> Self {
        self.transactions = Some(transactions);
        self
    }

    /// Add an open task. Applied immediately, outside any transaction.
    pub fn insert(&self, snapshot: TaskSnapshot) -> TaskId {
        let id = snapshot.id;
        self.write().tasks.insert(
            id,
            StoredTask {
                snapshot,
                completed_at: None,
            },
        );
        id
    }

    /// Mark a task completed at `at`. Applied immediately.
    pub fn complete(&self, id: TaskId, at: DateTime<Utc>) -> bool {
        match self.write().tasks.get_mut(&id) {
            Some(task) => {
                task.completed_at = Some(at);
                true
            }
            None => false,
        }
    }

    pub fn task(&self, id: TaskId) -> Option<TaskSnapshot> {
        self.read().tasks.get(&id).map(|t| t.snapshot.clone())
    }

    pub fn len(&self) -> usize {
        self.read().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// How many committed priority writes touched `id`.
    pub fn priority_writes(&self, id: TaskId) -> u32 {
        self.read().priority_writes.get(&id).copied().unwrap_or(0)
    }

    fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn apply(&self, write: impl FnOnce(&mut Tables) + Send + 'static) {
        let tables = self.tables.clone();
        let op = move || {
            let mut guard = tables.write().unwrap_or_else(PoisonError::into_inner);
            write(&mut *guard);
        };
        match &self.transactions {
            Some(tx) => tx.stage(Box::new(op)),
            None => op(),
        }
    }
}

impl TaskMaintenance for InMemoryTaskMaintenance {
    fn open_tasks(&self, after: Option<TaskId>, limit: usize) -> Result<Vec<TaskSnapshot>, JobError> {
        let tables = self.read();
        let lower = after.map_or(Bound::Unbounded, Bound::Excluded);
        Ok(tables
            .tasks
            .range((lower, Bound::Unbounded))
            .filter(|(_, t)| t.completed_at.is_none())
            .take(limit)
            .map(|(_, t)| t.snapshot.clone())
            .collect())
    }

    fn set_priorities(&self, updates: &[(TaskId, i32)]) -> Result<(), JobError> {
        let updates = updates.to_vec();
        self.apply(move |tables| {
            for (id, priority) in updates {
                if let Some(task) = tables.tasks.get_mut(&id) {
                    task.snapshot.priority = priority;
                    *tables.priority_writes.entry(id).or_default() += 1;
                }
            }
        });
        Ok(())
    }

    fn completed_tasks_before(
        &self,
        cutoff: DateTime<Utc>,
        after: Option<TaskId>,
        limit: usize,
    ) -> Result<Vec<TaskId>, JobError> {
        let tables = self.read();
        let lower = after.map_or(Bound::Unbounded, Bound::Excluded);
        Ok(tables
            .tasks
            .range((lower, Bound::Unbounded))
            .filter(|(_, t)| t.completed_at.is_some_and(|at| at < cutoff))
            .take(limit)
            .map(|(id, _)| *id)
            .collect())
    }

    fn delete_tasks(&self, ids: &[TaskId]) -> Result<usize, JobError> {
        let count = {
            let tables = self.read();
            ids.iter().filter(|id| tables.tasks.contains_key(id)).count()
        };
        let ids = ids.to_vec();
        self.apply(move |tables| {
            for id in ids {
                tables.tasks.remove(&id);
                tables.priority_writes.remove(&id);
            }
        });
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::config::JobSettings;
    use crate::jobs::builtin::TaskCleanupJob;
    use crate::jobs::job::{Job, JobContext};
    use crate::jobs::types::JobRecord;
    use crate::transaction::{TransactionBoundary, TransactionManager};

    #[test]
    fn staged_writes_are_invisible_until_commit() {
        let tx = Arc::new(InMemoryTransactionManager::new());
        let tasks = InMemoryTaskMaintenance::new().with_transactions(tx.clone());
        let id = tasks.insert(TaskSnapshot::new(TaskId::new()));

        tx.begin().unwrap();
        tasks.set_priorities(&[(id, 5)]).unwrap();
        assert_eq!(tasks.task(id).unwrap().priority, 0);
        tx.commit().unwrap();
        tx.release();

        assert_eq!(tasks.task(id).unwrap().priority, 5);
        assert_eq!(tasks.priority_writes(id), 1);
    }

    #[test]
    fn cleanup_deletes_only_old_completed_tasks() {
        let now = Utc::now();
        let tx = Arc::new(InMemoryTransactionManager::new());
        let tasks = Arc::new(InMemoryTaskMaintenance::new().with_transactions(tx.clone()));
        let old: Vec<_> = (0..5)
            .map(|_| {
                let id = tasks.insert(TaskSnapshot::new(TaskId::new()));
                tasks.complete(id, now - Duration::days(30));
                id
            })
            .collect();
        let recent = tasks.insert(TaskSnapshot::new(TaskId::new()));
        tasks.complete(recent, now - Duration::days(1));
        let open = tasks.insert(TaskSnapshot::new(TaskId::new()));

        let mut job = TaskCleanupJob::new(tasks.clone(), Duration::days(14));
        let record = JobRecord::new(TaskCleanupJob::TYPE, now, now);
        let settings = JobSettings::default().with_batch_size(2);
        let boundary = TransactionBoundary::owning(tx.clone());
        job.execute(&JobContext {
            record: &record,
            settings: &settings,
            boundary: &boundary,
            now,
        })
        .unwrap();

        assert!(old.iter().all(|id| tasks.task(*id).is_none()));
        assert!(tasks.task(recent).is_some());
        assert!(tasks.task(open).is_some());
        assert_eq!(tx.stats().committed, 3);
    }

    #[test]
    fn writes_survive_a_poisoned_table() {
        let tasks = InMemoryTaskMaintenance::new();
        let poisoner = tasks.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.tables.write().unwrap();
            panic!("poison the table");
        })
        .join();

        let id = tasks.insert(TaskSnapshot::new(TaskId::new()));
        tasks.set_priorities(&[(id, 7)]).unwrap();

        assert_eq!(tasks.task(id).unwrap().priority, 7);
        assert_eq!(tasks.priority_writes(id), 1);
    }
}
