//! Job storage implementations.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Duration, Utc};

use super::types::{JobId, JobRecord};

/// Durable table of job records shared by every runner.
///
/// `claim` is the only synchronization point between runners, including runners
/// in other processes. Implementations must make it a single conditional write.
pub trait JobStore: Send + Sync {
    fn insert(&self, record: JobRecord) -> Result<JobId, JobStoreError>;

    fn get(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError>;

    /// Records with `due <= now` that are claimable at `now`, oldest due first.
    fn find_due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<JobRecord>, JobStoreError>;

    /// All records of one type, oldest due first.
    fn find_by_type(&self, job_type: &str) -> Result<Vec<JobRecord>, JobStoreError>;

    /// Lease the record until `now + lease` if it is still claimable at `now`.
    ///
    /// Returns whether this caller won. A missing record is a lost race.
    fn claim(&self, id: JobId, now: DateTime<Utc>, lease: Duration) -> Result<bool, JobStoreError>;

    /// Remove the record. Returns `false` if it was already gone.
    fn delete(&self, id: JobId) -> Result<bool, JobStoreError>;

    /// Move the record to `next_due` and drop any lease.
    fn reschedule(&self, id: JobId, next_due: DateTime<Utc>) -> Result<(), JobStoreError>;

    /// Delete a finished record and insert its successor in one atomic write.
    ///
    /// Returns `false`, and inserts nothing, if the record was already gone. On
    /// error neither write is applied and the record keeps its lease.
    fn complete(&self, id: JobId, successor: Option<JobRecord>) -> Result<bool, JobStoreError>;
}

impl<T> JobStore for Arc<T>
where
    T: JobStore + ?Sized,
{
    fn insert(&self, record: JobRecord) -> Result<JobId, JobStoreError> {
        (**self).insert(record)
    }

    fn get(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
        (**self).get(id)
    }

    fn find_due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<JobRecord>, JobStoreError> {
        (**self).find_due_jobs(now)
    }

    fn find_by_type(&self, job_type: &str) -> Result<Vec<JobRecord>, JobStoreError> {
        (**self).find_by_type(job_type)
    }

    fn claim(&self, id: JobId, now: DateTime<Utc>, lease: Duration) -> Result<bool, JobStoreError> {
        (**self).claim(id, now, lease)
    }

    fn delete(&self, id: JobId) -> Result<bool, JobStoreError> {
        (**self).delete(id)
    }

    fn reschedule(&self, id: JobId, next_due: DateTime<Utc>) -> Result<(), JobStoreError> {
        (**self).reschedule(id, next_due)
    }

    fn complete(&self, id: JobId, successor: Option<JobRecord>) -> Result<bool, JobStoreError> {
        (**self).complete(id, successor)
    }
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("storage error: {0}")]
    Storage(String),
}

/// In-memory job store for tests/dev.
///
/// The write lock makes `claim` a single check-and-set, which is all the
/// exactly-once guarantee needs within one process.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, JobRecord>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Snapshot of every record, oldest due first.
    pub fn all(&self) -> Result<Vec<JobRecord>, JobStoreError> {
        let mut records: Vec<_> = self.read()?.values().cloned().collect();
        records.sort_by_key(|r| (r.due, r.created));
        Ok(records)
    }

    pub fn len(&self) -> Result<usize, JobStoreError> {
        Ok(self.read()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, JobStoreError> {
        Ok(self.read()?.is_empty())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<JobId, JobRecord>>, JobStoreError> {
        self.jobs
            .read()
            .map_err(|_| JobStoreError::Storage("job table lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<JobId, JobRecord>>, JobStoreError> {
        self.jobs
            .write()
            .map_err(|_| JobStoreError::Storage("job table lock poisoned".to_string()))
    }
}

impl JobStore for InMemoryJobStore {
    fn insert(&self, record: JobRecord) -> Result<JobId, JobStoreError> {
        let mut jobs = self.write()?;
        if jobs.contains_key(&record.id) {
            return Err(JobStoreError::AlreadyExists(record.id));
        }
        let id = record.id;
        jobs.insert(id, record);
        Ok(id)
    }

    fn get(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
        Ok(self.read()?.get(&id).cloned())
    }

    fn find_due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<JobRecord>, JobStoreError> {
        let mut due: Vec<_> = self
            .read()?
            .values()
            .filter(|r| r.is_due(now) && r.is_claimable(now))
            .cloned()
            .collect();
        due.sort_by_key(|r| (r.due, r.created));
        Ok(due)
    }

    fn find_by_type(&self, job_type: &str) -> Result<Vec<JobRecord>, JobStoreError> {
        let mut records: Vec<_> = self
            .read()?
            .values()
            .filter(|r| r.job_type == job_type)
            .cloned()
            .collect();
        records.sort_by_key(|r| (r.due, r.created));
        Ok(records)
    }

    fn claim(&self, id: JobId, now: DateTime<Utc>, lease: Duration) -> Result<bool, JobStoreError> {
        let until = now
            .checked_add_signed(lease)
            .ok_or_else(|| JobStoreError::Storage("lease end out of range".to_string()))?;
        let mut jobs = self.write()?;
        match jobs.get_mut(&id) {
            Some(record) if record.is_claimable(now) => {
                record.lock_expires = Some(until);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn delete(&self, id: JobId) -> Result<bool, JobStoreError> {
        Ok(self.write()?.remove(&id).is_some())
    }

    fn reschedule(&self, id: JobId, next_due: DateTime<Utc>) -> Result<(), JobStoreError> {
        let mut jobs = self.write()?;
        let record = jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
        record.due = next_due;
        record.lock_expires = None;
        Ok(())
    }

    fn complete(&self, id: JobId, successor: Option<JobRecord>) -> Result<bool, JobStoreError> {
        let mut jobs = self.write()?;
        if !jobs.contains_key(&id) {
            return Ok(false);
        }
        if let Some(next) = &successor {
            if jobs.contains_key(&next.id) {
                return Err(JobStoreError::AlreadyExists(next.id));
            }
        }
        jobs.remove(&id);
        if let Some(next) = successor {
            jobs.insert(next.id, next);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;
    use std::thread;

    use chrono::TimeZone;

    use super::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn find_due_jobs_returns_claimable_records_oldest_first() {
        let store = InMemoryJobStore::new();
        let late = store.insert(JobRecord::new("a", t0() - Duration::minutes(1), t0())).unwrap();
        let early = store.insert(JobRecord::new("b", t0() - Duration::hours(1), t0())).unwrap();
        store.insert(JobRecord::new("c", t0() + Duration::minutes(1), t0())).unwrap();
        let leased = store.insert(JobRecord::new("d", t0() - Duration::hours(2), t0())).unwrap();
        assert!(store.claim(leased, t0(), Duration::minutes(5)).unwrap());

        let due: Vec<_> = store.find_due_jobs(t0()).unwrap().into_iter().map(|r| r.id).collect();

        assert_eq!(due, vec![early, late]);
    }

    #[test]
    fn concurrent_claims_have_exactly_one_winner() {
        const RUNNERS: usize = 8;
        let store = InMemoryJobStore::arc();
        let id = store.insert(JobRecord::new("a", t0(), t0())).unwrap();
        let barrier = Arc::new(Barrier::new(RUNNERS));

        let handles: Vec<_> = (0..RUNNERS)
            .map(|_| {
                let store = store.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    store.claim(id, t0(), Duration::minutes(5)).unwrap()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn expired_lease_is_claimable_again() {
        let store = InMemoryJobStore::new();
        let id = store.insert(JobRecord::new("a", t0(), t0())).unwrap();
        let lease = Duration::minutes(5);

        assert!(store.claim(id, t0(), lease).unwrap());
        assert!(!store.claim(id, t0() + lease, lease).unwrap());
        assert!(store.find_due_jobs(t0() + lease).unwrap().is_empty());

        let later = t0() + lease + Duration::seconds(1);
        assert_eq!(store.find_due_jobs(later).unwrap().len(), 1);
        assert!(store.claim(id, later, lease).unwrap());
        assert_eq!(store.get(id).unwrap().unwrap().lock_expires, Some(later + lease));
    }

    #[test]
    fn claim_of_missing_record_loses() {
        let store = InMemoryJobStore::new();
        assert!(!store.claim(JobId::new(), t0(), Duration::minutes(1)).unwrap());
    }

    #[test]
    fn reschedule_moves_due_and_drops_lease() {
        let store = InMemoryJobStore::new();
        let id = store.insert(JobRecord::new("a", t0(), t0())).unwrap();
        store.claim(id, t0(), Duration::hours(1)).unwrap();

        store.reschedule(id, t0() + Duration::days(1)).unwrap();

        let record = store.get(id).unwrap().unwrap();
        assert_eq!(record.due, t0() + Duration::days(1));
        assert_eq!(record.lock_expires, None);
        assert!(matches!(
            store.reschedule(JobId::new(), t0()),
            Err(JobStoreError::NotFound(_))
        ));
    }

    #[test]
    fn delete_reports_whether_a_record_was_removed() {
        let store = InMemoryJobStore::new();
        let id = store.insert(JobRecord::new("a", t0(), t0())).unwrap();

        assert!(store.delete(id).unwrap());
        assert!(!store.delete(id).unwrap());
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let store = InMemoryJobStore::new();
        let record = JobRecord::new("a", t0(), t0());
        store.insert(record.clone()).unwrap();

        assert!(matches!(store.insert(record), Err(JobStoreError::AlreadyExists(_))));
    }

    #[test]
    fn complete_swaps_record_for_successor() {
        let store = InMemoryJobStore::new();
        let id = store.insert(JobRecord::new("a", t0(), t0())).unwrap();
        store.claim(id, t0(), Duration::minutes(5)).unwrap();
        let next = JobRecord::new("a", t0() + Duration::days(1), t0());
        let next_id = next.id;

        assert!(store.complete(id, Some(next)).unwrap());

        assert!(store.get(id).unwrap().is_none());
        assert_eq!(store.get(next_id).unwrap().unwrap().due, t0() + Duration::days(1));
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn complete_of_vanished_record_inserts_nothing() {
        let store = InMemoryJobStore::new();
        let next = JobRecord::new("a", t0() + Duration::days(1), t0());

        assert!(!store.complete(JobId::new(), Some(next)).unwrap());
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn failed_complete_keeps_the_leased_record() {
        let store = InMemoryJobStore::new();
        let id = store.insert(JobRecord::new("a", t0(), t0())).unwrap();
        store.claim(id, t0(), Duration::minutes(5)).unwrap();
        let clash = JobRecord::new("a", t0() + Duration::days(1), t0());
        store.insert(clash.clone()).unwrap();

        assert!(matches!(
            store.complete(id, Some(clash)),
            Err(JobStoreError::AlreadyExists(_))
        ));

        let record = store.get(id).unwrap().unwrap();
        assert_eq!(record.lock_expires, Some(t0() + Duration::minutes(5)));
        assert_eq!(store.len().unwrap(), 2);
    }

    #[test]
    fn claim_with_unrepresentable_lease_is_an_error() {
        let store = InMemoryJobStore::new();
        let id = store.insert(JobRecord::new("a", t0(), t0())).unwrap();

        assert!(store.claim(id, t0(), Duration::MAX).is_err());
        assert_eq!(store.get(id).unwrap().unwrap().lock_expires, None);
    }
}
