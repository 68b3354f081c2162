//! Persisted job records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a record stands relative to a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Due in the future.
    Pending,
    /// Due and not leased.
    Claimable,
    /// Leased by some runner until `lock_expires`.
    Locked,
}

/// One pending unit of background work.
///
/// The record carries no payload; `job_type` alone selects the code that runs
/// when it is claimed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub job_type: String,
    /// Earliest time the record becomes eligible.
    pub due: DateTime<Utc>,
    pub created: DateTime<Utc>,
    /// End of the current lease, if the record has ever been claimed.
    pub lock_expires: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn new(job_type: impl Into<String>, due: DateTime<Utc>, created: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            job_type: job_type.into(),
            due,
            created,
            lock_expires: None,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.due <= now
    }

    /// Unleased, or the lease ended strictly before `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.lock_expires.is_none_or(|expires| expires < now)
    }

    pub fn state(&self, now: DateTime<Utc>) -> JobState {
        if !self.is_claimable(now) {
            JobState::Locked
        } else if self.is_due(now) {
            JobState::Claimable
        } else {
            JobState::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, hour, 0, 0).unwrap()
    }

    #[test]
    fn state_follows_due_and_lease() {
        let mut record = JobRecord::new("task.cleanup", at(10), at(9));

        assert_eq!(record.state(at(9)), JobState::Pending);
        assert_eq!(record.state(at(10)), JobState::Claimable);

        record.lock_expires = Some(at(11));
        assert_eq!(record.state(at(10)), JobState::Locked);
        assert_eq!(record.state(at(11)), JobState::Locked);
        assert_eq!(record.state(at(11) + Duration::seconds(1)), JobState::Claimable);
    }

    #[test]
    fn record_serializes_with_plain_id() {
        let record = JobRecord::new("task.cleanup", at(10), at(9));
        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(json["id"], serde_json::json!(record.id.0.to_string()));
        assert_eq!(json["job_type"], "task.cleanup");
        assert!(json["lock_expires"].is_null());
    }
}
