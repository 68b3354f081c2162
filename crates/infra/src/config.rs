//! Scheduler configuration.
//!
//! Settings are resolved per job type; types without an explicit entry use
//! `default_job`. Configuration can come from JSON or from the environment:
//!
//! | Variable | Meaning |
//! |---|---|
//! | `CASEFLOW_RUNNER_NAME` | runner name used in logs and the thread name |
//! | `CASEFLOW_POLL_INTERVAL_SECS` | seconds between poll cycles |
//! | `CASEFLOW_JOB_<TYPE>_FIRST_RUN` | RFC 3339 anchor of the recurrence |
//! | `CASEFLOW_JOB_<TYPE>_RUN_EVERY_SECS` | recurrence interval, `0` = one-shot |
//! | `CASEFLOW_JOB_<TYPE>_LEASE_SECS` | lock expiration period |
//! | `CASEFLOW_JOB_<TYPE>_BATCH_SIZE` | batch size for batch-oriented jobs |
//!
//! `<TYPE>` is the job type upper-cased with every non-alphanumeric character
//! replaced by `_` (`task.cleanup` → `TASK_CLEANUP`).

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },

    #[error("malformed configuration: {0}")]
    Json(#[from] serde_json::Error),
}

impl ConfigError {
    fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// Scheduling policy of one job type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobSettings {
    /// Anchor of the recurrence; the first run happens at `first_run + k * run_every`.
    pub first_run: DateTime<Utc>,
    /// Recurrence interval. `None` makes the job one-shot.
    #[serde(with = "option_secs")]
    pub run_every: Option<Duration>,
    /// How long a claim stays valid before the record becomes claimable again.
    #[serde(with = "secs")]
    pub lock_expiration_period: Duration,
    pub batch_size: usize,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            first_run: DateTime::<Utc>::UNIX_EPOCH,
            run_every: None,
            lock_expiration_period: Duration::from_secs(30 * 60),
            batch_size: 100,
        }
    }
}

impl JobSettings {
    pub fn recurring(every: Duration) -> Self {
        Self {
            run_every: Some(every),
            ..Default::default()
        }
    }

    pub fn with_first_run(mut self, first_run: DateTime<Utc>) -> Self {
        self.first_run = first_run;
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lock_expiration_period = lease;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn is_recurring(&self) -> bool {
        self.run_every.is_some()
    }

    /// Lease as a signed duration for timestamp arithmetic.
    pub fn lease(&self) -> chrono::Duration {
        to_signed(self.lock_expiration_period)
    }

    pub fn interval(&self) -> Option<chrono::Duration> {
        self.run_every.map(to_signed)
    }

    fn validate(&self, job_type: &str) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::invalid(
                format!("{job_type}.batch_size"),
                "must be greater than zero",
            ));
        }
        if self.lock_expiration_period.is_zero() {
            return Err(ConfigError::invalid(
                format!("{job_type}.lock_expiration_period"),
                "must be greater than zero",
            ));
        }
        if self.run_every.is_some_and(|d| d.is_zero()) {
            return Err(ConfigError::invalid(
                format!("{job_type}.run_every"),
                "must be greater than zero when set",
            ));
        }
        if chrono::Duration::from_std(self.lock_expiration_period).is_err() {
            return Err(ConfigError::invalid(
                format!("{job_type}.lock_expiration_period"),
                "too large",
            ));
        }
        if self.run_every.is_some_and(|d| chrono::Duration::from_std(d).is_err()) {
            return Err(ConfigError::invalid(format!("{job_type}.run_every"), "too large"));
        }
        Ok(())
    }
}

/// Runner-wide configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub runner_name: String,
    #[serde(with = "secs")]
    pub poll_interval: Duration,
    pub default_job: JobSettings,
    pub jobs: HashMap<String, JobSettings>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            runner_name: "job-runner".to_string(),
            poll_interval: Duration::from_secs(10),
            default_job: JobSettings::default(),
            jobs: HashMap::new(),
        }
    }
}

impl SchedulerConfig {
    pub fn with_runner_name(mut self, name: impl Into<String>) -> Self {
        self.runner_name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_job(mut self, job_type: impl Into<String>, settings: JobSettings) -> Self {
        self.jobs.insert(job_type.into(), settings);
        self
    }

    /// Settings for `job_type`, falling back to `default_job`.
    pub fn settings_for(&self, job_type: &str) -> &JobSettings {
        self.jobs.get(job_type).unwrap_or(&self.default_job)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval.is_zero() {
            return Err(ConfigError::invalid("poll_interval", "must be greater than zero"));
        }
        self.default_job.validate("default_job")?;
        for (job_type, settings) in &self.jobs {
            settings.validate(job_type)?;
        }
        Ok(())
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read configuration from process environment variables.
    pub fn from_env(job_types: &[&str]) -> Result<Self, ConfigError> {
        Self::from_lookup(job_types, |key| std::env::var(key).ok())
    }

    /// Read configuration through `lookup` (environment-style keys).
    pub fn from_lookup(
        job_types: &[&str],
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(name) = lookup("CASEFLOW_RUNNER_NAME") {
            config.runner_name = name;
        }
        if let Some(secs) = parse_u64(&lookup, "CASEFLOW_POLL_INTERVAL_SECS")? {
            config.poll_interval = Duration::from_secs(secs);
        }

        for job_type in job_types {
            let prefix = format!("CASEFLOW_JOB_{}_", env_segment(job_type));
            let mut settings = config.default_job.clone();
            let mut touched = false;

            let key = format!("{prefix}FIRST_RUN");
            if let Some(raw) = lookup(&key) {
                settings.first_run = DateTime::parse_from_rfc3339(raw.trim())
                    .map_err(|e| ConfigError::invalid(&key, e.to_string()))?
                    .with_timezone(&Utc);
                touched = true;
            }
            if let Some(secs) = parse_u64(&lookup, &format!("{prefix}RUN_EVERY_SECS"))? {
                settings.run_every = (secs > 0).then(|| Duration::from_secs(secs));
                touched = true;
            }
            if let Some(secs) = parse_u64(&lookup, &format!("{prefix}LEASE_SECS"))? {
                settings.lock_expiration_period = Duration::from_secs(secs);
                touched = true;
            }
            if let Some(size) = parse_u64(&lookup, &format!("{prefix}BATCH_SIZE"))? {
                settings.batch_size = usize::try_from(size)
                    .map_err(|e| ConfigError::invalid(format!("{prefix}BATCH_SIZE"), e.to_string()))?;
                touched = true;
            }

            if touched {
                config.jobs.insert((*job_type).to_string(), settings);
            }
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_u64(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<u64>, ConfigError> {
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<u64>()
                .map_err(|e| ConfigError::invalid(key, e.to_string()))
        })
        .transpose()
}

fn env_segment(job_type: &str) -> String {
    job_type
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Saturates for durations `validate` rejects; timestamp arithmetic on the
/// result is checked, so an unvalidated setting fails the claim instead.
fn to_signed(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

mod option_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(d).map(|o| o.map(Duration::from_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn env_overrides_apply_per_job_type() {
        let config = SchedulerConfig::from_lookup(
            &["task.cleanup", "task.priority.recalculate"],
            lookup_from(&[
                ("CASEFLOW_RUNNER_NAME", "node-a"),
                ("CASEFLOW_POLL_INTERVAL_SECS", "5"),
                ("CASEFLOW_JOB_TASK_CLEANUP_RUN_EVERY_SECS", "86400"),
                ("CASEFLOW_JOB_TASK_CLEANUP_LEASE_SECS", "600"),
                ("CASEFLOW_JOB_TASK_CLEANUP_FIRST_RUN", "2024-01-01T02:00:00Z"),
                ("CASEFLOW_JOB_TASK_PRIORITY_RECALCULATE_BATCH_SIZE", "25"),
            ]),
        )
        .unwrap();

        assert_eq!(config.runner_name, "node-a");
        assert_eq!(config.poll_interval, Duration::from_secs(5));

        let cleanup = config.settings_for("task.cleanup");
        assert_eq!(cleanup.run_every, Some(Duration::from_secs(86_400)));
        assert_eq!(cleanup.lock_expiration_period, Duration::from_secs(600));
        assert_eq!(cleanup.first_run.to_rfc3339(), "2024-01-01T02:00:00+00:00");

        let priority = config.settings_for("task.priority.recalculate");
        assert_eq!(priority.batch_size, 25);
        assert!(!priority.is_recurring());

        assert_eq!(config.settings_for("unknown"), &JobSettings::default());
    }

    #[test]
    fn zero_interval_means_one_shot() {
        let config = SchedulerConfig::from_lookup(
            &["task.cleanup"],
            lookup_from(&[("CASEFLOW_JOB_TASK_CLEANUP_RUN_EVERY_SECS", "0")]),
        )
        .unwrap();
        assert_eq!(config.settings_for("task.cleanup").run_every, None);
    }

    #[test]
    fn malformed_numbers_are_rejected_with_the_key() {
        let err = SchedulerConfig::from_lookup(
            &["task.cleanup"],
            lookup_from(&[("CASEFLOW_JOB_TASK_CLEANUP_LEASE_SECS", "soon")]),
        )
        .unwrap_err();
        match err {
            ConfigError::Invalid { key, .. } => assert_eq!(key, "CASEFLOW_JOB_TASK_CLEANUP_LEASE_SECS"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn zero_batch_size_fails_validation() {
        let err = SchedulerConfig::from_lookup(
            &["task.cleanup"],
            lookup_from(&[("CASEFLOW_JOB_TASK_CLEANUP_BATCH_SIZE", "0")]),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn json_configuration_uses_seconds() {
        let config = SchedulerConfig::from_json(
            r#"{
                "runner_name": "node-b",
                "poll_interval": 2,
                "jobs": {
                    "task.cleanup": { "run_every": 3600, "lock_expiration_period": 120 }
                }
            }"#,
        )
        .unwrap();

        let cleanup = config.settings_for("task.cleanup");
        assert_eq!(cleanup.run_every, Some(Duration::from_secs(3600)));
        assert_eq!(cleanup.lock_expiration_period, Duration::from_secs(120));
        assert_eq!(cleanup.batch_size, 100);
        assert_eq!(config.poll_interval, Duration::from_secs(2));
    }

    #[test]
    fn unrepresentable_durations_are_rejected() {
        let err = SchedulerConfig::from_json(&format!(
            r#"{{ "jobs": {{ "task.cleanup": {{ "run_every": {} }} }} }}"#,
            u64::MAX
        ))
        .unwrap_err();
        match err {
            ConfigError::Invalid { key, .. } => assert_eq!(key, "task.cleanup.run_every"),
            other => panic!("unexpected error: {other:?}"),
        }

        let huge = u64::MAX.to_string();
        let err = SchedulerConfig::from_lookup(
            &["task.cleanup"],
            lookup_from(&[("CASEFLOW_JOB_TASK_CLEANUP_LEASE_SECS", huge.as_str())]),
        )
        .unwrap_err();
        match err {
            ConfigError::Invalid { key, .. } => {
                assert_eq!(key, "task.cleanup.lock_expiration_period")
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
