//! Closed mapping from persisted type strings to job constructors.

use std::collections::BTreeMap;

use thiserror::Error;

use super::job::{Job, JobError};
use super::types::JobRecord;
use crate::config::JobSettings;

/// Builds a fresh job for one claimed record.
pub type JobFactory =
    Box<dyn Fn(&JobRecord, &JobSettings) -> Result<Box<dyn Job>, JobError> + Send + Sync>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("job type '{0}' is already registered")]
    Duplicate(String),

    #[error("job type must not be empty")]
    EmptyType,
}

/// Every job type a runner can execute.
///
/// Type strings are persisted in job records, so they must stay stable across
/// releases.
#[derive(Default)]
pub struct JobRegistry {
    factories: BTreeMap<String, JobFactory>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, job_type: impl Into<String>, factory: F) -> Result<(), RegistryError>
    where
        F: Fn(&JobRecord, &JobSettings) -> Result<Box<dyn Job>, JobError> + Send + Sync + 'static,
    {
        let job_type = job_type.into();
        if job_type.is_empty() {
            return Err(RegistryError::EmptyType);
        }
        if self.factories.contains_key(&job_type) {
            return Err(RegistryError::Duplicate(job_type));
        }
        self.factories.insert(job_type, Box::new(factory));
        Ok(())
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.factories.contains_key(job_type)
    }

    /// Registered types in lexical order.
    pub fn types(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    pub fn create(&self, record: &JobRecord, settings: &JobSettings) -> Result<Box<dyn Job>, JobError> {
        let factory = self
            .factories
            .get(&record.job_type)
            .ok_or_else(|| JobError::UnknownType(record.job_type.clone()))?;
        factory(record, settings)
    }
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("types", &self.types().collect::<Vec<_>>())
            .finish()
    }
}
