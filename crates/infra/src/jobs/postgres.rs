//! Postgres-backed job store.
//!
//! ## Claim
//!
//! `claim` is one conditional `UPDATE`:
//!
//! ```sql
//! UPDATE scheduled_job SET lock_expires = $3
//! WHERE id = $1 AND (lock_expires IS NULL OR lock_expires < $2)
//! ```
//!
//! Postgres row locking serializes concurrent updates of the same row and
//! re-evaluates the predicate for the second writer, so at most one runner sees
//! `rows_affected = 1`. Nothing is read before the write.
//!
//! ## Completion
//!
//! `complete` deletes the finished row and inserts its successor inside one
//! transaction. If the row is already gone the transaction is rolled back and
//! no successor is written; if the insert fails, the delete is rolled back
//! with it and the row keeps its lease.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError |
//! |------------|----------------------|---------------|
//! | Database (unique violation on insert) | `23505` | `AlreadyExists` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed, Io, other | N/A | `Storage` |
//!
//! ## Runtime
//!
//! [`JobStore`] is synchronous and runners drive it from plain threads. The store
//! keeps a `tokio::runtime::Handle` and blocks on it, so its methods must not be
//! called from inside an async task of that runtime.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use sqlx::{PgPool, Row};
use tokio::runtime::Handle;
use tracing::instrument;

use super::store::{JobStore, JobStoreError};
use super::types::{JobId, JobRecord};

/// DDL for the job table.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS scheduled_job (
    id           UUID PRIMARY KEY,
    job_type     TEXT NOT NULL,
    due          TIMESTAMPTZ NOT NULL,
    created      TIMESTAMPTZ NOT NULL,
    lock_expires TIMESTAMPTZ NULL
);
CREATE INDEX IF NOT EXISTS scheduled_job_due_idx ON scheduled_job (due);
CREATE INDEX IF NOT EXISTS scheduled_job_type_idx ON scheduled_job (job_type);
"#;

#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
    runtime: Handle,
}

impl PostgresJobStore {
    /// Create a store that runs its queries on `runtime`.
    pub fn new(pool: PgPool, runtime: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            runtime,
        }
    }

    /// Create a store bound to the runtime of the calling context.
    pub fn from_current(pool: PgPool) -> Result<Self, JobStoreError> {
        let runtime = Handle::try_current().map_err(|_| {
            JobStoreError::Storage("PostgresJobStore requires a tokio runtime".to_string())
        })?;
        Ok(Self::new(pool, runtime))
    }

    /// Create the `scheduled_job` table and its indexes if missing.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    #[instrument(skip(self, record), fields(job_id = %record.id, job_type = %record.job_type), err)]
    async fn insert_record(&self, record: JobRecord) -> Result<JobId, JobStoreError> {
        sqlx::query(
            r#"
            INSERT INTO scheduled_job (id, job_type, due, created, lock_expires)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(record.id.0)
        .bind(&record.job_type)
        .bind(record.due)
        .bind(record.created)
        .bind(record.lock_expires)
        .execute(&*self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                JobStoreError::AlreadyExists(record.id)
            }
            other => map_sqlx_error("insert", other),
        })?;
        Ok(record.id)
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get_record(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, job_type, due, created, lock_expires
            FROM scheduled_job
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|r| record_from_row(&r)).transpose()
    }

    #[instrument(skip(self), err)]
    async fn due_records(&self, now: DateTime<Utc>) -> Result<Vec<JobRecord>, JobStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, job_type, due, created, lock_expires
            FROM scheduled_job
            WHERE due <= $1 AND (lock_expires IS NULL OR lock_expires < $1)
            ORDER BY due ASC, created ASC
            "#,
        )
        .bind(now)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_due_jobs", e))?;

        rows.iter().map(record_from_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn records_of_type(&self, job_type: &str) -> Result<Vec<JobRecord>, JobStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, job_type, due, created, lock_expires
            FROM scheduled_job
            WHERE job_type = $1
            ORDER BY due ASC, created ASC
            "#,
        )
        .bind(job_type)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_by_type", e))?;

        rows.iter().map(record_from_row).collect()
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn claim_record(
        &self,
        id: JobId,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<bool, JobStoreError> {
        let until = now
            .checked_add_signed(lease)
            .ok_or_else(|| JobStoreError::Storage("lease end out of range".to_string()))?;
        let result = sqlx::query(
            r#"
            UPDATE scheduled_job
            SET lock_expires = $3
            WHERE id = $1 AND (lock_expires IS NULL OR lock_expires < $2)
            "#,
        )
        .bind(id.0)
        .bind(now)
        .bind(until)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim", e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn delete_record(&self, id: JobId) -> Result<bool, JobStoreError> {
        let result = sqlx::query("DELETE FROM scheduled_job WHERE id = $1")
            .bind(id.0)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete", e))?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn reschedule_record(
        &self,
        id: JobId,
        next_due: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        let result = sqlx::query(
            "UPDATE scheduled_job SET due = $2, lock_expires = NULL WHERE id = $1",
        )
        .bind(id.0)
        .bind(next_due)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("reschedule", e))?;

        if result.rows_affected() == 0 {
            return Err(JobStoreError::NotFound(id));
        }
        Ok(())
    }

    #[instrument(skip(self, successor), fields(job_id = %id, recurring = successor.is_some()), err)]
    async fn complete_record(
        &self,
        id: JobId,
        successor: Option<JobRecord>,
    ) -> Result<bool, JobStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let deleted = sqlx::query("DELETE FROM scheduled_job WHERE id = $1")
            .bind(id.0)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("complete", e))?;

        if deleted.rows_affected() == 0 {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Ok(false);
        }

        if let Some(next) = successor {
            sqlx::query(
                r#"
                INSERT INTO scheduled_job (id, job_type, due, created, lock_expires)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(next.id.0)
            .bind(&next.job_type)
            .bind(next.due)
            .bind(next.created)
            .bind(next.lock_expires)
            .execute(&mut *tx)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                    JobStoreError::AlreadyExists(next.id)
                }
                other => map_sqlx_error("complete", other),
            })?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;
        Ok(true)
    }
}

impl JobStore for PostgresJobStore {
    fn insert(&self, record: JobRecord) -> Result<JobId, JobStoreError> {
        self.runtime.block_on(self.insert_record(record))
    }

    fn get(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
        self.runtime.block_on(self.get_record(id))
    }

    fn find_due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<JobRecord>, JobStoreError> {
        self.runtime.block_on(self.due_records(now))
    }

    fn find_by_type(&self, job_type: &str) -> Result<Vec<JobRecord>, JobStoreError> {
        self.runtime.block_on(self.records_of_type(job_type))
    }

    fn claim(&self, id: JobId, now: DateTime<Utc>, lease: Duration) -> Result<bool, JobStoreError> {
        self.runtime.block_on(self.claim_record(id, now, lease))
    }

    fn delete(&self, id: JobId) -> Result<bool, JobStoreError> {
        self.runtime.block_on(self.delete_record(id))
    }

    fn reschedule(&self, id: JobId, next_due: DateTime<Utc>) -> Result<(), JobStoreError> {
        self.runtime.block_on(self.reschedule_record(id, next_due))
    }

    fn complete(&self, id: JobId, successor: Option<JobRecord>) -> Result<bool, JobStoreError> {
        self.runtime.block_on(self.complete_record(id, successor))
    }
}

fn record_from_row(row: &sqlx::postgres::PgRow) -> Result<JobRecord, JobStoreError> {
    let decode = |e: sqlx::Error| JobStoreError::Storage(format!("failed to decode job row: {e}"));
    Ok(JobRecord {
        id: JobId::from_uuid(row.try_get("id").map_err(decode)?),
        job_type: row.try_get("job_type").map_err(decode)?,
        due: row.try_get("due").map_err(decode)?,
        created: row.try_get("created").map_err(decode)?,
        lock_expires: row.try_get("lock_expires").map_err(decode)?,
    })
}

/// Map SQLx errors to `JobStoreError`. See the module docs for the table.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => JobStoreError::Storage(format!(
            "database error in {}: {} (code {})",
            operation,
            db_err.message(),
            db_err.code().as_deref().unwrap_or("none")
        )),
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed during {operation}"))
        }
        other => JobStoreError::Storage(format!("{operation} failed: {other}")),
    }
}
