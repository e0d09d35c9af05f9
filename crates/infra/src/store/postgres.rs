//! Postgres-backed store.
//!
//! ## Schema
//!
//! ```text
//! jobs   (id BIGSERIAL PK, payload, status, result, created_at, updated_at)
//! outbox (id BIGSERIAL PK, job_id -> jobs.id, kind, message_payload BYTEA,
//!         delivered, created_at, delivered_at)
//! ```
//!
//! `ensure_schema()` creates both tables when missing. Sequence ids are never
//! reused, so entry order is insertion order even across rolled-back inserts.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (foreign key violation) | `23503` | `Conflict` |
//! | Database (check constraint violation) | `23514` | `Conflict` |
//! | Database (other) | Any other | `Unavailable` |
//! | PoolClosed / PoolTimedOut / Io | N/A | `Unavailable` |
//! | ColumnDecode / Decode | N/A | `Corrupt` |
//!
//! ## Locking
//!
//! Status updates read the row with `SELECT ... FOR UPDATE`, which serializes
//! concurrent writers on the same job until commit. Reads outside a
//! transaction take no locks.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::instrument;

use cloudtasker_core::{
    Job, JobId, JobStatus, NewOutboxEntry, OutboxEntry, OutboxEntryId, OutboxKind,
};

use super::r#trait::{Store, StoreError, StoreTransaction};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id          BIGSERIAL PRIMARY KEY,
        payload     TEXT NOT NULL,
        status      TEXT NOT NULL
                    CHECK (status IN ('PENDING', 'DISPATCHED', 'RUNNING', 'SUCCEEDED', 'FAILED')),
        result      TEXT,
        created_at  TIMESTAMPTZ NOT NULL,
        updated_at  TIMESTAMPTZ NOT NULL,
        CHECK (updated_at >= created_at)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS outbox (
        id               BIGSERIAL PRIMARY KEY,
        job_id           BIGINT NOT NULL REFERENCES jobs (id) ON DELETE CASCADE,
        kind             TEXT NOT NULL CHECK (kind IN ('dispatch', 'completion')),
        message_payload  BYTEA NOT NULL,
        delivered        BOOLEAN NOT NULL DEFAULT FALSE,
        created_at       TIMESTAMPTZ NOT NULL,
        delivered_at     TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS outbox_undelivered_idx
        ON outbox (id) WHERE NOT delivered
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS outbox_job_id_idx ON outbox (job_id)
    "#,
];

const JOB_COLUMNS: &str = "id, payload, status, result, created_at, updated_at";
const OUTBOX_COLUMNS: &str =
    "id, job_id, kind, message_payload, delivered, created_at, delivered_at";

/// Postgres-backed job + outbox store.
///
/// `Send + Sync`; clones share the same connection pool.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: Arc<PgPool>,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Open a pool against `database_url`.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create the `jobs` and `outbox` tables if they do not exist yet.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }
}

struct PostgresTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTransaction for PostgresTransaction {
    async fn insert_job(&mut self, payload: &str, now: DateTime<Utc>) -> Result<Job, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO jobs (payload, status, result, created_at, updated_at)
            VALUES ($1, $2, NULL, $3, $3)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(payload)
        .bind(JobStatus::Pending.as_str())
        .bind(now)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_job", e))?;

        decode_job(&row)
    }

    async fn lock_job(&mut self, id: JobId) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1 FOR UPDATE"
        ))
        .bind(id.as_i64())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("lock_job", e))?;

        row.as_ref().map(decode_job).transpose()
    }

    async fn update_job(&mut self, job: &Job) -> Result<(), StoreError> {
        let done = sqlx::query(
            r#"
            UPDATE jobs
            SET status = $2, result = $3, updated_at = $4
            WHERE id = $1
            "#,
        )
        .bind(job.id.as_i64())
        .bind(job.status.as_str())
        .bind(job.result.as_deref())
        .bind(job.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("update_job", e))?;

        if done.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!(
                "update of missing job {}",
                job.id
            )));
        }
        Ok(())
    }

    async fn insert_outbox_entry(
        &mut self,
        entry: NewOutboxEntry,
    ) -> Result<OutboxEntryId, StoreError> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO outbox (job_id, kind, message_payload, delivered, created_at)
            VALUES ($1, $2, $3, FALSE, $4)
            RETURNING id
            "#,
        )
        .bind(entry.job_id.as_i64())
        .bind(entry.kind.as_str())
        .bind(&entry.message_payload)
        .bind(entry.created_at)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_outbox_entry", e))?;

        Ok(OutboxEntryId::from_i64(id))
    }

    async fn mark_delivered(
        &mut self,
        id: OutboxEntryId,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let done = sqlx::query(
            "UPDATE outbox SET delivered = TRUE, delivered_at = $2 WHERE id = $1 AND NOT delivered",
        )
        .bind(id.as_i64())
        .bind(at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("mark_delivered", e))?;

        Ok(done.rows_affected() == 1)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;
        Ok(Box::new(PostgresTransaction { tx }))
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get_job(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(id.as_i64())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;

        row.as_ref().map(decode_job).transpose()
    }

    #[instrument(skip(self), err)]
    async fn fetch_undelivered(
        &self,
        after: Option<OutboxEntryId>,
        limit: usize,
        created_before: Option<DateTime<Utc>>,
    ) -> Result<Vec<OutboxEntry>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {OUTBOX_COLUMNS}
            FROM outbox
            WHERE NOT delivered
              AND ($2::timestamptz IS NULL OR created_at <= $2)
              AND ($3::bigint IS NULL OR id > $3)
            ORDER BY id ASC
            LIMIT $1
            "#
        ))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .bind(created_before)
        .bind(after.map(|id| id.as_i64()))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fetch_undelivered", e))?;

        rows.iter().map(decode_entry).collect()
    }

    async fn outbox_entries_for_job(&self, job_id: JobId) -> Result<Vec<OutboxEntry>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM outbox WHERE job_id = $1 ORDER BY id ASC"
        ))
        .bind(job_id.as_i64())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("outbox_entries_for_job", e))?;

        rows.iter().map(decode_entry).collect()
    }

    #[instrument(skip(self), err)]
    async fn purge_delivered(&self, delivered_before: DateTime<Utc>) -> Result<u64, StoreError> {
        let done = sqlx::query("DELETE FROM outbox WHERE delivered AND delivered_at < $1")
            .bind(delivered_before)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("purge_delivered", e))?;

        Ok(done.rows_affected())
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                // unique, foreign key, check
                Some("23505") | Some("23503") | Some("23514") => StoreError::Conflict(msg),
                _ => StoreError::Unavailable(msg),
            }
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::Corrupt(format!("failed to decode row in {}: {}", operation, err))
        }
        sqlx::Error::PoolClosed => {
            StoreError::Unavailable(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::PoolTimedOut => {
            StoreError::Unavailable(format!("connection pool timed out in {}", operation))
        }
        _ => StoreError::Unavailable(format!("sqlx error in {}: {}", operation, err)),
    }
}

// SQLx row types

#[derive(Debug)]
struct JobRow {
    id: i64,
    payload: String,
    status: String,
    result: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            payload: row.try_get("payload")?,
            status: row.try_get("status")?,
            result: row.try_get("result")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status = JobStatus::parse(&row.status).ok_or_else(|| {
            StoreError::Corrupt(format!("job {} has unknown status {:?}", row.id, row.status))
        })?;
        Ok(Job {
            id: JobId::from_i64(row.id),
            payload: row.payload,
            status,
            result: row.result,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug)]
struct OutboxRow {
    id: i64,
    job_id: i64,
    kind: String,
    message_payload: Vec<u8>,
    delivered: bool,
    created_at: DateTime<Utc>,
    delivered_at: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, PgRow> for OutboxRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(OutboxRow {
            id: row.try_get("id")?,
            job_id: row.try_get("job_id")?,
            kind: row.try_get("kind")?,
            message_payload: row.try_get("message_payload")?,
            delivered: row.try_get("delivered")?,
            created_at: row.try_get("created_at")?,
            delivered_at: row.try_get("delivered_at")?,
        })
    }
}

impl TryFrom<OutboxRow> for OutboxEntry {
    type Error = StoreError;

    fn try_from(row: OutboxRow) -> Result<Self, Self::Error> {
        let kind = OutboxKind::parse(&row.kind).ok_or_else(|| {
            StoreError::Corrupt(format!("outbox entry {} has unknown kind {:?}", row.id, row.kind))
        })?;
        Ok(OutboxEntry {
            id: OutboxEntryId::from_i64(row.id),
            job_id: JobId::from_i64(row.job_id),
            kind,
            message_payload: row.message_payload,
            delivered: row.delivered,
            created_at: row.created_at,
            delivered_at: row.delivered_at,
        })
    }
}

fn decode_job(row: &PgRow) -> Result<Job, StoreError> {
    JobRow::from_row(row)
        .map_err(|e| StoreError::Corrupt(format!("failed to deserialize job row: {}", e)))?
        .try_into()
}

fn decode_entry(row: &PgRow) -> Result<OutboxEntry, StoreError> {
    OutboxRow::from_row(row)
        .map_err(|e| StoreError::Corrupt(format!("failed to deserialize outbox row: {}", e)))?
        .try_into()
}
