use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use cloudtasker_core::{Job, JobId, NewOutboxEntry, OutboxEntry, OutboxEntryId};

/// Store-level failure.
///
/// None of these say anything about whether a job exists; absence is reported
/// as `Ok(None)` by the read methods.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not begin, run or commit a transaction. Retry with backoff.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A uniqueness or integrity constraint rejected the write.
    #[error("store conflict: {0}")]
    Conflict(String),

    /// A stored row could not be decoded into a domain value.
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// An open atomic unit of work.
///
/// Dropping a transaction without calling [`commit`](StoreTransaction::commit)
/// rolls it back. This is what makes request deadlines safe: cancelling the
/// future that owns the transaction discards every staged write.
#[async_trait]
pub trait StoreTransaction: Send {
    /// Insert a new `PENDING` job; the store allocates its id.
    async fn insert_job(&mut self, payload: &str, now: DateTime<Utc>) -> Result<Job, StoreError>;

    /// Read a job and lock it against concurrent writers until commit.
    async fn lock_job(&mut self, id: JobId) -> Result<Option<Job>, StoreError>;

    /// Persist the mutable fields of a job (`status`, `result`, `updated_at`).
    async fn update_job(&mut self, job: &Job) -> Result<(), StoreError>;

    /// Append an undelivered outbox entry; the store allocates its id.
    async fn insert_outbox_entry(
        &mut self,
        entry: NewOutboxEntry,
    ) -> Result<OutboxEntryId, StoreError>;

    /// Flip `delivered` to true. Returns `false` when the entry was already
    /// delivered or no longer exists.
    async fn mark_delivered(
        &mut self,
        id: OutboxEntryId,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

/// Durable store shared by the task service and the relay.
#[async_trait]
pub trait Store: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError>;

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    /// Undelivered entries in ascending id order, at most `limit`. With `after`,
    /// only ids strictly greater; with `created_before`, only entries created
    /// at or before it. Never mutates.
    async fn fetch_undelivered(
        &self,
        after: Option<OutboxEntryId>,
        limit: usize,
        created_before: Option<DateTime<Utc>>,
    ) -> Result<Vec<OutboxEntry>, StoreError>;

    /// All entries (delivered or not) that reference `job_id`, ascending id order.
    async fn outbox_entries_for_job(&self, job_id: JobId) -> Result<Vec<OutboxEntry>, StoreError>;

    /// Delete delivered entries whose delivery happened before `delivered_before`.
    async fn purge_delivered(&self, delivered_before: DateTime<Utc>) -> Result<u64, StoreError>;
}

#[async_trait]
impl<S> Store for Arc<S>
where
    S: Store + ?Sized,
{
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        (**self).begin().await
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        (**self).get_job(id).await
    }

    async fn fetch_undelivered(
        &self,
        after: Option<OutboxEntryId>,
        limit: usize,
        created_before: Option<DateTime<Utc>>,
    ) -> Result<Vec<OutboxEntry>, StoreError> {
        (**self).fetch_undelivered(after, limit, created_before).await
    }

    async fn outbox_entries_for_job(&self, job_id: JobId) -> Result<Vec<OutboxEntry>, StoreError> {
        (**self).outbox_entries_for_job(job_id).await
    }

    async fn purge_delivered(&self, delivered_before: DateTime<Utc>) -> Result<u64, StoreError> {
        (**self).purge_delivered(delivered_before).await
    }
}
