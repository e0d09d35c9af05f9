use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};

use cloudtasker_core::{Job, JobId, NewOutboxEntry, OutboxEntry, OutboxEntryId};

use super::r#trait::{Store, StoreError, StoreTransaction};

#[derive(Debug, Clone, Default)]
struct State {
    jobs: BTreeMap<JobId, Job>,
    outbox: BTreeMap<OutboxEntryId, OutboxEntry>,
    last_job_id: i64,
    last_entry_id: i64,
}

#[derive(Debug, Default)]
struct Faults {
    unavailable: AtomicBool,
    commit_delay_ms: AtomicU64,
}

impl Faults {
    fn check(&self, operation: &str) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(format!(
                "in-memory store offline during {operation}"
            )));
        }
        Ok(())
    }
}

/// In-memory store.
///
/// Intended for tests/dev. Transactions are fully serialized: `begin` takes an
/// exclusive lock, writes are staged on a private copy of the state, and
/// `commit` installs the copy. A transaction that is dropped releases the lock
/// and its staged writes disappear.
///
/// Cloning yields a handle onto the same data, the way a second process would
/// see the same database.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<State>>,
    faults: Arc<Faults>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Simulate an outage: every operation fails with `Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.faults.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make every commit take at least `delay` before it is installed.
    pub fn set_commit_delay(&self, delay: Duration) {
        self.faults
            .commit_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub async fn job_count(&self) -> usize {
        self.state.lock().await.jobs.len()
    }

    pub async fn outbox_len(&self) -> usize {
        self.state.lock().await.outbox.len()
    }
}

/// Staged writes on top of a locked snapshot.
struct InMemoryTransaction {
    guard: OwnedMutexGuard<State>,
    staged: State,
    faults: Arc<Faults>,
}

#[async_trait]
impl StoreTransaction for InMemoryTransaction {
    async fn insert_job(&mut self, payload: &str, now: DateTime<Utc>) -> Result<Job, StoreError> {
        self.faults.check("insert_job")?;
        self.staged.last_job_id += 1;
        let job = Job::new(JobId::from_i64(self.staged.last_job_id), payload, now);
        self.staged.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn lock_job(&mut self, id: JobId) -> Result<Option<Job>, StoreError> {
        self.faults.check("lock_job")?;
        Ok(self.staged.jobs.get(&id).cloned())
    }

    async fn update_job(&mut self, job: &Job) -> Result<(), StoreError> {
        self.faults.check("update_job")?;
        match self.staged.jobs.get_mut(&job.id) {
            Some(stored) => {
                stored.status = job.status;
                stored.result = job.result.clone();
                stored.updated_at = job.updated_at;
                Ok(())
            }
            None => Err(StoreError::Conflict(format!(
                "update of missing job {}",
                job.id
            ))),
        }
    }

    async fn insert_outbox_entry(
        &mut self,
        entry: NewOutboxEntry,
    ) -> Result<OutboxEntryId, StoreError> {
        self.faults.check("insert_outbox_entry")?;
        if !self.staged.jobs.contains_key(&entry.job_id) {
            return Err(StoreError::Conflict(format!(
                "outbox entry references missing job {}",
                entry.job_id
            )));
        }
        self.staged.last_entry_id += 1;
        let id = OutboxEntryId::from_i64(self.staged.last_entry_id);
        self.staged.outbox.insert(id, OutboxEntry::from_new(id, entry));
        Ok(id)
    }

    async fn mark_delivered(
        &mut self,
        id: OutboxEntryId,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.faults.check("mark_delivered")?;
        match self.staged.outbox.get_mut(&id) {
            Some(entry) if !entry.delivered => {
                entry.delivered = true;
                entry.delivered_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        let delay = self.faults.commit_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.faults.check("commit")?;
        let staged = std::mem::take(&mut self.staged);
        *self.guard = staged;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        self.faults.check("begin")?;
        let guard = self.state.clone().lock_owned().await;
        let staged = guard.clone();
        Ok(Box::new(InMemoryTransaction {
            guard,
            staged,
            faults: self.faults.clone(),
        }))
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        self.faults.check("get_job")?;
        Ok(self.state.lock().await.jobs.get(&id).cloned())
    }

    async fn fetch_undelivered(
        &self,
        after: Option<OutboxEntryId>,
        limit: usize,
        created_before: Option<DateTime<Utc>>,
    ) -> Result<Vec<OutboxEntry>, StoreError> {
        self.faults.check("fetch_undelivered")?;
        let state = self.state.lock().await;
        Ok(state
            .outbox
            .values()
            .filter(|e| !e.delivered)
            .filter(|e| after.is_none_or(|cursor| e.id > cursor))
            .filter(|e| created_before.is_none_or(|cutoff| e.created_at <= cutoff))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn outbox_entries_for_job(&self, job_id: JobId) -> Result<Vec<OutboxEntry>, StoreError> {
        self.faults.check("outbox_entries_for_job")?;
        let state = self.state.lock().await;
        Ok(state
            .outbox
            .values()
            .filter(|e| e.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn purge_delivered(&self, delivered_before: DateTime<Utc>) -> Result<u64, StoreError> {
        self.faults.check("purge_delivered")?;
        let mut state = self.state.lock().await;
        let before = state.outbox.len();
        state
            .outbox
            .retain(|_, e| !(e.delivered && e.delivered_at.is_some_and(|at| at < delivered_before)));
        Ok((before - state.outbox.len()) as u64)
    }
}
