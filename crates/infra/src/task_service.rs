//! Task Service: the request-facing side of the system.
//!
//! Every operation runs as a single store transaction under a deadline:
//!
//! ```text
//! CreateTask(payload)
//!   ↓
//! 1. begin transaction
//!   ↓
//! 2. insert job (PENDING)
//!   ↓
//! 3. enqueue dispatch entry for that job
//!   ↓
//! 4. commit ── nothing is visible before this point, everything after it
//! ```
//!
//! Terminal status updates enqueue a completion entry in the same way. The
//! service never talks to the message bus; the relay does.
//!
//! A deadline that expires mid-operation drops the transaction, which rolls it
//! back. The caller sees `DeadlineExceeded` and no partial state remains.

use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use cloudtasker_core::{DomainError, Job, JobId, JobStatus, OutboxKind};
use cloudtasker_events::{JobMessage, MessageError};

use crate::jobs::{JobStore, JobStoreError, StatusChange};
use crate::outbox::Outbox;
use crate::store::{Store, StoreError};

/// Failure as seen by task service callers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TaskServiceError {
    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("invalid transition from {current} to {requested}")]
    InvalidTransition {
        current: JobStatus,
        requested: JobStatus,
    },

    #[error("validation failed: {0}")]
    Validation(String),

    /// The transaction could not begin or commit; retry with backoff.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    #[error("internal error: {0}")]
    Internal(String),
}

impl TaskServiceError {
    /// Failures that may succeed when retried unchanged.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TaskServiceError::StoreUnavailable(_) | TaskServiceError::DeadlineExceeded(_)
        )
    }
}

impl From<DomainError> for TaskServiceError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::NotFound(id) => TaskServiceError::NotFound(id),
            DomainError::InvalidTransition { current, requested } => {
                TaskServiceError::InvalidTransition { current, requested }
            }
            DomainError::Validation(msg) => TaskServiceError::Validation(msg),
        }
    }
}

impl From<StoreError> for TaskServiceError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Unavailable(msg) | StoreError::Conflict(msg) => {
                TaskServiceError::StoreUnavailable(msg)
            }
            StoreError::Corrupt(msg) => TaskServiceError::Internal(msg),
        }
    }
}

impl From<JobStoreError> for TaskServiceError {
    fn from(value: JobStoreError) -> Self {
        match value {
            JobStoreError::Domain(e) => e.into(),
            JobStoreError::Store(e) => e.into(),
        }
    }
}

impl From<MessageError> for TaskServiceError {
    fn from(value: MessageError) -> Self {
        TaskServiceError::Internal(value.to_string())
    }
}

/// `{job_id, status}` returned by create and update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TaskReceipt {
    pub job_id: JobId,
    pub status: JobStatus,
}

impl From<&Job> for TaskReceipt {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
        }
    }
}

/// Task Service over a durable store.
///
/// Collaborators are injected at construction; clones of a store handle are
/// shared with the relay, never any in-process state.
#[derive(Debug, Clone)]
pub struct TaskService<S> {
    store: S,
    jobs: JobStore<S>,
    outbox: Outbox<S>,
    default_timeout: Option<Duration>,
}

impl<S> TaskService<S>
where
    S: Store + Clone,
{
    pub fn new(store: S) -> Self {
        Self {
            jobs: JobStore::new(store.clone()),
            outbox: Outbox::new(store.clone()),
            store,
            default_timeout: None,
        }
    }

    /// Deadline applied when a call does not bring its own.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    /// Record a new job and its dispatch notification atomically.
    pub async fn create_task(
        &self,
        payload: impl Into<String>,
        timeout: Option<Duration>,
    ) -> Result<TaskReceipt, TaskServiceError> {
        let payload = payload.into();
        if payload.is_empty() {
            return Err(TaskServiceError::Validation("No payload provided".into()));
        }

        let job = self
            .within("create_task", timeout, async {
                let mut tx = self.store.begin().await?;
                let job = self.jobs.create_job(tx.as_mut(), &payload).await?;
                let message = JobMessage::dispatch(&job).encode()?;
                self.outbox
                    .enqueue(tx.as_mut(), job.id, OutboxKind::Dispatch, message)
                    .await?;
                tx.commit().await?;
                Ok::<_, TaskServiceError>(job)
            })
            .await?;

        info!(job_id = %job.id, "task created");
        Ok(TaskReceipt::from(&job))
    }

    /// Read-only lookup. Unknown ids are `NotFound`, never an empty record.
    pub async fn get_task(
        &self,
        job_id: JobId,
        timeout: Option<Duration>,
    ) -> Result<Job, TaskServiceError> {
        self.within("get_task", timeout, async {
            Ok::<_, TaskServiceError>(self.jobs.get_job(job_id).await?)
        })
        .await
    }

    /// Apply a status reported by a worker.
    pub async fn update_task_status(
        &self,
        job_id: JobId,
        status: JobStatus,
        result: Option<String>,
        timeout: Option<Duration>,
    ) -> Result<TaskReceipt, TaskServiceError> {
        let change = self.transition(job_id, status, result, timeout).await?;
        Ok(TaskReceipt::from(&change.job))
    }

    /// Like `update_task_status`, but tells the caller whether this call made
    /// the change or found it already applied. Workers use this to claim jobs.
    pub async fn transition(
        &self,
        job_id: JobId,
        status: JobStatus,
        result: Option<String>,
        timeout: Option<Duration>,
    ) -> Result<StatusChange, TaskServiceError> {
        let change = self
            .within("update_task_status", timeout, async {
                let mut tx = self.store.begin().await?;
                let change = self
                    .jobs
                    .update_status(tx.as_mut(), job_id, status, result)
                    .await?;

                if change.applied() && change.job.status.is_terminal() {
                    let message = JobMessage::completion(&change.job).encode()?;
                    self.outbox
                        .enqueue(tx.as_mut(), job_id, OutboxKind::Completion, message)
                        .await?;
                }

                tx.commit().await?;
                Ok::<_, TaskServiceError>(change)
            })
            .await?;

        if change.applied() {
            info!(job_id = %job_id, status = %change.job.status, "task status updated");
        }
        Ok(change)
    }

    async fn within<T, F>(
        &self,
        operation: &'static str,
        timeout: Option<Duration>,
        fut: F,
    ) -> Result<T, TaskServiceError>
    where
        F: Future<Output = Result<T, TaskServiceError>>,
    {
        let Some(limit) = timeout.or(self.default_timeout) else {
            return fut.await;
        };

        match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    operation,
                    timeout_ms = limit.as_millis() as u64,
                    "deadline exceeded; transaction rolled back"
                );
                Err(TaskServiceError::DeadlineExceeded(limit))
            }
        }
    }
}
