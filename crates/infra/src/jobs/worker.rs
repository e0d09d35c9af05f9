//! Task worker: the consuming side of dispatch notifications.
//!
//! For every `dispatch` message the worker
//!
//! 1. reads the job (it always exists: the notification was committed with it)
//! 2. claims it: `PENDING -> DISPATCHED` if the relay's confirmation has not
//!    landed yet, then `DISPATCHED -> RUNNING`
//! 3. runs the registered handler on the payload
//! 4. reports `SUCCEEDED` with the handler output, or `FAILED` with
//!    `{"error": "..."}`
//! 5. acks the delivery
//!
//! Delivery is at-least-once, so duplicates are expected. A message for a job
//! that is already `RUNNING` or terminal, or whose claim another worker won,
//! is acknowledged and skipped.
//!
//! ## Transient failures
//!
//! `StoreUnavailable` and `DeadlineExceeded` are retried with exponential
//! backoff. Reading and claiming give up after `max_attempts` and `nack` the
//! delivery so the bus hands it out again. Reporting the outcome of a handler
//! that already ran is retried until it lands or the worker shuts down, since
//! a redelivery would find the job `RUNNING` and skip it.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use cloudtasker_core::{Job, JobId, JobStatus};
use cloudtasker_events::{Delivery, JobMessage, Subscription};

use crate::store::Store;
use crate::task_service::{TaskService, TaskServiceError};

/// Task handler function type. `Ok` carries the result to store.
pub type TaskHandler = Arc<dyn Fn(&Job) -> Result<String, String> + Send + Sync>;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct TaskWorkerConfig {
    /// Name for logging
    pub name: String,
    /// How long to wait for a message before re-checking for shutdown
    pub idle_tick: Duration,
    /// Deadline for each status update the worker sends
    pub update_timeout: Option<Duration>,
    /// Attempts at reading and claiming a job before the delivery is nacked
    pub max_attempts: u32,
    /// First retry delay; doubles per attempt
    pub retry_backoff: Duration,
    /// Upper bound on a single retry delay
    pub max_retry_backoff: Duration,
}

impl Default for TaskWorkerConfig {
    fn default() -> Self {
        Self {
            name: "task-worker".to_string(),
            idle_tick: Duration::from_millis(250),
            update_timeout: Some(Duration::from_secs(5)),
            max_attempts: 5,
            retry_backoff: Duration::from_millis(100),
            max_retry_backoff: Duration::from_secs(5),
        }
    }
}

impl TaskWorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_retry(mut self, max_attempts: u32, backoff: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.retry_backoff = backoff;
        self
    }

    fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.retry_backoff
            .saturating_mul(factor)
            .min(self.max_retry_backoff)
    }
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub messages_received: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub duplicates_skipped: u64,
    pub malformed_messages: u64,
    pub errors: u64,
    pub retries: u64,
    pub redeliveries: u64,
}

#[derive(Debug, Default)]
struct WorkerCounters {
    messages_received: AtomicU64,
    jobs_succeeded: AtomicU64,
    jobs_failed: AtomicU64,
    duplicates_skipped: AtomicU64,
    malformed_messages: AtomicU64,
    errors: AtomicU64,
    retries: AtomicU64,
    redeliveries: AtomicU64,
}

impl WorkerCounters {
    fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            jobs_succeeded: self.jobs_succeeded.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            duplicates_skipped: self.duplicates_skipped.load(Ordering::Relaxed),
            malformed_messages: self.malformed_messages.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            redeliveries: self.redeliveries.load(Ordering::Relaxed),
        }
    }
}

/// What handling one message amounted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    Succeeded,
    Failed,
    Duplicate,
    /// Not a dispatch message.
    Ignored,
}

/// Handle to control a running worker.
#[derive(Debug)]
pub struct TaskWorkerHandle {
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
    counters: Arc<WorkerCounters>,
}

impl TaskWorkerHandle {
    /// Request graceful shutdown. The job in progress, if any, is finished first.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }

    pub fn stats(&self) -> WorkerStats {
        self.counters.snapshot()
    }
}

/// Consumes dispatch notifications and drives jobs to a terminal status.
pub struct TaskWorker<S> {
    service: Arc<TaskService<S>>,
    handler: TaskHandler,
    config: TaskWorkerConfig,
    counters: Arc<WorkerCounters>,
}

impl<S> TaskWorker<S>
where
    S: Store + Clone + 'static,
{
    pub fn new<F>(service: Arc<TaskService<S>>, config: TaskWorkerConfig, handler: F) -> Self
    where
        F: Fn(&Job) -> Result<String, String> + Send + Sync + 'static,
    {
        Self {
            service,
            handler: Arc::new(handler),
            config,
            counters: Arc::new(WorkerCounters::default()),
        }
    }

    pub fn stats(&self) -> WorkerStats {
        self.counters.snapshot()
    }

    /// Handle one raw bus message, retrying transient store failures.
    ///
    /// An `Err` that `is_transient()` means the message should be delivered
    /// again later.
    pub async fn handle_message(&self, bytes: &[u8]) -> Result<MessageOutcome, TaskServiceError> {
        let (_hold, mut never) = watch::channel(false);
        self.handle(bytes, &mut never).await
    }

    async fn handle(
        &self,
        bytes: &[u8],
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<MessageOutcome, TaskServiceError> {
        self.counters
            .messages_received
            .fetch_add(1, Ordering::Relaxed);

        let message = match JobMessage::decode(bytes) {
            Ok(message) => message,
            Err(err) => {
                self.counters
                    .malformed_messages
                    .fetch_add(1, Ordering::Relaxed);
                warn!(worker = %self.config.name, error = %err, "dropping malformed message");
                return Ok(MessageOutcome::Ignored);
            }
        };

        let JobMessage::Dispatch { job_id, .. } = message else {
            return Ok(MessageOutcome::Ignored);
        };

        let outcome = self.process(job_id, shutdown).await;
        match &outcome {
            Ok(MessageOutcome::Succeeded) => {
                self.counters.jobs_succeeded.fetch_add(1, Ordering::Relaxed);
            }
            Ok(MessageOutcome::Failed) => {
                self.counters.jobs_failed.fetch_add(1, Ordering::Relaxed);
            }
            Ok(MessageOutcome::Duplicate) => {
                self.counters
                    .duplicates_skipped
                    .fetch_add(1, Ordering::Relaxed);
            }
            Ok(MessageOutcome::Ignored) => {}
            Err(_) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
            }
        }
        outcome
    }

    async fn process(
        &self,
        job_id: JobId,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<MessageOutcome, TaskServiceError> {
        let timeout = self.config.update_timeout;
        let service = &self.service;
        let max_attempts = Some(self.config.max_attempts);

        let job = self
            .retry(job_id, "read", max_attempts, shutdown, move || {
                service.get_task(job_id, timeout)
            })
            .await?;

        let this = self;
        let claimed = &job;
        let won = self
            .retry(job_id, "claim", max_attempts, shutdown, move || {
                this.claim(claimed)
            })
            .await?;
        if !won {
            debug!(worker = %self.config.name, job_id = %job_id, status = %job.status, "skipping duplicate delivery");
            return Ok(MessageOutcome::Duplicate);
        }

        info!(worker = %self.config.name, job_id = %job_id, "processing job");

        let handler = self.handler.clone();
        let outcome = tokio::task::spawn_blocking(move || handler(&job))
            .await
            .unwrap_or_else(|join_err| Err(format!("handler panicked: {join_err}")));

        let (status, result) = match outcome {
            Ok(output) => (JobStatus::Succeeded, output),
            Err(message) => {
                warn!(worker = %self.config.name, job_id = %job_id, error = %message, "job failed");
                (
                    JobStatus::Failed,
                    serde_json::json!({ "error": message }).to_string(),
                )
            }
        };

        if let Err(err) = self
            .retry(job_id, "report", None, shutdown, move || {
                service.update_task_status(job_id, status, Some(result.clone()), timeout)
            })
            .await
        {
            error!(
                worker = %self.config.name,
                job_id = %job_id,
                status = %status,
                error = %err,
                "could not record job outcome; job left RUNNING"
            );
            return Err(err);
        }

        Ok(if status == JobStatus::Succeeded {
            MessageOutcome::Succeeded
        } else {
            MessageOutcome::Failed
        })
    }

    /// Run `op` until it succeeds, fails for good, runs out of attempts, or
    /// shutdown is requested. `None` attempts means no limit.
    async fn retry<T, F, Fut>(
        &self,
        job_id: JobId,
        step: &'static str,
        max_attempts: Option<u32>,
        shutdown: &mut watch::Receiver<bool>,
        mut op: F,
    ) -> Result<T, TaskServiceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TaskServiceError>>,
    {
        let mut attempt = 1u32;
        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let exhausted = max_attempts.is_some_and(|max| attempt >= max);
            if !err.is_transient() || exhausted || *shutdown.borrow() {
                return Err(err);
            }

            let delay = self.config.backoff_for(attempt);
            self.counters.retries.fetch_add(1, Ordering::Relaxed);
            warn!(
                worker = %self.config.name,
                job_id = %job_id,
                step,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "transient failure; retrying"
            );
            attempt += 1;

            tokio::select! {
                biased;
                _ = shutdown.changed() => return Err(err),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Move the job to `RUNNING`. `false` means someone else already did.
    async fn claim(&self, job: &Job) -> Result<bool, TaskServiceError> {
        let timeout = self.config.update_timeout;
        match job.status {
            JobStatus::Pending => {
                match self
                    .service
                    .transition(job.id, JobStatus::Dispatched, None, timeout)
                    .await
                {
                    Ok(_) => {}
                    Err(TaskServiceError::InvalidTransition { .. }) => return Ok(false),
                    Err(err) => return Err(err),
                }
            }
            JobStatus::Dispatched => {}
            JobStatus::Running | JobStatus::Succeeded | JobStatus::Failed => return Ok(false),
        }

        match self
            .service
            .transition(job.id, JobStatus::Running, None, timeout)
            .await
        {
            Ok(change) => Ok(change.applied()),
            // Raced past RUNNING by another worker.
            Err(TaskServiceError::InvalidTransition { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Spawn the worker loop over `subscription` on the current tokio runtime.
    pub fn spawn(self, subscription: Subscription) -> TaskWorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let counters = self.counters.clone();
        let join = tokio::spawn(self.run(subscription, shutdown_rx));

        TaskWorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            counters,
        }
    }

    async fn run(self, mut subscription: Subscription, mut shutdown: watch::Receiver<bool>) {
        info!(worker = %self.config.name, "task worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let received = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                received = subscription.recv_timeout(self.config.idle_tick) => received,
            };

            match received {
                Ok(Some(delivery)) => {
                    if !self.settle(delivery, &mut shutdown).await {
                        // Give the store a moment before the redelivery arrives.
                        tokio::select! {
                            biased;
                            _ = shutdown.changed() => break,
                            _ = tokio::time::sleep(self.config.retry_backoff) => {}
                        }
                    }
                }
                Ok(None) => {
                    warn!(worker = %self.config.name, "bus closed; stopping");
                    break;
                }
                Err(_) => continue,
            }
        }

        info!(worker = %self.config.name, "task worker stopped");
    }

    /// Handle and settle one delivery. `false` if it was handed back to the bus.
    async fn settle(&self, delivery: Delivery, shutdown: &mut watch::Receiver<bool>) -> bool {
        match self.handle(delivery.payload(), shutdown).await {
            Ok(_) => {
                delivery.ack();
                true
            }
            Err(err) if err.is_transient() => {
                self.counters.redeliveries.fetch_add(1, Ordering::Relaxed);
                warn!(worker = %self.config.name, error = %err, "returning message to the bus");
                delivery.nack();
                false
            }
            Err(err) => {
                // Retrying cannot help (unknown job, corrupt row); drop it.
                error!(worker = %self.config.name, error = %err, "failed to process message");
                delivery.ack();
                true
            }
        }
    }
}

/// Handler used when nothing more specific is configured: acknowledges the
/// payload and records when it was processed.
pub fn default_handler(job: &Job) -> Result<String, String> {
    Ok(serde_json::json!({
        "status": "success",
        "processed_at": chrono::Utc::now().to_rfc3339(),
        "payload_bytes": job.payload.len(),
    })
    .to_string())
}

/// Example handler that routes on the payload's `type` field.
///
/// Expects `{"type": "...", "data": ...}`. Knows `process_data` and
/// `generate_report`; anything else fails the job.
pub fn task_type_handler(job: &Job) -> Result<String, String> {
    let payload: serde_json::Value = serde_json::from_str(&job.payload)
        .map_err(|_| "payload must be a JSON object".to_string())?;
    let Some(fields) = payload.as_object() else {
        return Err("payload must be a JSON object".into());
    };

    let data = fields.get("data").cloned().unwrap_or(serde_json::Value::Null);
    let output = match fields.get("type").and_then(|t| t.as_str()) {
        Some("process_data") => {
            let items = match &data {
                serde_json::Value::Array(items) => items.len(),
                serde_json::Value::Object(map) => map.len(),
                serde_json::Value::String(text) => text.chars().count(),
                _ => 0,
            };
            serde_json::json!({
                "status": "success",
                "processed_items": items,
                "summary": "Data processed successfully",
            })
        }
        Some("generate_report") => serde_json::json!({
            "status": "success",
            "report_url": format!("https://example.com/reports/{}", job.id),
            "summary": "Report generated successfully",
        }),
        Some(other) => return Err(format!("unknown task type: {other}")),
        None => return Err("unknown task type: missing `type` field".into()),
    };
    Ok(output.to_string())
}
