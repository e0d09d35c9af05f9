//! Outbox relay: drains committed entries onto the message bus.
//!
//! Per cycle:
//!
//! 1. fetch a bounded batch of undelivered entries in id order, resuming after
//!    the last entry the previous cycle looked at
//! 2. publish each one, giving up on an entry after `publish_timeout`
//! 3. on acknowledgment, mark it delivered (and, for dispatch entries, move the
//!    job `PENDING -> DISPATCHED` in the same transaction)
//! 4. on failure, back the entry off exponentially; once it is older than
//!    `stale_after`, emit a stuck-dispatch alert
//!
//! A batch shorter than `batch_size` ends a sweep and the next cycle starts
//! again from the oldest entry. Entries that keep failing therefore never hide
//! the ones behind them, and every undelivered entry is checked for staleness
//! once per sweep, whether it was attempted or still backing off.
//!
//! The relay shares nothing with request handling except the store. Running
//! several relays against one store is safe: a redundant publish is a duplicate
//! the consumers already tolerate, and `mark_delivered` is idempotent.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use cloudtasker_core::{DomainError, JobStatus, OutboxEntry, OutboxEntryId, OutboxKind};
use cloudtasker_events::{BusError, MessageBus};

use super::Outbox;
use crate::jobs::{JobStore, JobStoreError};
use crate::store::{Store, StoreError};

/// Relay-internal failure. Never surfaced to task service callers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    #[error("bus unavailable: {0}")]
    BusUnavailable(#[from] BusError),

    #[error("publish not acknowledged within {0:?}")]
    PublishTimeout(Duration),
}

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Name for logging
    pub name: String,
    /// Entries fetched per cycle
    pub batch_size: usize,
    /// Sleep between cycles when there is no backlog
    pub poll_interval: Duration,
    /// Per-entry bound on a publish call
    pub publish_timeout: Duration,
    /// Undelivered entries older than this raise a stuck-dispatch alert
    pub stale_after: Duration,
    /// Only pick up entries at least this old
    pub min_entry_age: Option<Duration>,
    /// Delete delivered entries after this long; `None` keeps them forever
    pub retention: Option<Duration>,
    /// Minimum time between purges
    pub purge_interval: Duration,
    /// Wait before retrying an entry after its first failed publish
    pub retry_backoff: Duration,
    /// Cap for the doubling retry wait
    pub max_retry_backoff: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            name: "outbox-relay".to_string(),
            batch_size: 100,
            poll_interval: Duration::from_millis(500),
            publish_timeout: Duration::from_secs(2),
            stale_after: Duration::from_secs(60),
            min_entry_age: None,
            retention: Some(Duration::from_secs(24 * 60 * 60)),
            purge_interval: Duration::from_secs(60),
            retry_backoff: Duration::from_secs(1),
            max_retry_backoff: Duration::from_secs(60),
        }
    }
}

impl RelayConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    pub fn with_stale_after(mut self, threshold: Duration) -> Self {
        self.stale_after = threshold;
        self
    }

    pub fn with_min_entry_age(mut self, age: Duration) -> Self {
        self.min_entry_age = Some(age);
        self
    }

    pub fn with_retention(mut self, retention: Option<Duration>) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_retry_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.retry_backoff = initial;
        self.max_retry_backoff = max.max(initial);
        self
    }

    /// Wait after the `failures`-th consecutive failure of one entry.
    fn backoff_for(&self, failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(failures.saturating_sub(1));
        self.retry_backoff
            .saturating_mul(factor)
            .min(self.max_retry_backoff)
    }
}

/// What one cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub fetched: usize,
    pub published: usize,
    pub publish_failures: usize,
    pub publish_timeouts: usize,
    pub mark_failures: usize,
    /// Entries skipped because they are still backing off
    pub deferred: usize,
    pub stale: usize,
    /// This cycle reached the end of the backlog
    pub sweep_finished: bool,
}

#[derive(Debug, Clone, Copy)]
struct EntryBackoff {
    failures: u32,
    next_attempt: Instant,
}

/// Position in the current pass over the backlog plus per-entry retry state.
#[derive(Debug, Default)]
struct Sweep {
    cursor: Option<OutboxEntryId>,
    backoff: HashMap<OutboxEntryId, EntryBackoff>,
    seen: HashSet<OutboxEntryId>,
}

impl Sweep {
    fn advance(&mut self, batch: &[OutboxEntry], batch_size: usize) -> bool {
        self.seen.extend(batch.iter().map(|e| e.id));
        match batch.last() {
            Some(last) if batch.len() >= batch_size => {
                self.cursor = Some(last.id);
                false
            }
            _ => {
                // Entries not seen in a whole pass were delivered elsewhere.
                let seen = std::mem::take(&mut self.seen);
                self.backoff.retain(|id, _| seen.contains(id));
                self.cursor = None;
                true
            }
        }
    }
}

/// Relay runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RelayStats {
    pub cycles: u64,
    pub published: u64,
    pub publish_failures: u64,
    pub publish_timeouts: u64,
    pub mark_failures: u64,
    pub deferred: u64,
    pub stale_entries: u64,
    pub purged: u64,
}

#[derive(Debug, Default)]
struct RelayCounters {
    cycles: AtomicU64,
    published: AtomicU64,
    publish_failures: AtomicU64,
    publish_timeouts: AtomicU64,
    mark_failures: AtomicU64,
    deferred: AtomicU64,
    stale_entries: AtomicU64,
    purged: AtomicU64,
}

impl RelayCounters {
    fn record(&self, report: &CycleReport) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        self.published
            .fetch_add(report.published as u64, Ordering::Relaxed);
        self.publish_failures
            .fetch_add(report.publish_failures as u64, Ordering::Relaxed);
        self.publish_timeouts
            .fetch_add(report.publish_timeouts as u64, Ordering::Relaxed);
        self.mark_failures
            .fetch_add(report.mark_failures as u64, Ordering::Relaxed);
        self.deferred
            .fetch_add(report.deferred as u64, Ordering::Relaxed);
        self.stale_entries
            .fetch_add(report.stale as u64, Ordering::Relaxed);
    }

    fn snapshot(&self) -> RelayStats {
        RelayStats {
            cycles: self.cycles.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            publish_timeouts: self.publish_timeouts.load(Ordering::Relaxed),
            mark_failures: self.mark_failures.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
            stale_entries: self.stale_entries.load(Ordering::Relaxed),
            purged: self.purged.load(Ordering::Relaxed),
        }
    }
}

/// Handle to control a running relay.
///
/// Dropping the handle without calling `shutdown` also stops the relay.
#[derive(Debug)]
pub struct RelayHandle {
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
    counters: Arc<RelayCounters>,
}

impl RelayHandle {
    /// Request graceful shutdown and wait for the loop to exit.
    ///
    /// A publish still in flight is abandoned; its entry stays undelivered and
    /// is picked up again by the next relay.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }

    /// Get current relay statistics.
    pub fn stats(&self) -> RelayStats {
        self.counters.snapshot()
    }
}

/// Background relay from the outbox to a message bus.
pub struct Relay<S, B> {
    store: S,
    outbox: Outbox<S>,
    jobs: JobStore<S>,
    bus: B,
    config: RelayConfig,
    counters: Arc<RelayCounters>,
    sweep: Mutex<Sweep>,
}

impl<S, B> Relay<S, B>
where
    S: Store + Clone + 'static,
    B: MessageBus + 'static,
{
    pub fn new(store: S, bus: B, config: RelayConfig) -> Self {
        Self {
            outbox: Outbox::new(store.clone()),
            jobs: JobStore::new(store.clone()),
            store,
            bus,
            config,
            counters: Arc::new(RelayCounters::default()),
            sweep: Mutex::new(Sweep::default()),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn stats(&self) -> RelayStats {
        self.counters.snapshot()
    }

    /// Run a single drain cycle.
    ///
    /// Only a failed fetch is an error; per-entry failures are counted in the
    /// report and retried once their backoff has passed.
    pub async fn run_once(&self) -> Result<CycleReport, RelayError> {
        let cursor = self.lock_sweep().cursor;
        let batch = self
            .outbox
            .fetch_undelivered_after(cursor, self.config.batch_size, self.config.min_entry_age)
            .await?;
        let sweep_finished = self.lock_sweep().advance(&batch, self.config.batch_size);

        let mut report = CycleReport {
            fetched: batch.len(),
            sweep_finished,
            ..CycleReport::default()
        };

        for entry in &batch {
            if self.backing_off(entry.id) {
                report.deferred += 1;
                self.check_stale(entry, &mut report);
                continue;
            }

            let delivered = match self.publish(entry).await {
                Ok(()) => match self.confirm(entry).await {
                    Ok(()) => {
                        report.published += 1;
                        true
                    }
                    Err(err) => {
                        // Published but not recorded: the next cycle sends it again.
                        report.mark_failures += 1;
                        warn!(
                            relay = %self.config.name,
                            entry_id = %entry.id,
                            job_id = %entry.job_id,
                            error = %err,
                            "failed to mark outbox entry delivered"
                        );
                        false
                    }
                },
                Err(RelayError::PublishTimeout(limit)) => {
                    report.publish_timeouts += 1;
                    warn!(
                        relay = %self.config.name,
                        entry_id = %entry.id,
                        job_id = %entry.job_id,
                        timeout_ms = limit.as_millis() as u64,
                        "publish timed out; moving to next entry"
                    );
                    false
                }
                Err(err) => {
                    report.publish_failures += 1;
                    warn!(
                        relay = %self.config.name,
                        entry_id = %entry.id,
                        job_id = %entry.job_id,
                        error = %err,
                        "publish failed; entry left for retry"
                    );
                    false
                }
            };

            self.record_attempt(entry.id, delivered);
            if !delivered {
                self.check_stale(entry, &mut report);
            }
        }

        self.counters.record(&report);
        if report.fetched > 0 {
            debug!(relay = %self.config.name, ?report, "relay cycle finished");
        }
        Ok(report)
    }

    async fn publish(&self, entry: &OutboxEntry) -> Result<(), RelayError> {
        let limit = self.config.publish_timeout;
        match tokio::time::timeout(limit, self.bus.publish(&entry.message_payload)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(RelayError::PublishTimeout(limit)),
        }
    }

    /// Record the acknowledgment: entry delivered, and for dispatch entries the
    /// job confirmed as `DISPATCHED`, in one transaction.
    async fn confirm(&self, entry: &OutboxEntry) -> Result<(), RelayError> {
        let mut tx = self.store.begin().await?;
        self.outbox.mark_delivered_in(tx.as_mut(), entry.id).await?;

        if entry.kind == OutboxKind::Dispatch {
            match self
                .jobs
                .update_status(tx.as_mut(), entry.job_id, JobStatus::Dispatched, None)
                .await
            {
                Ok(_) => {}
                // A worker already claimed it; only the entry needs recording.
                Err(JobStoreError::Domain(DomainError::InvalidTransition { current, .. })) => {
                    debug!(job_id = %entry.job_id, status = %current, "job already past dispatch");
                }
                Err(JobStoreError::Domain(DomainError::NotFound(_))) => {
                    warn!(job_id = %entry.job_id, "outbox entry references a missing job");
                }
                Err(JobStoreError::Domain(other)) => {
                    warn!(job_id = %entry.job_id, error = %other, "unexpected lifecycle error");
                }
                Err(JobStoreError::Store(err)) => return Err(err.into()),
            }
        }

        tx.commit().await?;
        Ok(())
    }

    fn lock_sweep(&self) -> std::sync::MutexGuard<'_, Sweep> {
        // Poisoning is harmless: the sweep is only a retry hint.
        self.sweep.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn backing_off(&self, id: OutboxEntryId) -> bool {
        self.lock_sweep()
            .backoff
            .get(&id)
            .is_some_and(|b| b.next_attempt > Instant::now())
    }

    fn record_attempt(&self, id: OutboxEntryId, delivered: bool) {
        let mut sweep = self.lock_sweep();
        if delivered {
            sweep.backoff.remove(&id);
            return;
        }
        let failures = sweep.backoff.get(&id).map_or(0, |b| b.failures) + 1;
        let wait = self.config.backoff_for(failures);
        sweep.backoff.insert(
            id,
            EntryBackoff {
                failures,
                next_attempt: Instant::now() + wait,
            },
        );
    }

    fn check_stale(&self, entry: &OutboxEntry, report: &mut CycleReport) {
        if !self.is_stale(entry) {
            return;
        }
        report.stale += 1;
        warn!(
            alert = "stuck_dispatch",
            relay = %self.config.name,
            entry_id = %entry.id,
            job_id = %entry.job_id,
            kind = %entry.kind,
            age_ms = entry.age(Utc::now()).num_milliseconds(),
            "outbox entry undelivered past staleness threshold"
        );
    }

    fn is_stale(&self, entry: &OutboxEntry) -> bool {
        chrono::Duration::from_std(self.config.stale_after)
            .map(|threshold| entry.age(Utc::now()) > threshold)
            .unwrap_or(false)
    }

    async fn purge_if_due(&self, last_purge: &mut Option<Instant>) {
        let Some(retention) = self.config.retention else {
            return;
        };
        if last_purge.is_some_and(|at| at.elapsed() < self.config.purge_interval) {
            return;
        }
        *last_purge = Some(Instant::now());

        match self.outbox.purge_delivered(retention).await {
            Ok(0) => {}
            Ok(n) => {
                self.counters.purged.fetch_add(n, Ordering::Relaxed);
                info!(relay = %self.config.name, purged = n, "purged delivered outbox entries");
            }
            Err(err) => {
                warn!(relay = %self.config.name, error = %err, "outbox purge failed");
            }
        }
    }

    /// Spawn the relay loop on the current tokio runtime.
    pub fn spawn(self) -> RelayHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let counters = self.counters.clone();
        let join = tokio::spawn(self.run(shutdown_rx));

        RelayHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            counters,
        }
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            relay = %self.config.name,
            batch_size = self.config.batch_size,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "outbox relay started"
        );
        let mut last_purge = None;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let outcome = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                outcome = self.run_once() => outcome,
            };

            // Keep going while the sweep has more to read and this batch had
            // something other than entries still backing off.
            let backlog = match outcome {
                Ok(report) => !report.sweep_finished && report.deferred < report.fetched,
                Err(err) => {
                    warn!(relay = %self.config.name, error = %err, "relay cycle failed");
                    false
                }
            };

            self.purge_if_due(&mut last_purge).await;

            if !backlog {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        }

        info!(relay = %self.config.name, "outbox relay stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use cloudtasker_core::JobId;
    use cloudtasker_events::JobMessage;

    use crate::store::InMemoryStore;
    use crate::task_service::TaskService;
    use crate::test_support::FlakyBus;

    fn config() -> RelayConfig {
        RelayConfig::default()
            .with_batch_size(10)
            .with_poll_interval(Duration::from_millis(10))
            .with_publish_timeout(Duration::from_millis(50))
            .with_retry_backoff(Duration::ZERO, Duration::ZERO)
    }

    fn setup() -> (
        TaskService<InMemoryStore>,
        InMemoryStore,
        Arc<FlakyBus>,
        Relay<InMemoryStore, Arc<FlakyBus>>,
    ) {
        let store = InMemoryStore::new();
        let bus = Arc::new(FlakyBus::new());
        let relay = Relay::new(store.clone(), bus.clone(), config());
        (TaskService::new(store.clone()), store, bus, relay)
    }

    async fn status(store: &InMemoryStore, id: JobId) -> JobStatus {
        store.get_job(id).await.unwrap().unwrap().status
    }

    #[tokio::test]
    async fn cycle_publishes_marks_and_dispatches() {
        let (svc, store, bus, relay) = setup();
        let id = svc.create_task("payload-A", None).await.unwrap().job_id;

        let report = relay.run_once().await.unwrap();
        assert_eq!(report.fetched, 1);
        assert_eq!(report.published, 1);

        assert_eq!(status(&store, id).await, JobStatus::Dispatched);
        assert!(store.outbox_entries_for_job(id).await.unwrap()[0].delivered);
        assert_eq!(
            JobMessage::decode(&bus.published()[0]).unwrap(),
            JobMessage::Dispatch {
                job_id: id,
                payload: "payload-A".into(),
            }
        );

        // Nothing left to do.
        assert_eq!(relay.run_once().await.unwrap().fetched, 0);
    }

    #[tokio::test]
    async fn publish_failure_leaves_entry_for_next_cycle() {
        let (svc, store, bus, relay) = setup();
        let id = svc.create_task("p", None).await.unwrap().job_id;

        bus.fail_next(1);
        let report = relay.run_once().await.unwrap();
        assert_eq!(report.publish_failures, 1);
        assert_eq!(status(&store, id).await, JobStatus::Pending);
        assert!(!store.outbox_entries_for_job(id).await.unwrap()[0].delivered);

        let report = relay.run_once().await.unwrap();
        assert_eq!(report.published, 1);
        assert_eq!(status(&store, id).await, JobStatus::Dispatched);
        assert_eq!(bus.published().len(), 1);
    }

    #[tokio::test]
    async fn stuck_publish_times_out_and_batch_moves_on() {
        let (svc, store, bus, relay) = setup();
        let stuck = svc.create_task("stuck", None).await.unwrap().job_id;
        let fine = svc.create_task("fine", None).await.unwrap().job_id;

        let stuck_entry = store.outbox_entries_for_job(stuck).await.unwrap().remove(0);
        bus.hang_on(&stuck_entry.message_payload);

        let report = relay.run_once().await.unwrap();
        assert_eq!(report.publish_timeouts, 1);
        assert_eq!(report.published, 1);
        assert_eq!(status(&store, stuck).await, JobStatus::Pending);
        assert_eq!(status(&store, fine).await, JobStatus::Dispatched);
    }

    #[tokio::test]
    async fn failed_mark_republishes_next_cycle() {
        let (svc, store, bus, relay) = setup();
        let id = svc.create_task("p", None).await.unwrap().job_id;

        // The bus acks, then the store rejects the confirmation.
        let entry = store.outbox_entries_for_job(id).await.unwrap().remove(0);
        let published_before = bus.published().len();
        relay.publish(&entry).await.unwrap();
        store.set_unavailable(true);
        assert!(relay.confirm(&entry).await.is_err());
        store.set_unavailable(false);

        // Still undelivered: the next cycle sends a duplicate.
        let report = relay.run_once().await.unwrap();
        assert_eq!(report.published, 1);
        assert_eq!(bus.published().len(), published_before + 2);
        assert_eq!(status(&store, id).await, JobStatus::Dispatched);
    }

    #[tokio::test]
    async fn restarted_relay_delivers_entries_committed_before_crash() {
        let store = InMemoryStore::new();
        let id = {
            let svc = TaskService::new(store.clone());
            svc.create_task("survives", None).await.unwrap().job_id
            // process "dies" here, before any relay ran
        };

        let bus = Arc::new(FlakyBus::new());
        let relay = Relay::new(store.clone(), bus.clone(), config());
        relay.run_once().await.unwrap();

        assert_eq!(bus.published().len(), 1);
        assert_eq!(status(&store, id).await, JobStatus::Dispatched);
    }

    #[tokio::test]
    async fn store_outage_fails_the_cycle() {
        let (_, store, _, relay) = setup();
        store.set_unavailable(true);
        assert!(matches!(
            relay.run_once().await,
            Err(RelayError::StoreUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn stale_undelivered_entries_raise_alert() {
        let store = InMemoryStore::new();
        let bus = Arc::new(FlakyBus::new());
        let relay = Relay::new(
            store.clone(),
            bus.clone(),
            config().with_stale_after(Duration::ZERO),
        );
        let svc = TaskService::new(store.clone());
        svc.create_task("p", None).await.unwrap();

        bus.set_down(true);
        tokio::time::sleep(Duration::from_millis(5)).await;
        let report = relay.run_once().await.unwrap();
        assert_eq!(report.stale, 1);
        assert_eq!(relay.stats().stale_entries, 1);

        // Delivered entries never alert.
        bus.set_down(false);
        assert_eq!(relay.run_once().await.unwrap().stale, 0);
    }

    #[tokio::test]
    async fn hanging_head_entries_do_not_starve_the_rest() {
        let store = InMemoryStore::new();
        let bus = Arc::new(FlakyBus::new());
        let relay = Relay::new(
            store.clone(),
            bus.clone(),
            config()
                .with_batch_size(2)
                .with_publish_timeout(Duration::from_millis(20)),
        );
        let svc = TaskService::new(store.clone());
        let first = svc.create_task("hang-1", None).await.unwrap().job_id;
        let second = svc.create_task("hang-2", None).await.unwrap().job_id;
        let third = svc.create_task("fine", None).await.unwrap().job_id;
        for id in [first, second] {
            let entry = store.outbox_entries_for_job(id).await.unwrap().remove(0);
            bus.hang_on(&entry.message_payload);
        }

        for _ in 0..5 {
            relay.run_once().await.unwrap();
        }

        assert_eq!(status(&store, third).await, JobStatus::Dispatched);
        assert_eq!(status(&store, first).await, JobStatus::Pending);
        assert_eq!(status(&store, second).await, JobStatus::Pending);
    }

    #[tokio::test]
    async fn failing_entry_backs_off_between_attempts() {
        let store = InMemoryStore::new();
        let bus = Arc::new(FlakyBus::new());
        let relay = Relay::new(
            store.clone(),
            bus.clone(),
            config().with_retry_backoff(Duration::from_millis(40), Duration::from_secs(1)),
        );
        let svc = TaskService::new(store.clone());
        let id = svc.create_task("p", None).await.unwrap().job_id;

        bus.fail_next(1);
        assert_eq!(relay.run_once().await.unwrap().publish_failures, 1);

        // Still inside the backoff window: skipped, not retried.
        let report = relay.run_once().await.unwrap();
        assert_eq!(report.deferred, 1);
        assert_eq!(report.published, 0);
        assert_eq!(status(&store, id).await, JobStatus::Pending);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(relay.run_once().await.unwrap().published, 1);
        assert_eq!(status(&store, id).await, JobStatus::Dispatched);
    }

    #[tokio::test]
    async fn staleness_is_checked_beyond_the_first_batch() {
        let store = InMemoryStore::new();
        let bus = Arc::new(FlakyBus::new());
        let relay = Relay::new(
            store.clone(),
            bus.clone(),
            config()
                .with_batch_size(1)
                .with_stale_after(Duration::ZERO)
                .with_retry_backoff(Duration::from_secs(60), Duration::from_secs(60)),
        );
        let svc = TaskService::new(store.clone());
        for i in 0..3 {
            svc.create_task(&format!("p{i}"), None).await.unwrap();
        }

        bus.set_down(true);
        tokio::time::sleep(Duration::from_millis(5)).await;
        for _ in 0..3 {
            relay.run_once().await.unwrap();
        }
        assert_eq!(relay.stats().stale_entries, 3);

        // Second sweep: all three are backing off and still alert.
        let mut deferred = 0;
        for _ in 0..4 {
            deferred += relay.run_once().await.unwrap().deferred;
        }
        assert_eq!(deferred, 3);
        assert_eq!(relay.stats().stale_entries, 6);
    }

    #[test]
    fn entry_backoff_doubles_up_to_the_cap() {
        let config = RelayConfig::default()
            .with_retry_backoff(Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(config.backoff_for(1), Duration::from_millis(100));
        assert_eq!(config.backoff_for(2), Duration::from_millis(200));
        assert_eq!(config.backoff_for(3), Duration::from_millis(350));
        assert_eq!(config.backoff_for(40), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn confirm_does_not_regress_a_claimed_job() {
        let (svc, store, _, relay) = setup();
        let id = svc.create_task("p", None).await.unwrap().job_id;
        // A fast worker confirmed and claimed before the relay recorded the ack.
        svc.update_task_status(id, JobStatus::Dispatched, None, None)
            .await
            .unwrap();
        svc.update_task_status(id, JobStatus::Running, None, None)
            .await
            .unwrap();

        relay.run_once().await.unwrap();
        assert_eq!(status(&store, id).await, JobStatus::Running);
        assert!(store.outbox_entries_for_job(id).await.unwrap()[0].delivered);
    }

    #[tokio::test]
    async fn completion_entries_are_relayed_without_touching_the_job() {
        let (svc, store, bus, relay) = setup();
        let id = svc.create_task("p", None).await.unwrap().job_id;
        relay.run_once().await.unwrap();
        svc.update_task_status(id, JobStatus::Running, None, None)
            .await
            .unwrap();
        svc.update_task_status(id, JobStatus::Succeeded, Some("r".into()), None)
            .await
            .unwrap();

        relay.run_once().await.unwrap();
        assert_eq!(status(&store, id).await, JobStatus::Succeeded);
        let last = JobMessage::decode(bus.published().last().unwrap()).unwrap();
        assert_eq!(last.kind(), OutboxKind::Completion);
    }

    #[tokio::test]
    async fn spawned_relay_drains_and_shuts_down() {
        let (svc, store, bus, relay) = setup();
        let handle = relay.spawn();

        let id = svc.create_task("background", None).await.unwrap().job_id;
        for _ in 0..100 {
            if status(&store, id).await == JobStatus::Dispatched {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status(&store, id).await, JobStatus::Dispatched);
        assert!(handle.stats().published >= 1);
        assert_eq!(bus.published().len(), 1);

        handle.shutdown().await;
    }
}
