//! Transactional outbox.
//!
//! The outbox turns "write the job, then tell the bus" into a single store
//! commit. Writers call [`Outbox::enqueue`] inside the same transaction as the
//! job change; the [`relay`] publishes committed entries later.
//!
//! ```text
//! Task Service ──tx──▶ { jobs row, outbox entry } ──commit──▶ store
//!                                                              │
//!                            Relay: fetch_undelivered ◀────────┘
//!                                   publish ──▶ bus
//!                                   mark_delivered ──▶ store
//! ```
//!
//! A crash before commit loses both writes; a crash after commit loses
//! neither. A crash between publish and `mark_delivered` republishes the
//! entry, so delivery is at-least-once.

pub mod relay;

pub use relay::{CycleReport, Relay, RelayConfig, RelayError, RelayHandle, RelayStats};

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use cloudtasker_core::{JobId, NewOutboxEntry, OutboxEntry, OutboxEntryId, OutboxKind};

use crate::store::{Store, StoreError, StoreTransaction};

#[derive(Debug, Clone)]
pub struct Outbox<S> {
    store: S,
}

impl<S: Store> Outbox<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Append an undelivered entry inside `tx`.
    pub async fn enqueue(
        &self,
        tx: &mut dyn StoreTransaction,
        job_id: JobId,
        kind: OutboxKind,
        payload_for_wire: Vec<u8>,
    ) -> Result<OutboxEntryId, StoreError> {
        tx.insert_outbox_entry(NewOutboxEntry {
            job_id,
            kind,
            message_payload: payload_for_wire,
            created_at: Utc::now(),
        })
        .await
    }

    /// Oldest undelivered entries first. With `older_than`, only entries at
    /// least that old are returned.
    pub async fn fetch_undelivered(
        &self,
        limit: usize,
        older_than: Option<Duration>,
    ) -> Result<Vec<OutboxEntry>, StoreError> {
        self.fetch_undelivered_after(None, limit, older_than).await
    }

    /// Like [`Outbox::fetch_undelivered`], resuming after entry `after`.
    ///
    /// Lets a caller walk the whole backlog in id order instead of rereading
    /// the same head entries.
    pub async fn fetch_undelivered_after(
        &self,
        after: Option<OutboxEntryId>,
        limit: usize,
        older_than: Option<Duration>,
    ) -> Result<Vec<OutboxEntry>, StoreError> {
        let created_before = match older_than {
            None => None,
            Some(age) => match cutoff(age) {
                Some(at) => Some(at),
                // Nothing can be that old.
                None => return Ok(Vec::new()),
            },
        };
        self.store
            .fetch_undelivered(after, limit, created_before)
            .await
    }

    /// Mark an entry delivered in its own transaction.
    ///
    /// Already-delivered and missing entries are a silent no-op.
    pub async fn mark_delivered(&self, id: OutboxEntryId) -> Result<(), StoreError> {
        let mut tx = self.store.begin().await?;
        self.mark_delivered_in(tx.as_mut(), id).await?;
        tx.commit().await
    }

    /// Mark an entry delivered as part of a larger transaction.
    pub async fn mark_delivered_in(
        &self,
        tx: &mut dyn StoreTransaction,
        id: OutboxEntryId,
    ) -> Result<bool, StoreError> {
        let flipped = tx.mark_delivered(id, Utc::now()).await?;
        if !flipped {
            debug!(entry_id = %id, "outbox entry already delivered or gone");
        }
        Ok(flipped)
    }

    /// Drop delivered entries older than `retention`.
    ///
    /// A retention reaching past the representable time range keeps everything.
    pub async fn purge_delivered(&self, retention: Duration) -> Result<u64, StoreError> {
        match cutoff(retention) {
            Some(delivered_before) => self.store.purge_delivered(delivered_before).await,
            None => Ok(0),
        }
    }
}

/// `now - age`, or `None` when that instant cannot be represented.
fn cutoff(age: Duration) -> Option<DateTime<Utc>> {
    let age = chrono::Duration::from_std(age).ok()?;
    Utc::now().checked_sub_signed(age)
}
