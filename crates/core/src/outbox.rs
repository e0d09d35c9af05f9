//! Outbox entry types.
//!
//! An outbox entry is the durable intent to publish one message. It is written
//! in the same store transaction as the job change it announces, and flips
//! `delivered` to `true` exactly once, after the bus acknowledged it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{JobId, OutboxEntryId};

/// What an entry announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxKind {
    /// A new job is ready for processing (job id + payload).
    Dispatch,
    /// A job reached a terminal status (job id + status + result).
    Completion,
}

impl OutboxKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxKind::Dispatch => "dispatch",
            OutboxKind::Completion => "completion",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "dispatch" => Some(OutboxKind::Dispatch),
            "completion" => Some(OutboxKind::Completion),
            _ => None,
        }
    }
}

impl core::fmt::Display for OutboxKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An entry that has not been stored yet (no id assigned).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOutboxEntry {
    pub job_id: JobId,
    pub kind: OutboxKind,
    pub message_payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

/// A stored outbox entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxEntry {
    pub id: OutboxEntryId,
    pub job_id: JobId,
    pub kind: OutboxKind,
    /// Serialized bus message, published verbatim.
    pub message_payload: Vec<u8>,
    pub delivered: bool,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
}

impl OutboxEntry {
    pub fn from_new(id: OutboxEntryId, new: NewOutboxEntry) -> Self {
        Self {
            id,
            job_id: new.job_id,
            kind: new.kind,
            message_payload: new.message_payload,
            delivered: false,
            created_at: new.created_at,
            delivered_at: None,
        }
    }

    /// How long the entry has been waiting, as seen at `now`.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.created_at
    }
}
