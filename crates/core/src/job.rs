//! The `Job` record and its status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainResult;
use crate::id::JobId;
use crate::lifecycle::{self, Transition};

/// Job status as tracked by the lifecycle state machine.
///
/// Serialized in upper case (`"PENDING"`, `"SUCCEEDED"`, ...) both on the wire
/// and in the durable store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Recorded, dispatch notification not yet confirmed by the bus.
    Pending,
    /// Dispatch notification published.
    Dispatched,
    /// Claimed by a worker.
    Running,
    /// Finished successfully (terminal).
    Succeeded,
    /// Finished with an error (terminal).
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Dispatched,
        JobStatus::Running,
        JobStatus::Succeeded,
        JobStatus::Failed,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Dispatched => "DISPATCHED",
            JobStatus::Running => "RUNNING",
            JobStatus::Succeeded => "SUCCEEDED",
            JobStatus::Failed => "FAILED",
        }
    }

    /// Parse the stored/wire representation. Accepts any letter case.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work tracked through the status lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Opaque, immutable after creation.
    pub payload: String,
    pub status: JobStatus,
    /// Empty until a terminal status is reached.
    pub result: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// A freshly created job (`PENDING`, `created_at == updated_at`).
    pub fn new(id: JobId, payload: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            payload: payload.into(),
            status: JobStatus::Pending,
            result: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move the job to `requested`, consulting the lifecycle table.
    ///
    /// On `Transition::Unchanged` the record is left exactly as it was. On an
    /// error the record is left untouched. `result` is only kept when the new
    /// status is terminal.
    pub fn transition_to(
        &mut self,
        requested: JobStatus,
        result: Option<String>,
        now: DateTime<Utc>,
    ) -> DomainResult<Transition> {
        let transition = lifecycle::plan_transition(self.status, requested)?;
        if transition == Transition::Applied {
            self.status = requested;
            if requested.is_terminal() {
                self.result = result.filter(|r| !r.is_empty());
            }
            self.updated_at = now.max(self.updated_at);
        }
        Ok(transition)
    }
}
