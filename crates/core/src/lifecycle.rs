//! Job lifecycle state machine.
//!
//! ```text
//! PENDING ──▶ DISPATCHED ──▶ RUNNING ──┬──▶ SUCCEEDED
//!                                      └──▶ FAILED
//! ```
//!
//! - `PENDING -> DISPATCHED`: the relay confirmed the dispatch publish
//! - `DISPATCHED -> RUNNING`: a worker claimed the job
//! - `RUNNING -> SUCCEEDED | FAILED`: the worker reported an outcome
//!
//! Nothing leaves `SUCCEEDED` or `FAILED`.
//!
//! `validate_transition` is the raw table lookup. `plan_transition` is what
//! writers use: it additionally treats a request for the state the job is
//! already in as an idempotent no-op, because dispatch confirmations and worker
//! reports can both arrive more than once.

use crate::error::{DomainError, DomainResult};
use crate::job::JobStatus;

/// Outcome of planning a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The status changes; persist the record.
    Applied,
    /// The job is already in the requested status; nothing to write.
    Unchanged,
}

/// `true` iff `current -> requested` is an edge of the lifecycle table.
pub fn validate_transition(current: JobStatus, requested: JobStatus) -> bool {
    use JobStatus::*;

    matches!(
        (current, requested),
        (Pending, Dispatched)
            | (Dispatched, Running)
            | (Running, Succeeded)
            | (Running, Failed)
    )
}

/// Like [`validate_transition`], but returns the error callers surface.
pub fn check_transition(current: JobStatus, requested: JobStatus) -> DomainResult<()> {
    if validate_transition(current, requested) {
        Ok(())
    } else {
        Err(DomainError::invalid_transition(current, requested))
    }
}

/// Decide what a status update request means for a job currently in `current`.
pub fn plan_transition(current: JobStatus, requested: JobStatus) -> DomainResult<Transition> {
    if current == requested {
        return Ok(Transition::Unchanged);
    }
    check_transition(current, requested)?;
    Ok(Transition::Applied)
}
