//! `cloudtasker-core`: job domain building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the `Job` record, outbox entries and the lifecycle state machine
//! that governs job status transitions.

pub mod error;
pub mod id;
pub mod job;
pub mod lifecycle;
pub mod outbox;

pub use error::{DomainError, DomainResult};
pub use id::{JobId, OutboxEntryId};
pub use job::{Job, JobStatus};
pub use lifecycle::{Transition, check_transition, plan_transition, validate_transition};
pub use outbox::{NewOutboxEntry, OutboxEntry, OutboxKind};
