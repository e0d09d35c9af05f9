//! Domain error model.

use thiserror::Error;

use crate::id::JobId;
use crate::job::JobStatus;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic, business/domain failures (unknown jobs,
/// lifecycle violations, malformed input). Infrastructure concerns belong elsewhere.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// No job with this id exists.
    #[error("job {0} not found")]
    NotFound(JobId),

    /// The lifecycle table does not allow `current -> requested`.
    #[error("invalid transition from {current} to {requested}")]
    InvalidTransition {
        current: JobStatus,
        requested: JobStatus,
    },

    /// A value failed validation (e.g. empty payload, malformed id).
    #[error("validation failed: {0}")]
    Validation(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(id: JobId) -> Self {
        Self::NotFound(id)
    }

    pub fn invalid_transition(current: JobStatus, requested: JobStatus) -> Self {
        Self::InvalidTransition { current, requested }
    }
}
