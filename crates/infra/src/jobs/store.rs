//! Job Store adapter.
//!
//! Mutations take the caller's open [`StoreTransaction`] instead of opening
//! their own: there is no job-only commit path. Whoever changes a job also
//! decides what goes into the outbox in the same unit.

use chrono::Utc;
use thiserror::Error;

use cloudtasker_core::{DomainError, Job, JobId, JobStatus, Transition};

use crate::store::{Store, StoreError, StoreTransaction};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JobStoreError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result of `update_status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    /// The job as it is after the update (unchanged on a no-op).
    pub job: Job,
    pub transition: Transition,
}

impl StatusChange {
    pub fn applied(&self) -> bool {
        self.transition == Transition::Applied
    }
}

#[derive(Debug, Clone)]
pub struct JobStore<S> {
    store: S,
}

impl<S: Store> JobStore<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Insert a `PENDING` job inside `tx`.
    pub async fn create_job(
        &self,
        tx: &mut dyn StoreTransaction,
        payload: &str,
    ) -> Result<Job, JobStoreError> {
        Ok(tx.insert_job(payload, Utc::now()).await?)
    }

    pub async fn get_job(&self, id: JobId) -> Result<Job, JobStoreError> {
        self.store
            .get_job(id)
            .await?
            .ok_or(JobStoreError::Domain(DomainError::not_found(id)))
    }

    /// Lock the job, consult the lifecycle table and persist the change.
    ///
    /// A request for the status the job already has is a no-op: nothing is
    /// written and `updated_at` keeps its value.
    pub async fn update_status(
        &self,
        tx: &mut dyn StoreTransaction,
        id: JobId,
        status: JobStatus,
        result: Option<String>,
    ) -> Result<StatusChange, JobStoreError> {
        let mut job = tx
            .lock_job(id)
            .await?
            .ok_or(DomainError::not_found(id))?;

        let transition = job.transition_to(status, result, Utc::now())?;
        if transition == Transition::Applied {
            tx.update_job(&job).await?;
        }

        Ok(StatusChange { job, transition })
    }
}
