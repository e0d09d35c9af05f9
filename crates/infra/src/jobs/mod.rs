//! Job Store adapter and the task worker that consumes dispatch notifications.
//!
//! ## Components
//!
//! - `JobStore`: job reads plus the job half of every atomic write
//! - `TaskWorker`: subscribes to the bus, claims jobs, runs a handler and
//!   reports the outcome back through the task service

pub mod store;
pub mod worker;

pub use store::{JobStore, JobStoreError, StatusChange};
pub use worker::{
    MessageOutcome, TaskHandler, TaskWorker, TaskWorkerConfig, TaskWorkerHandle, WorkerStats,
    default_handler, task_type_handler,
};
