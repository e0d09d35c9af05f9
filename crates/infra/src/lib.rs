//! Infrastructure: durable store, outbox relay, task service and worker.

pub mod config;
pub mod event_bus;
pub mod jobs;
pub mod outbox;
pub mod store;
pub mod task_service;

#[cfg(test)]
mod test_support;


pub use config::{AppConfig, ConfigError};
pub use jobs::{JobStore, JobStoreError, TaskWorker, TaskWorkerConfig, TaskWorkerHandle};
pub use outbox::{Outbox, Relay, RelayConfig, RelayError, RelayHandle, RelayStats};
pub use store::{InMemoryStore, PostgresStore, Store, StoreError, StoreTransaction};
pub use task_service::{TaskReceipt, TaskService, TaskServiceError};
