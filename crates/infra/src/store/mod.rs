//! Durable store boundary.
//!
//! Everything the service and the relay coordinate through lives here: job rows
//! and outbox entries. The only way to change either is a [`StoreTransaction`],
//! so a job change and the outbox entry announcing it always commit (or vanish)
//! together.
//!
//! - `in_memory`: single-process store for tests/dev
//! - `postgres`: `sqlx`-backed store (`jobs` + `outbox` tables)

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryStore;
pub use postgres::PostgresStore;
pub use r#trait::{Store, StoreError, StoreTransaction};
