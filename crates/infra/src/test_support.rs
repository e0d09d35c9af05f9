//! Shared fixtures for unit tests.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use cloudtasker_events::{BusError, InMemoryMessageBus, MessageBus, Subscription};

/// In-memory bus with switchable faults.
#[derive(Debug, Default)]
pub struct FlakyBus {
    inner: InMemoryMessageBus,
    fail_next: AtomicUsize,
    down: AtomicBool,
    /// Payloads whose publish never completes.
    hang_on: Mutex<Vec<Vec<u8>>>,
    attempts: AtomicUsize,
}

impl FlakyBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn hang_on(&self, payload: &[u8]) {
        self.hang_on.lock().unwrap().push(payload.to_vec());
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn published(&self) -> Vec<Vec<u8>> {
        self.inner.published()
    }
}

#[async_trait]
impl MessageBus for FlakyBus {
    async fn publish(&self, message: &[u8]) -> Result<(), BusError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        if self.down.load(Ordering::SeqCst) {
            return Err(BusError::Unavailable("bus is down".into()));
        }
        let failing = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(BusError::Unavailable("injected failure".into()));
        }
        let hangs = self.hang_on.lock().unwrap().iter().any(|p| p == message);
        if hangs {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }

        self.inner.publish(message).await
    }

    fn subscribe(&self) -> Subscription {
        self.inner.subscribe()
    }
}
