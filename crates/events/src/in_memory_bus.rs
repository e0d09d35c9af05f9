//! In-memory message bus for tests/dev.

use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::bus::{BusError, Delivery, MessageBus, Settlement, Subscription};

/// In-memory pub/sub bus.
///
/// - No IO
/// - Fan-out to every live subscription
/// - A `nack`ed delivery goes to the back of the same subscription's queue
/// - Keeps a log of everything published, for inspection in tests
#[derive(Debug, Default)]
pub struct InMemoryMessageBus {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<Delivery>>>,
    published: Mutex<Vec<Vec<u8>>>,
}

impl InMemoryMessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every message accepted so far, in publish order.
    pub fn published(&self) -> Vec<Vec<u8>> {
        self.published
            .lock()
            .map(|log| log.clone())
            .unwrap_or_default()
    }

    pub fn published_count(&self) -> usize {
        self.published.lock().map(|log| log.len()).unwrap_or(0)
    }
}

/// A delivery that re-enqueues itself on `nack`.
fn requeueing(payload: Vec<u8>, queue: mpsc::UnboundedSender<Delivery>) -> Delivery {
    let retained = payload.clone();
    Delivery::new(payload, move |outcome| {
        if outcome == Settlement::Nack {
            let again = requeueing(retained, queue.clone());
            // A closed queue means the subscriber is gone; nothing to redeliver to.
            let _ = queue.send(again);
        }
    })
}

#[async_trait]
impl MessageBus for InMemoryMessageBus {
    async fn publish(&self, message: &[u8]) -> Result<(), BusError> {
        {
            let mut subs = self
                .subscribers
                .lock()
                .map_err(|_| BusError::Unavailable("in-memory bus lock poisoned".into()))?;

            // Drop any dead subscribers while publishing.
            subs.retain(|tx| tx.send(requeueing(message.to_vec(), tx.clone())).is_ok());
        }

        self.published
            .lock()
            .map_err(|_| BusError::Unavailable("in-memory bus lock poisoned".into()))?
            .push(message.to_vec());

        Ok(())
    }

    fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();

        // If the lock is poisoned, we still return a subscription;
        // it just won't receive messages until the process restarts.
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }

        Subscription::new(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn every_subscriber_gets_a_copy() {
        let bus = InMemoryMessageBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(b"one").await.unwrap();
        bus.publish(b"two").await.unwrap();

        assert_eq!(a.recv().await.unwrap().payload(), b"one");
        assert_eq!(a.recv().await.unwrap().payload(), b"two");
        assert_eq!(b.recv().await.unwrap().payload(), b"one");
        assert_eq!(bus.published_count(), 2);
    }

    #[tokio::test]
    async fn nacked_delivery_comes_back_after_queued_ones() {
        let bus = InMemoryMessageBus::new();
        let mut sub = bus.subscribe();

        bus.publish(b"first").await.unwrap();
        bus.publish(b"second").await.unwrap();

        sub.recv().await.unwrap().nack();
        assert_eq!(sub.recv().await.unwrap().payload(), b"second");

        let again = sub.recv().await.unwrap();
        assert_eq!(again.payload(), b"first");
        again.ack();
        assert!(sub.try_recv().is_err());
    }

    #[tokio::test]
    async fn acked_delivery_is_gone() {
        let bus = InMemoryMessageBus::new();
        let mut sub = bus.subscribe();

        bus.publish(b"once").await.unwrap();
        sub.recv().await.unwrap().ack();
        assert!(sub.recv_timeout(Duration::from_millis(20)).await.is_err());
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned() {
        let bus = InMemoryMessageBus::new();
        let sub = bus.subscribe();
        drop(sub);

        bus.publish(b"x").await.unwrap();
        assert!(bus.subscribers.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn recv_timeout_elapses_without_messages() {
        let bus = InMemoryMessageBus::new();
        let mut sub = bus.subscribe();
        assert!(sub.recv_timeout(Duration::from_millis(20)).await.is_err());
    }
}
