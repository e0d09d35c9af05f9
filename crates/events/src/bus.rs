//! Message publishing/subscription abstraction (mechanics only).
//!
//! The bus moves opaque byte messages from the relay to workers. It is the
//! **transport**, never the source of truth: the durable store decides whether a
//! job exists, and the outbox decides whether a message still has to be sent.
//!
//! ## Delivery Guarantees
//!
//! The system as a whole provides **at-least-once delivery**:
//! - The relay republishes an entry when it cannot record the acknowledgment
//! - Consumers settle each [`Delivery`]: `ack` once it is fully handled,
//!   `nack` to hand it back to the transport for redelivery
//! - A delivery dropped unsettled counts as not acknowledged; whether it comes
//!   back is up to the transport (Redis keeps it pending, memory loses it)
//! - Consumers must be idempotent and deduplicate by job id
//!
//! No ordering is promised across jobs. Messages from a single publisher arrive
//! in publish order on the in-memory transport.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Publish failure.
///
/// Both variants leave the outbox entry undelivered; the relay retries it on
/// the next cycle.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    /// The bus could not be reached or did not acknowledge.
    #[error("message bus unavailable: {0}")]
    Unavailable(String),

    /// The bus refused the message.
    #[error("message rejected: {0}")]
    Rejected(String),
}

/// How a consumer finished with a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    Nack,
}

type SettleFn = Box<dyn FnOnce(Settlement) + Send>;

/// One received message plus the means to acknowledge it.
pub struct Delivery {
    payload: Vec<u8>,
    settle: Option<SettleFn>,
}

impl Delivery {
    /// A delivery whose settlement is reported through `settle`.
    pub fn new<F>(payload: Vec<u8>, settle: F) -> Self
    where
        F: FnOnce(Settlement) + Send + 'static,
    {
        Self {
            payload,
            settle: Some(Box::new(settle)),
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Take the bytes without settling.
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Fully handled; the transport may forget it.
    pub fn ack(self) {
        self.finish(Settlement::Ack);
    }

    /// Not handled; the transport should deliver it again.
    pub fn nack(self) {
        self.finish(Settlement::Nack);
    }

    fn finish(self, outcome: Settlement) {
        if let Some(settle) = self.settle {
            settle(outcome);
        }
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("bytes", &self.payload.len())
            .field("tracked", &self.settle.is_some())
            .finish()
    }
}

/// A subscription to the bus.
///
/// Each subscription receives its own copy of every message published after it
/// was created. Designed for a single consumer task.
///
/// ```ignore
/// let mut sub = bus.subscribe();
/// loop {
///     match sub.recv_timeout(Duration::from_millis(250)).await {
///         Ok(Some(delivery)) => match handle(delivery.payload()).await {
///             Ok(()) => delivery.ack(),
///             Err(_) => delivery.nack(),
///         },
///         Ok(None) => break,        // bus closed
///         Err(_) => continue,       // timed out, check for shutdown
///     }
/// }
/// ```
#[derive(Debug)]
pub struct Subscription {
    receiver: mpsc::UnboundedReceiver<Delivery>,
}

impl Subscription {
    pub fn new(receiver: mpsc::UnboundedReceiver<Delivery>) -> Self {
        Self { receiver }
    }

    /// Wait for the next message. `None` once the bus side is gone.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.receiver.recv().await
    }

    /// Try to receive a message without waiting.
    pub fn try_recv(&mut self) -> Result<Delivery, mpsc::error::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Wait for up to `timeout` for a message.
    pub async fn recv_timeout(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<Delivery>, tokio::time::error::Elapsed> {
        tokio::time::timeout(timeout, self.receiver.recv()).await
    }
}

/// Transport-agnostic message bus.
///
/// `publish` resolves once the transport acknowledged the message (or failed
/// to). Callers that need a bound on the wait wrap it in a timeout; the relay
/// does so per outbox entry.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, message: &[u8]) -> Result<(), BusError>;

    fn subscribe(&self) -> Subscription;
}

#[async_trait]
impl<B> MessageBus for Arc<B>
where
    B: MessageBus + ?Sized,
{
    async fn publish(&self, message: &[u8]) -> Result<(), BusError> {
        (**self).publish(message).await
    }

    fn subscribe(&self) -> Subscription {
        (**self).subscribe()
    }
}
