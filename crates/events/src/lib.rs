//! Message bus abstraction and the job notification wire format.

pub mod bus;
pub mod in_memory_bus;
pub mod message;

pub use bus::{BusError, Delivery, MessageBus, Settlement, Subscription};
pub use in_memory_bus::InMemoryMessageBus;
pub use message::{JobMessage, MessageError};
