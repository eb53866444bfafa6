use std::sync::Arc;

use crate::error::Result;

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod memory;

#[cfg(feature = "amqp")]
pub use self::amqp::{AmqpBroker, AmqpBrokerBuilder, AmqpSession};
pub use self::memory::{JournalEntry, MemoryBroker, MemorySession};

/// Broker-assigned identifier of a delivery, scoped to one session
pub type DeliveryTag = u64;

/// Whether the broker should persist a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    #[default]
    Transient,
    Persistent,
}

impl DeliveryMode {
    /// AMQP encoding (1 = transient, 2 = persistent)
    pub fn as_u8(self) -> u8 {
        match self {
            DeliveryMode::Transient => 1,
            DeliveryMode::Persistent => 2,
        }
    }

    pub fn from_u8(value: u8) -> Self {
        if value == 2 {
            DeliveryMode::Persistent
        } else {
            DeliveryMode::Transient
        }
    }
}

/// Message attributes carried alongside the body
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub content_type: Option<String>,
    pub delivery_mode: DeliveryMode,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_reply_to(mut self, destination: impl Into<String>) -> Self {
        self.reply_to = Some(destination.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.delivery_mode = mode;
        self
    }
}

/// A message handed to a session by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub tag: DeliveryTag,
    /// Queue the message was consumed from
    pub queue: String,
    pub body: Vec<u8>,
    pub properties: Properties,
}

/// Connection factory for a message broker
///
/// Each call to `connect` yields an independent session, so concurrent
/// callers never share consumption state.
#[async_trait::async_trait]
pub trait Broker: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Session>>;
}

#[async_trait::async_trait]
impl<B: Broker + ?Sized> Broker for Arc<B> {
    async fn connect(&self) -> Result<Box<dyn Session>> {
        (**self).connect().await
    }
}

/// One channel-like conversation with the broker
///
/// Deliveries from every queue the session consumes arrive through
/// `next_delivery`, which returns `None` once the broker closes the session.
#[async_trait::async_trait]
pub trait Session: Send {
    /// Declare a queue, creating it if absent
    async fn declare_queue(&mut self, name: &str, durable: bool) -> Result<()>;

    /// Limit unacknowledged deliveries in flight on this session (0 = unlimited)
    async fn set_prefetch(&mut self, count: u16) -> Result<()>;

    /// Publish through the default exchange to `queue`
    async fn publish(&mut self, queue: &str, body: &[u8], properties: &Properties) -> Result<()>;

    /// Start consuming `queue` with explicit acknowledgements
    async fn consume(&mut self, queue: &str) -> Result<()>;

    /// Open a private reply destination consumed without acknowledgements
    ///
    /// Returns the name to put in `reply_to`. The destination lives as long as
    /// the session.
    async fn reply_queue(&mut self) -> Result<String>;

    /// Wait for the next delivery
    async fn next_delivery(&mut self) -> Result<Option<Delivery>>;

    /// Acknowledge a delivery, removing it from its queue
    async fn ack(&mut self, tag: DeliveryTag) -> Result<()>;

    /// Close the session, releasing its reply destination
    async fn close(&mut self) -> Result<()>;
}
