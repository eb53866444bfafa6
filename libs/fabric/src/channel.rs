use serde::{Deserialize, Serialize};

use crate::codec::Codec;
use crate::error::Result;
use crate::transport::{Broker, Delivery, DeliveryTag, Properties, Session};

/// High-level channel onto a broker
///
/// Combines a session and codec so callers publish and decode typed values
pub struct Channel<C> {
    session: Box<dyn Session>,
    codec: C,
}

impl<C: Codec> Channel<C> {
    /// Create a channel from an existing session
    pub fn from_session(session: Box<dyn Session>, codec: C) -> Self {
        Self { session, codec }
    }

    /// Open a new session on `broker`
    pub async fn open(broker: &dyn Broker, codec: C) -> Result<Self> {
        let session = broker.connect().await?;
        Ok(Self::from_session(session, codec))
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    /// Declare a queue, creating it if absent
    pub async fn declare_queue(&mut self, name: &str, durable: bool) -> Result<()> {
        self.session.declare_queue(name, durable).await
    }

    /// Limit unacknowledged deliveries in flight
    pub async fn set_prefetch(&mut self, count: u16) -> Result<()> {
        self.session.set_prefetch(count).await
    }

    /// Start consuming a queue with explicit acknowledgements
    pub async fn consume(&mut self, queue: &str) -> Result<()> {
        self.session.consume(queue).await
    }

    /// Open a private reply destination and return its name
    pub async fn reply_queue(&mut self) -> Result<String> {
        self.session.reply_queue().await
    }

    /// Encode and publish a message
    ///
    /// The codec's content type is filled in when `properties` carries none.
    pub async fn publish<T: Serialize>(
        &mut self,
        queue: &str,
        message: &T,
        properties: &Properties,
    ) -> Result<()> {
        let bytes = self.codec.encode(message)?;
        if properties.content_type.is_some() {
            self.session.publish(queue, &bytes, properties).await
        } else {
            let properties = properties
                .clone()
                .with_content_type(self.codec.content_type());
            self.session.publish(queue, &bytes, &properties).await
        }
    }

    /// Receive the next raw delivery; `None` once the broker closed the session
    pub async fn next_delivery(&mut self) -> Result<Option<Delivery>> {
        self.session.next_delivery().await
    }

    /// Decode a delivery's body
    pub fn decode<T: for<'de> Deserialize<'de>>(&self, delivery: &Delivery) -> Result<T> {
        self.codec.decode(&delivery.body)
    }

    /// Acknowledge a delivery
    pub async fn ack(&mut self, tag: DeliveryTag) -> Result<()> {
        self.session.ack(tag).await
    }

    /// Close the channel
    pub async fn close(mut self) -> Result<()> {
        self.session.close().await
    }
}
