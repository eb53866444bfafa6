//! Switchboard Fabric - broker transport and codec layer
//!
//! Provides the broker capability traits (`Broker`, `Session`), an in-process
//! broker, an AMQP broker behind the `amqp` feature, JSON encoding, and the
//! correlated request/reply exchange the rpc layer is built on.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use switchboard_fabric::codec::JsonCodec;
//! use switchboard_fabric::request::request;
//! use switchboard_fabric::transport::MemoryBroker;
//! use switchboard_fabric::{Channel, Properties};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = MemoryBroker::new();
//!
//! // One-off correlated request
//! let reply = request(
//!     &broker,
//!     "jobs",
//!     &"hello",
//!     "req-1",
//!     Duration::from_secs(3),
//!     JsonCodec,
//! )
//! .await?;
//!
//! // Or drive a session directly
//! let mut channel = Channel::open(&broker, JsonCodec).await?;
//! channel.declare_queue("jobs", true).await?;
//! channel.publish("jobs", &"hello", &Properties::new()).await?;
//! # let _ = reply;
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod codec;
pub mod error;
pub mod request;
pub mod transport;

// Re-exports for convenience
pub use channel::Channel;
pub use error::{Error, Result};
pub use transport::{Broker, Delivery, DeliveryMode, DeliveryTag, Properties, Session};
