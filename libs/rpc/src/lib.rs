//! Switchboard RPC - synchronous request/reply over a message broker
//!
//! [`RpcClient::call`] publishes a request envelope to a queue and waits for
//! the correlated reply, with retries and a circuit breaker. [`Responder`]
//! consumes a queue, dispatches each request to the handler bound to its
//! route and publishes the reply.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use serde_json::{json, Value};
//! use switchboard_core::RpcConfig;
//! use switchboard_fabric::transport::MemoryBroker;
//! use switchboard_rpc::{Meta, Responder, RpcClient};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = MemoryBroker::new();
//!
//! let responder = Responder::new("math")
//!     .handle("math.double", |payload: Value, _meta: Meta| async move {
//!         let n = payload["n"].as_i64().unwrap_or_default();
//!         Ok(json!({ "n": n * 2 }))
//!     });
//! let server = broker.clone();
//! tokio::spawn(async move { responder.consume(&server).await });
//!
//! let client = RpcClient::new(Arc::new(broker), RpcConfig::default());
//! let doubled = client.call("math", "math.double", json!({ "n": 21 }), None).await?;
//! assert_eq!(doubled, json!({ "n": 42 }));
//! # Ok(())
//! # }
//! ```

pub mod breaker;
pub mod client;
pub mod envelope;
pub mod error;
pub mod responder;

pub use breaker::{BreakerPool, CircuitBreaker};
pub use client::RpcClient;
pub use envelope::{Meta, RequestEnvelope, ResponseEnvelope, STATUS_ERROR, STATUS_OK};
pub use error::{Result, RpcError};
pub use responder::{Handler, HandlerFuture, HandlerResult, Responder, RouteTable};
