//! Switchboard Core - shared configuration, logging and error types
//!
//! Everything here is consumed by the fabric and rpc layers and by the
//! runtime binaries; nothing here talks to a broker.

pub mod config;
pub mod error;
pub mod logging;
pub mod time;

pub use config::{BreakerConfig, BreakerScope, BrokerConfig, LoggingConfig, RpcConfig};
pub use error::{Error, Result};
