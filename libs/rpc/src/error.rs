use std::time::Duration;

use thiserror::Error;

/// Failure of an rpc call as seen by the caller
#[derive(Error, Debug)]
pub enum RpcError {
    /// The breaker rejected the call; no transport I/O took place.
    #[error("rpc circuit open; try later")]
    CircuitOpen,

    /// No correlated reply arrived before the deadline.
    #[error("rpc timeout after {0:?}")]
    Timeout(Duration),

    /// The reply body was not a structured JSON document.
    #[error("invalid rpc response: {0}")]
    InvalidResponse(String),

    /// The responder reported a handler failure.
    #[error("remote error: {0}")]
    Remote(String),

    /// Every attempt failed; carries the last attempt's error.
    #[error("rpc failed after {attempts} attempt(s): {last}")]
    Failed {
        attempts: u32,
        #[source]
        last: Box<RpcError>,
    },

    #[error("transport error: {0}")]
    Transport(#[source] switchboard_fabric::Error),

    #[error("invalid payload: {0}")]
    Payload(#[from] serde_json::Error),
}

impl RpcError {
    /// The concrete error behind any `Failed` wrapping.
    pub fn last_error(&self) -> &RpcError {
        match self {
            RpcError::Failed { last, .. } => last.last_error(),
            other => other,
        }
    }

    /// Message reported by the responder, if this is (or wraps) a remote error.
    pub fn remote_message(&self) -> Option<&str> {
        match self.last_error() {
            RpcError::Remote(message) => Some(message),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.last_error(), RpcError::Timeout(_))
    }
}

impl From<switchboard_fabric::Error> for RpcError {
    fn from(err: switchboard_fabric::Error) -> Self {
        match err {
            switchboard_fabric::Error::Timeout(after) => RpcError::Timeout(after),
            other => RpcError::Transport(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;
