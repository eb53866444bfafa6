//! Request and response envelopes as they travel on the wire.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub const STATUS_OK: u16 = 200;
pub const STATUS_ERROR: u16 = 500;

fn empty_payload() -> Value {
    Value::Object(Map::new())
}

/// Decode a field on its own: null or a value of the wrong shape becomes the
/// default instead of failing the whole envelope.
fn lenient<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let value = Value::deserialize(deserializer)?;
    Ok(T::deserialize(value).unwrap_or_default())
}

fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(text) => text,
        Value::Number(number) => number.to_string(),
        Value::Bool(flag) => flag.to_string(),
        _ => String::new(),
    })
}

fn payload_or_empty<'de, D>(deserializer: D) -> Result<Value, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Null => empty_payload(),
        payload => payload,
    })
}

/// A request for one route, built once per call attempt.
///
/// Fields decode independently: a missing, null or mistyped field takes its
/// default and the rest of the request is kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    #[serde(default, deserialize_with = "lenient_string")]
    pub route: String,
    #[serde(default = "empty_payload", deserialize_with = "payload_or_empty")]
    pub payload: Value,
    #[serde(default, deserialize_with = "lenient")]
    pub meta: Meta,
}

/// Caller metadata attached to every request.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Meta {
    /// Correlation identifier of the attempt that produced the request.
    #[serde(default, deserialize_with = "lenient_string")]
    pub request_id: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub app: String,
    /// Origination time, fractional Unix seconds.
    #[serde(default, deserialize_with = "lenient")]
    pub ts: f64,
}

impl RequestEnvelope {
    /// Build an envelope with a freshly minted correlation identifier.
    pub fn new(route: impl Into<String>, payload: Value, app: impl Into<String>) -> Self {
        Self {
            route: route.into(),
            payload,
            meta: Meta {
                request_id: Uuid::new_v4().to_string(),
                app: app.into(),
                ts: switchboard_core::time::unix_timestamp(),
            },
        }
    }

    pub fn request_id(&self) -> &str {
        &self.meta.request_id
    }
}

impl Default for RequestEnvelope {
    fn default() -> Self {
        Self {
            route: String::new(),
            payload: empty_payload(),
            meta: Meta::default(),
        }
    }
}

/// Outcome of one handled request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub status: u16,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub error: Option<String>,
}

impl ResponseEnvelope {
    pub fn ok(data: Value) -> Self {
        Self {
            status: STATUS_OK,
            data,
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: STATUS_ERROR,
            data: Value::Null,
            error: Some(message.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.status == STATUS_OK
    }
}
