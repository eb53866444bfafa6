use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use switchboard_core::RpcConfig;
use switchboard_fabric::codec::{Codec, JsonCodec};
use switchboard_fabric::request::request;
use switchboard_fabric::Broker;
use tracing::{debug, warn};

use crate::breaker::{BreakerPool, CircuitBreaker};
use crate::envelope::RequestEnvelope;
use crate::error::{Result, RpcError};

/// Caller side of the rpc protocol
///
/// Every attempt opens its own broker session, so one client can serve any
/// number of concurrent calls.
pub struct RpcClient {
    broker: Arc<dyn Broker>,
    config: RpcConfig,
    breakers: BreakerPool,
    codec: JsonCodec,
}

impl RpcClient {
    pub fn new(broker: Arc<dyn Broker>, config: RpcConfig) -> Self {
        let breakers = BreakerPool::new(config.breaker.clone());
        Self {
            broker,
            config,
            breakers,
            codec: JsonCodec,
        }
    }

    /// Use `breaker` for every process-scope call, sharing it with whoever
    /// else holds it.
    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breakers = BreakerPool::with_shared(self.config.breaker.clone(), breaker);
        self
    }

    pub fn config(&self) -> &RpcConfig {
        &self.config
    }

    /// The breaker governing calls to `endpoint`
    pub fn breaker_for(&self, endpoint: &str) -> Arc<CircuitBreaker> {
        self.breakers.for_queue(self.config.queue_for(endpoint))
    }

    /// Call `route` on `endpoint` and wait for its result
    ///
    /// `timeout` bounds each attempt; `None` uses the configured default.
    #[tracing::instrument(skip(self, payload), fields(queue = tracing::field::Empty))]
    pub async fn call(
        &self,
        endpoint: &str,
        route: &str,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let queue = self.config.queue_for(endpoint);
        tracing::Span::current().record("queue", queue);

        let breaker = self.breakers.for_queue(queue);
        breaker.check()?;

        let timeout = timeout.unwrap_or_else(|| self.config.timeout());
        let attempts = self.config.attempts();
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.attempt_once(queue, route, &payload, timeout).await {
                Ok(result) => {
                    breaker.record_success();
                    return Ok(result);
                }
                Err(err) => {
                    breaker.record_failure();
                    warn!(attempt, attempts, error = %err, "rpc attempt failed");
                    last_error = Some(err);
                    if attempt < attempts {
                        tokio::time::sleep(self.config.retry_delay()).await;
                    }
                }
            }
        }

        breaker.trip_if_exhausted();
        let last = last_error.unwrap_or(RpcError::Timeout(timeout));
        Err(RpcError::Failed {
            attempts,
            last: Box::new(last),
        })
    }

    /// Typed form of [`call`](Self::call)
    pub async fn call_as<Req, Res>(
        &self,
        endpoint: &str,
        route: &str,
        payload: &Req,
        timeout: Option<Duration>,
    ) -> Result<Res>
    where
        Req: Serialize,
        Res: DeserializeOwned,
    {
        let payload = serde_json::to_value(payload)?;
        let result = self.call(endpoint, route, payload, timeout).await?;
        serde_json::from_value(result).map_err(|e| RpcError::InvalidResponse(e.to_string()))
    }

    async fn attempt_once(
        &self,
        queue: &str,
        route: &str,
        payload: &Value,
        timeout: Duration,
    ) -> Result<Value> {
        let envelope = RequestEnvelope::new(route, payload.clone(), self.config.app.as_str());
        debug!(request_id = envelope.request_id(), route, "publishing rpc request");

        let body = request(
            self.broker.as_ref(),
            queue,
            &envelope,
            envelope.request_id(),
            timeout,
            self.codec,
        )
        .await?;
        interpret_reply(&self.codec, &body)
    }
}

/// Turn a reply body into the call's result
///
/// A non-null `error` is a remote failure. Otherwise `data` is the result;
/// bodies without a `data` key are returned whole. A `data` key holding null
/// yields `Value::Null`, not the whole body.
fn interpret_reply(codec: &JsonCodec, body: &[u8]) -> Result<Value> {
    let decoded: Value = codec
        .decode(body)
        .map_err(|e| RpcError::InvalidResponse(e.to_string()))?;

    match decoded {
        Value::Object(mut fields) => {
            match fields.get("error") {
                None | Some(Value::Null) => {}
                Some(Value::String(message)) => return Err(RpcError::Remote(message.clone())),
                Some(other) => return Err(RpcError::Remote(other.to_string())),
            }
            Ok(fields.remove("data").unwrap_or(Value::Object(fields)))
        }
        list @ Value::Array(_) => Ok(list),
        other => Err(RpcError::InvalidResponse(format!(
            "expected a JSON object, got {other}"
        ))),
    }
}
