use std::any::Any;
use std::collections::HashMap;
use std::future::{self, Future};
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use futures::FutureExt;
use serde_json::Value;
use switchboard_fabric::codec::{Codec, JsonCodec};
use switchboard_fabric::{Broker, Channel, Delivery, DeliveryMode, Properties};
use tracing::{debug, error, info};

use crate::envelope::{Meta, RequestEnvelope, ResponseEnvelope};
use crate::error::Result;

pub type HandlerResult = anyhow::Result<Value>;
pub type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;

/// Application code bound to a route
///
/// Implemented for any `Fn(Value, Meta) -> impl Future<Output = anyhow::Result<Value>>`.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, payload: Value, meta: Meta) -> HandlerFuture;
}

impl<F, Fut> Handler for F
where
    F: Fn(Value, Meta) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(&self, payload: Value, meta: Meta) -> HandlerFuture {
        Box::pin(self(payload, meta))
    }
}

/// Route name to handler; the last registration for a route wins
#[derive(Clone, Default)]
pub struct RouteTable {
    routes: HashMap<String, Arc<dyn Handler>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `route`, returning whether an earlier binding was replaced
    pub fn insert(&mut self, route: impl Into<String>, handler: Arc<dyn Handler>) -> bool {
        self.routes.insert(route.into(), handler).is_some()
    }

    pub fn get(&self, route: &str) -> Option<&Arc<dyn Handler>> {
        self.routes.get(route)
    }

    pub fn contains(&self, route: &str) -> bool {
        self.routes.contains_key(route)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Registered route names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.routes.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Responder side of the rpc protocol
///
/// Consumes one queue with prefetch 1, so requests are handled strictly one
/// after another. Each delivery is acknowledged before its reply is published.
pub struct Responder {
    queue: String,
    durable: bool,
    routes: RouteTable,
    codec: JsonCodec,
}

impl Responder {
    /// Responder for `queue`, declared durable unless told otherwise
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            durable: true,
            routes: RouteTable::new(),
            codec: JsonCodec,
        }
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// Bind `route` to `handler`, replacing any earlier binding
    pub fn handle<F, Fut>(self, route: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Value, Meta) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.handle_arc(route, Arc::new(handler))
    }

    /// Bind `route` to an already shared handler
    pub fn handle_arc(mut self, route: impl Into<String>, handler: Arc<dyn Handler>) -> Self {
        let route = route.into();
        if self.routes.insert(route.clone(), handler) {
            debug!(route = %route, "route handler replaced");
        }
        self
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    /// Run the consume loop until the broker closes the session
    pub async fn consume(&self, broker: &dyn Broker) -> Result<()> {
        self.consume_until(broker, future::pending()).await
    }

    /// Run the consume loop until the broker closes the session or `shutdown`
    /// resolves
    ///
    /// Transport failures end the loop with an error; handler failures never do.
    pub async fn consume_until<S>(&self, broker: &dyn Broker, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()> + Send,
    {
        let mut channel = Channel::open(broker, self.codec).await?;
        channel.declare_queue(&self.queue, self.durable).await?;
        channel.set_prefetch(1).await?;
        channel.consume(&self.queue).await?;
        info!(queue = %self.queue, routes = ?self.routes.names(), "rpc responder listening");

        tokio::pin!(shutdown);
        loop {
            let delivery = tokio::select! {
                _ = &mut shutdown => {
                    info!(queue = %self.queue, "rpc responder shutting down");
                    break;
                }
                next = channel.next_delivery() => match next? {
                    Some(delivery) => delivery,
                    None => {
                        info!(queue = %self.queue, "broker closed the session");
                        break;
                    }
                },
            };
            self.process(&mut channel, delivery).await?;
        }

        channel.close().await?;
        Ok(())
    }

    async fn process(&self, channel: &mut Channel<JsonCodec>, delivery: Delivery) -> Result<()> {
        let response = self.dispatch(&delivery.body).await;
        channel.ack(delivery.tag).await?;

        let Some(reply_to) = delivery.properties.reply_to else {
            debug!(status = response.status, "request carried no reply destination; reply dropped");
            return Ok(());
        };

        let mut properties = Properties::new()
            .with_content_type(self.codec.content_type())
            .with_delivery_mode(DeliveryMode::Transient);
        if let Some(correlation_id) = delivery.properties.correlation_id {
            properties = properties.with_correlation_id(correlation_id);
        }
        channel.publish(&reply_to, &response, &properties).await?;
        Ok(())
    }

    /// Decode one request body and run its handler
    ///
    /// Never fails: undecodable requests, unknown routes, handler errors and
    /// handler panics all become status-500 responses.
    pub async fn dispatch(&self, body: &[u8]) -> ResponseEnvelope {
        let request: RequestEnvelope = match self.codec.decode(body) {
            Ok(request) => request,
            Err(err) => {
                debug!(error = %err, "undecodable request treated as empty");
                RequestEnvelope::default()
            }
        };
        let RequestEnvelope {
            route,
            payload,
            meta,
        } = request;

        let Some(handler) = self.routes.get(&route) else {
            let message = format!("no handler for route: {route}");
            error!(route = %route, request_id = %meta.request_id, "{message}");
            return ResponseEnvelope::error(message);
        };

        debug!(route = %route, request_id = %meta.request_id, "dispatching request");
        let request_id = meta.request_id.clone();
        let outcome = AssertUnwindSafe(async move { handler.call(payload, meta).await })
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(data)) => ResponseEnvelope::ok(data),
            Ok(Err(err)) => {
                error!(route = %route, request_id = %request_id, error = ?err, "rpc handler failed");
                ResponseEnvelope::error(err.to_string())
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(route = %route, request_id = %request_id, panic = %message, "rpc handler panicked");
                ResponseEnvelope::error(message)
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_owned()
    }
}
