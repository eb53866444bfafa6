use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::channel::Channel;
use crate::codec::Codec;
use crate::error::{Error, Result};
use crate::transport::{Broker, DeliveryMode, Properties};

/// Perform one correlated request/reply exchange
///
/// Opens a session and a private reply destination, publishes `request` to
/// `queue` tagged with `correlation_id`, and waits until a reply carrying the
/// same correlation id arrives. Replies for other correlation ids are skipped
/// without extending the deadline. The session is closed on every path.
///
/// Returns the raw reply body, or `Error::Timeout` once `timeout` elapses.
pub async fn request<Req, C>(
    broker: &dyn Broker,
    queue: &str,
    request: &Req,
    correlation_id: &str,
    timeout: Duration,
    codec: C,
) -> Result<Vec<u8>>
where
    Req: Serialize,
    C: Codec,
{
    let mut channel = Channel::open(broker, codec).await?;
    let outcome = exchange(&mut channel, queue, request, correlation_id, timeout).await;
    if let Err(err) = channel.close().await {
        debug!(error = %err, "closing request session failed");
    }
    outcome
}

async fn exchange<Req, C>(
    channel: &mut Channel<C>,
    queue: &str,
    request: &Req,
    correlation_id: &str,
    timeout: Duration,
) -> Result<Vec<u8>>
where
    Req: Serialize,
    C: Codec,
{
    let reply_to = channel.reply_queue().await?;
    let properties = Properties::new()
        .with_correlation_id(correlation_id)
        .with_reply_to(reply_to)
        .with_delivery_mode(DeliveryMode::Transient);
    channel.publish(queue, request, &properties).await?;

    // A timeout past the end of the clock means no deadline at all
    let deadline = Instant::now().checked_add(timeout);
    loop {
        let next = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, channel.next_delivery())
                .await
                .map_err(|_| Error::Timeout(timeout))?,
            None => channel.next_delivery().await,
        };
        let delivery = next?.ok_or(Error::ConnectionClosed)?;
        if delivery.properties.correlation_id.as_deref() == Some(correlation_id) {
            return Ok(delivery.body);
        }
        trace!(
            expected = correlation_id,
            received = ?delivery.properties.correlation_id,
            "ignoring reply for another request"
        );
    }
}

/// Publish a message without waiting for a reply (fire-and-forget)
pub async fn send<T, C>(broker: &dyn Broker, queue: &str, message: &T, codec: C) -> Result<()>
where
    T: Serialize,
    C: Codec,
{
    let mut channel = Channel::open(broker, codec).await?;
    channel.publish(queue, message, &Properties::new()).await?;
    channel.close().await?;
    Ok(())
}
