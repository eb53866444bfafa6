use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use switchboard_core::{BreakerScope, RpcConfig};
use switchboard_fabric::{
    codec::JsonCodec,
    request::send,
    transport::{Broker, JournalEntry, MemoryBroker, Properties, Session},
};
use switchboard_rpc::{
    CircuitBreaker, Meta, RequestEnvelope, Responder, ResponseEnvelope, RpcClient, RpcError,
};
use tokio::task::JoinHandle;
use tokio::time::Instant;

fn config() -> RpcConfig {
    RpcConfig::default()
}

fn client(broker: &MemoryBroker, config: RpcConfig) -> RpcClient {
    RpcClient::new(Arc::new(broker.clone()), config)
}

fn echo_responder(queue: &str) -> Responder {
    Responder::new(queue)
        .durable(false)
        .handle("echo", |payload: Value, _meta: Meta| async move { Ok(payload) })
        .handle("fail", |_payload: Value, _meta: Meta| async move {
            anyhow::bail!("inventory unavailable")
        })
}

/// Spawn the consume loop and wait until it is attached to its queue
async fn start(broker: &MemoryBroker, responder: Responder) -> JoinHandle<Result<(), RpcError>> {
    let queue = responder.queue().to_owned();
    let server = broker.clone();
    let handle = tokio::spawn(async move { responder.consume(&server).await });
    while broker.consumer_count(&queue) == 0 {
        tokio::task::yield_now().await;
    }
    handle
}

async fn declare(broker: &MemoryBroker, queue: &str) {
    let mut session = broker.connect().await.unwrap();
    session.declare_queue(queue, false).await.unwrap();
    session.close().await.unwrap();
}

#[tokio::test]
async fn call_returns_handler_data() {
    let broker = MemoryBroker::new();
    let _server = start(&broker, echo_responder("svc")).await;
    let client = client(&broker, config());

    let result = client
        .call("svc", "echo", json!({"sku": "A-1"}), None)
        .await
        .unwrap();
    assert_eq!(result, json!({"sku": "A-1"}));
}

#[tokio::test]
async fn endpoint_is_resolved_through_config() {
    let broker = MemoryBroker::new();
    let _server = start(&broker, echo_responder("service-1-queue")).await;
    let mut config = config();
    config
        .endpoints
        .insert("service-1".into(), "service-1-queue".into());
    let client = client(&broker, config);

    let result = client.call("service-1", "echo", json!(7), None).await.unwrap();
    assert_eq!(result, json!(7));
    assert_eq!(broker.publish_count("service-1-queue"), 1);
}

#[tokio::test]
async fn unknown_route_is_a_remote_error() {
    let broker = MemoryBroker::new();
    let _server = start(&broker, echo_responder("svc")).await;
    let client = client(&broker, config());

    let err = client
        .call("svc", "unknown.route", json!({}), None)
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Failed { attempts: 1, .. }));
    assert!(matches!(err.last_error(), RpcError::Remote(_)));
    assert_eq!(
        err.remote_message(),
        Some("no handler for route: unknown.route")
    );
}

#[tokio::test]
async fn handler_failure_does_not_stop_the_responder() {
    let broker = MemoryBroker::new();
    let server = start(&broker, echo_responder("svc")).await;
    let client = client(&broker, config());

    let err = client.call("svc", "fail", json!({}), None).await.unwrap_err();
    assert_eq!(err.remote_message(), Some("inventory unavailable"));

    let result = client.call("svc", "echo", json!("again"), None).await.unwrap();
    assert_eq!(result, json!("again"));
    assert!(!server.is_finished());
}

#[tokio::test(start_paused = true)]
async fn missing_reply_times_out() {
    let broker = MemoryBroker::new();
    declare(&broker, "silent").await;
    let client = client(&broker, config());
    let started = Instant::now();

    let err = client
        .call("silent", "ping", json!({}), Some(Duration::from_secs(3)))
        .await
        .unwrap_err();

    assert!(err.is_timeout(), "{err}");
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(3), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(3_100), "{elapsed:?}");

    // The abandoned reply destination is gone
    assert!(broker
        .queue_names()
        .iter()
        .all(|name| !name.starts_with("amq.gen-")));
}

#[tokio::test]
async fn maximal_caller_timeout_is_accepted() {
    let broker = MemoryBroker::new();
    let _server = start(&broker, echo_responder("svc")).await;
    let client = client(&broker, config());

    let result = client
        .call("svc", "echo", json!("patient"), Some(Duration::MAX))
        .await
        .unwrap();
    assert_eq!(result, json!("patient"));
}

#[tokio::test]
async fn requests_are_handled_one_at_a_time() {
    let broker = MemoryBroker::new();
    let started = Arc::new(AtomicUsize::new(0));
    let release = Arc::new(tokio::sync::Notify::new());
    let responder = {
        let started = Arc::clone(&started);
        let release = Arc::clone(&release);
        Responder::new("svc")
            .durable(false)
            .handle("slow", move |payload: Value, _meta: Meta| {
                let started = Arc::clone(&started);
                let release = Arc::clone(&release);
                async move {
                    started.fetch_add(1, Ordering::SeqCst);
                    release.notified().await;
                    Ok(payload)
                }
            })
    };
    let _server = start(&broker, responder).await;
    let client = Arc::new(client(&broker, config()));

    let calls: Vec<_> = (0..2)
        .map(|n| {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.call("svc", "slow", json!(n), None).await })
        })
        .collect();

    while broker.publish_count("svc") < 2 || started.load(Ordering::SeqCst) < 1 {
        tokio::task::yield_now().await;
    }
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    // The second request waits in the queue until the first is acked
    assert_eq!(started.load(Ordering::SeqCst), 1);
    assert_eq!(broker.queue_depth("svc"), Some(1));
    assert!(!broker
        .journal()
        .iter()
        .any(|entry| matches!(entry, JournalEntry::Ack { queue, .. } if queue == "svc")));

    release.notify_one();
    while started.load(Ordering::SeqCst) < 2 {
        tokio::task::yield_now().await;
    }
    assert_eq!(broker.queue_depth("svc"), Some(0));
    let acks = broker
        .journal()
        .iter()
        .filter(|entry| matches!(entry, JournalEntry::Ack { queue, .. } if queue == "svc"))
        .count();
    assert_eq!(acks, 1);

    release.notify_one();
    let mut results = Vec::new();
    for call in calls {
        results.push(call.await.unwrap().unwrap());
    }
    results.sort_by_key(|value| value.as_i64());
    assert_eq!(results, vec![json!(0), json!(1)]);
}

#[tokio::test(start_paused = true)]
async fn stale_replies_are_ignored() {
    let broker = MemoryBroker::new();
    declare(&broker, "svc").await;

    let server = broker.clone();
    tokio::spawn(async move {
        let mut session = server.connect().await.unwrap();
        session.consume("svc").await.unwrap();
        let delivery = session.next_delivery().await.unwrap().unwrap();
        session.ack(delivery.tag).await.unwrap();
        let reply_to = delivery.properties.reply_to.clone().unwrap();

        let stale = serde_json::to_vec(&ResponseEnvelope::ok(json!("stale"))).unwrap();
        let props = Properties::new().with_correlation_id("an-expired-attempt");
        session.publish(&reply_to, &stale, &props).await.unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        let fresh = serde_json::to_vec(&ResponseEnvelope::ok(json!("fresh"))).unwrap();
        let props = Properties::new()
            .with_correlation_id(delivery.properties.correlation_id.clone().unwrap());
        session.publish(&reply_to, &fresh, &props).await.unwrap();
    });

    let client = client(&broker, config());
    let result = client.call("svc", "anything", json!({}), None).await.unwrap();
    assert_eq!(result, json!("fresh"));
}

#[tokio::test(start_paused = true)]
async fn only_stale_replies_still_time_out() {
    let broker = MemoryBroker::new();
    declare(&broker, "svc").await;

    let server = broker.clone();
    tokio::spawn(async move {
        let mut session = server.connect().await.unwrap();
        session.consume("svc").await.unwrap();
        let delivery = session.next_delivery().await.unwrap().unwrap();
        let reply_to = delivery.properties.reply_to.clone().unwrap();
        let body = serde_json::to_vec(&ResponseEnvelope::ok(json!("stale"))).unwrap();
        let props = Properties::new().with_correlation_id("not-yours");
        session.publish(&reply_to, &body, &props).await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
    });

    let client = client(&broker, config());
    let err = client
        .call("svc", "anything", json!({}), Some(Duration::from_secs(1)))
        .await
        .unwrap_err();
    assert!(err.is_timeout());
}

#[tokio::test]
async fn unstructured_reply_is_invalid() {
    let broker = MemoryBroker::new();
    declare(&broker, "svc").await;

    let server = broker.clone();
    tokio::spawn(async move {
        let mut session = server.connect().await.unwrap();
        session.consume("svc").await.unwrap();
        let delivery = session.next_delivery().await.unwrap().unwrap();
        let reply_to = delivery.properties.reply_to.clone().unwrap();
        let props = Properties::new()
            .with_correlation_id(delivery.properties.correlation_id.clone().unwrap());
        session.publish(&reply_to, b"<html>", &props).await.unwrap();
    });

    let client = client(&broker, config());
    let err = client.call("svc", "x", json!({}), None).await.unwrap_err();
    assert!(matches!(err.last_error(), RpcError::InvalidResponse(_)));
}

#[tokio::test]
async fn ack_precedes_reply() {
    let broker = MemoryBroker::new();
    let _server = start(&broker, echo_responder("svc")).await;
    let client = client(&broker, config());
    client.call("svc", "echo", json!(1), None).await.unwrap();

    let journal = broker.journal();
    let ack = journal
        .iter()
        .position(|entry| matches!(entry, JournalEntry::Ack { queue, .. } if queue == "svc"))
        .unwrap();
    let reply = journal
        .iter()
        .position(|entry| matches!(entry, JournalEntry::Publish { queue, .. } if queue.starts_with("amq.gen-")))
        .unwrap();
    assert!(ack < reply, "{journal:?}");
}

#[tokio::test]
async fn request_without_reply_destination_is_processed_and_acked() {
    let broker = MemoryBroker::new();
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    let responder = Responder::new("events")
        .durable(false)
        .handle("record", move |_payload: Value, _meta: Meta| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Null)
            }
        });
    let server = start(&broker, responder).await;

    let request = RequestEnvelope::new("record", json!({}), "tests");
    send(&broker, "events", &request, JsonCodec).await.unwrap();

    while !broker
        .journal()
        .iter()
        .any(|entry| matches!(entry, JournalEntry::Ack { .. }))
    {
        tokio::task::yield_now().await;
    }
    assert_eq!(seen.load(Ordering::SeqCst), 1);
    assert_eq!(broker.queue_depth("events"), Some(0));
    assert_eq!(
        broker
            .journal()
            .iter()
            .filter(|entry| matches!(entry, JournalEntry::Publish { .. }))
            .count(),
        1
    );
    assert!(!server.is_finished());
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_publish_once_per_attempt() {
    let broker = MemoryBroker::new();
    declare(&broker, "silent").await;
    let mut config = config();
    config.retries = 2;
    config.retry_delay_ms = 100;
    config.timeout_seconds = 1.0;
    let client = client(&broker, config);
    let started = Instant::now();

    let err = client.call("silent", "ping", json!({}), None).await.unwrap_err();

    assert!(matches!(err, RpcError::Failed { attempts: 3, .. }));
    assert!(err.is_timeout());
    assert_eq!(broker.publish_count("silent"), 3);
    // Three one-second waits plus two 100 ms pauses between attempts
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(3_200), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(3_300), "{elapsed:?}");
    assert_eq!(client.breaker_for("silent").fail_count(), 3);

    // Every attempt minted its own correlation id
    let mut ids: Vec<_> = broker
        .journal()
        .into_iter()
        .filter_map(|entry| match entry {
            JournalEntry::Publish {
                queue,
                correlation_id,
            } if queue == "silent" => correlation_id,
            _ => None,
        })
        .collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn retry_recovers_after_transient_failure() {
    let broker = MemoryBroker::new();
    let _server = start(&broker, echo_responder("svc")).await;
    broker.set_offline(true);

    let mut config = config();
    config.retries = 1;
    config.retry_delay_ms = 200;
    let client = Arc::new(client(&broker, config));

    let call = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.call("svc", "echo", json!("late"), None).await })
    };
    // First attempt fails to connect; bring the broker back during the delay
    while broker.connect_count() < 2 {
        tokio::task::yield_now().await;
    }
    broker.set_offline(false);

    assert_eq!(call.await.unwrap().unwrap(), json!("late"));
    assert_eq!(client.breaker_for("svc").fail_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn success_resets_the_failure_count() {
    let broker = MemoryBroker::new();
    let _server = start(&broker, echo_responder("svc")).await;
    let client = client(&broker, config());

    broker.set_offline(true);
    for _ in 0..2 {
        assert!(client.call("svc", "echo", json!(1), None).await.is_err());
    }
    assert_eq!(client.breaker_for("svc").fail_count(), 2);

    broker.set_offline(false);
    client.call("svc", "echo", json!(1), None).await.unwrap();
    assert_eq!(client.breaker_for("svc").fail_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn open_breaker_rejects_without_io_until_window_passes() {
    let broker = MemoryBroker::new();
    let _server = start(&broker, echo_responder("svc")).await;
    let mut config = config();
    config.breaker.failure_threshold = 3;
    config.breaker.open_seconds = 15;
    let client = client(&broker, config);

    broker.set_offline(true);
    for _ in 0..3 {
        let err = client.call("svc", "echo", json!(1), None).await.unwrap_err();
        assert!(matches!(err.last_error(), RpcError::Transport(_)));
    }
    assert!(client.breaker_for("svc").is_open());
    broker.set_offline(false);
    let connects = broker.connect_count();

    tokio::time::advance(Duration::from_secs(1)).await;
    let err = client.call("svc", "echo", json!(1), None).await.unwrap_err();
    assert!(matches!(err, RpcError::CircuitOpen));
    assert_eq!(broker.connect_count(), connects);

    tokio::time::advance(Duration::from_secs(15)).await;
    let result = client.call("svc", "echo", json!("back"), None).await.unwrap();
    assert_eq!(result, json!("back"));
    assert_eq!(broker.connect_count(), connects + 1);
    assert_eq!(client.breaker_for("svc").fail_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn injected_breaker_is_shared_between_clients() {
    let broker = MemoryBroker::new();
    declare(&broker, "silent").await;
    let _server = start(&broker, echo_responder("svc")).await;
    let breaker = Arc::new(CircuitBreaker::new(1, Duration::from_secs(15)));

    let mut fast = config();
    fast.timeout_seconds = 0.1;
    let a = client(&broker, fast.clone()).with_breaker(Arc::clone(&breaker));
    let b = client(&broker, fast).with_breaker(Arc::clone(&breaker));

    assert!(a.call("silent", "ping", json!({}), None).await.is_err());
    assert!(breaker.is_open());

    // Failures against one endpoint gate calls to every endpoint
    let err = b.call("svc", "echo", json!(1), None).await.unwrap_err();
    assert!(matches!(err, RpcError::CircuitOpen));
}

#[tokio::test(start_paused = true)]
async fn endpoint_scope_isolates_breakers() {
    let broker = MemoryBroker::new();
    declare(&broker, "silent").await;
    let _server = start(&broker, echo_responder("svc")).await;
    let mut config = config();
    config.timeout_seconds = 0.1;
    config.breaker.failure_threshold = 1;
    config.breaker.scope = BreakerScope::Endpoint;
    let client = client(&broker, config);

    assert!(client.call("silent", "ping", json!({}), None).await.is_err());
    let err = client.call("silent", "ping", json!({}), None).await.unwrap_err();
    assert!(matches!(err, RpcError::CircuitOpen));

    let result = client.call("svc", "echo", json!("ok"), None).await.unwrap();
    assert_eq!(result, json!("ok"));
}

#[tokio::test]
async fn concurrent_calls_get_their_own_replies() {
    let broker = MemoryBroker::new();
    let _server = start(&broker, echo_responder("svc")).await;
    let client = Arc::new(client(&broker, config()));

    let calls: Vec<_> = (0..10)
        .map(|n| {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.call("svc", "echo", json!({"n": n}), None).await })
        })
        .collect();

    for (n, call) in calls.into_iter().enumerate() {
        assert_eq!(call.await.unwrap().unwrap(), json!({"n": n}));
    }
}

#[tokio::test]
async fn typed_call_round_trips_structs() {
    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Order {
        sku: String,
        qty: u32,
    }

    let broker = MemoryBroker::new();
    let _server = start(&broker, echo_responder("svc")).await;
    let client = client(&broker, config());

    let order = Order {
        sku: "A-1".into(),
        qty: 3,
    };
    let echoed: Order = client.call_as("svc", "echo", &order, None).await.unwrap();
    assert_eq!(echoed, order);

    let err = client
        .call_as::<_, u32>("svc", "echo", &order, None)
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::InvalidResponse(_)));
}

#[tokio::test]
async fn consume_returns_when_broker_closes() {
    let broker = MemoryBroker::new();
    let server = start(&broker, echo_responder("svc")).await;

    broker.shutdown();
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn consume_until_stops_on_shutdown_signal() {
    let broker = MemoryBroker::new();
    let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
    let responder = echo_responder("svc");
    let server = broker.clone();
    let handle = tokio::spawn(async move {
        responder
            .consume_until(&server, async {
                let _ = stopped.await;
            })
            .await
    });
    while broker.consumer_count("svc") == 0 {
        tokio::task::yield_now().await;
    }

    stop.send(()).unwrap();
    handle.await.unwrap().unwrap();
    assert_eq!(broker.consumer_count("svc"), 0);
    assert!(broker.has_queue("svc"));
}
