//! End-to-end bus behavior over the in-memory broker
//!
//! Covers:
//! - Ordered delivery through wildcard subscriptions
//! - Resubscribe after the broker drops every session
//! - Fail-fast publish while disconnected, queued subscriptions
//! - No reconnect after a stop issued while reconnecting
//! - Handler failure, panic and slowness isolation
//! - Unsubscribe, undecodable input, stop semantics

mod common;

use common::{collector, drain, memory_bus, payload, recv, wait_for_filter, WAIT};
use sabus::{handler_fn, BusError, ConnectionState, Envelope, MemoryBroker, Payload};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_three_messages_arrive_in_order() {
    let broker = MemoryBroker::new();
    let subscriber = memory_bus(&broker, "listener");
    let publisher = memory_bus(&broker, "tester");
    subscriber.wait_connected(WAIT).await.unwrap();
    publisher.wait_connected(WAIT).await.unwrap();

    let (handler, mut rx) = collector();
    subscriber.subscribe("sa/test/+", handler).await.unwrap();
    wait_for_filter(&broker, "sa/test/+", true).await;

    for i in 0..3 {
        publisher
            .publish(
                "sa/test/integration",
                "test.integration",
                payload(json!({"index": i, "msg": format!("message {i}")})),
                None,
            )
            .await
            .unwrap();
    }

    for i in 0..3 {
        let env = recv(&mut rx).await;
        assert_eq!(env.payload["index"], json!(i));
        assert_eq!(env.source, "tester");
        assert_eq!(env.event_type, "test.integration");
    }
    assert!(tokio::time::timeout(Duration::from_millis(100), rx.recv())
        .await
        .is_err());

    publisher.stop().await;
    subscriber.stop().await;
}

#[tokio::test]
async fn test_publish_returns_sent_envelope() {
    let broker = MemoryBroker::new();
    let bus = memory_bus(&broker, "asr");
    bus.wait_connected(WAIT).await.unwrap();

    let (handler, mut rx) = collector();
    bus.subscribe("sa/asr/text", handler).await.unwrap();
    wait_for_filter(&broker, "sa/asr/text", true).await;

    let sent = bus
        .publish("sa/asr/text", "asr.text", payload(json!({"text": "hello"})), Some("req-7".into()))
        .await
        .unwrap();
    let received = recv(&mut rx).await;

    assert_eq!(received, sent);
    assert_eq!(received.corr, "req-7");
    bus.stop().await;
}

#[tokio::test]
async fn test_resubscribes_after_broker_drop() {
    let broker = MemoryBroker::new();
    let subscriber = memory_bus(&broker, "demo-listener");
    let publisher = memory_bus(&broker, "demo");
    subscriber.wait_connected(WAIT).await.unwrap();
    publisher.wait_connected(WAIT).await.unwrap();

    let (handler, mut rx) = collector();
    subscriber.subscribe("sa/demo/#", handler).await.unwrap();
    wait_for_filter(&broker, "sa/demo/#", true).await;

    let mut states = [subscriber.state_receiver(), publisher.state_receiver()];
    broker.disconnect_all();

    for state in states.iter_mut() {
        tokio::time::timeout(WAIT, state.wait_for(|s| *s != ConnectionState::Connected))
            .await
            .expect("never noticed the drop")
            .unwrap();
    }
    subscriber.wait_connected(WAIT).await.unwrap();
    publisher.wait_connected(WAIT).await.unwrap();
    wait_for_filter(&broker, "sa/demo/#", true).await;

    publisher
        .publish("sa/demo/x", "demo.ping", Payload::new(), None)
        .await
        .unwrap();
    let env = recv(&mut rx).await;
    assert_eq!(env.event_type, "demo.ping");
    assert_eq!(broker.connect_count(), 4);

    publisher.stop().await;
    subscriber.stop().await;
}

#[tokio::test]
async fn test_publish_fails_fast_while_disconnected() {
    let broker = MemoryBroker::new();
    broker.set_online(false);
    let bus = memory_bus(&broker, "rules");

    let result = tokio::time::timeout(
        Duration::from_millis(100),
        bus.publish("sa/rules/fired", "rules.fired", Payload::new(), None),
    )
    .await
    .expect("publish must not wait for a connection");
    assert!(matches!(result, Err(BusError::NotConnected { .. })));

    broker.set_online(true);
    bus.wait_connected(WAIT).await.unwrap();
    bus.publish("sa/rules/fired", "rules.fired", Payload::new(), None)
        .await
        .unwrap();

    bus.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_while_reconnecting_never_reconnects() {
    let broker = MemoryBroker::new();
    broker.set_online(false);
    let bus = memory_bus(&broker, "chat");

    let mut states = bus.state_receiver();
    states
        .wait_for(|s| *s == ConnectionState::Reconnecting)
        .await
        .unwrap();

    bus.stop().await;
    broker.set_online(true);
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(broker.connect_count(), 0);
    assert_eq!(broker.session_count(), 0);
    assert_eq!(bus.state(), ConnectionState::Stopped);
}

#[tokio::test]
async fn test_subscription_before_connect_is_issued_on_connect() {
    let broker = MemoryBroker::new();
    broker.set_online(false);
    let bus = memory_bus(&broker, "vision");

    let (handler, mut rx) = collector();
    bus.subscribe("sa/vision/cmd/#", handler).await.unwrap();
    assert!(broker.subscriptions().is_empty());

    broker.set_online(true);
    bus.wait_connected(WAIT).await.unwrap();
    wait_for_filter(&broker, "sa/vision/cmd/#", true).await;

    bus.publish("sa/vision/cmd/scan", "vision.scan", Payload::new(), None)
        .await
        .unwrap();
    assert_eq!(recv(&mut rx).await.event_type, "vision.scan");

    bus.stop().await;
}

#[tokio::test]
async fn test_handler_failures_are_isolated() {
    let broker = MemoryBroker::new();
    let bus = memory_bus(&broker, "iso");
    bus.wait_connected(WAIT).await.unwrap();

    let failing = handler_fn(|_env: Envelope| async { Err::<(), _>(anyhow::anyhow!("boom")) });
    let panicking = handler_fn(|env: Envelope| async move {
        if env.event_type == "iso.event" {
            panic!("handler panicked");
        }
        anyhow::Ok(())
    });
    let slow = handler_fn(|_env: Envelope| async {
        tokio::time::sleep(Duration::from_secs(1)).await;
        anyhow::Ok(())
    });
    let (good, mut rx) = collector();

    bus.subscribe("sa/iso/t", failing).await.unwrap();
    bus.subscribe("sa/iso/t", panicking).await.unwrap();
    bus.subscribe("sa/iso/+", slow).await.unwrap();
    bus.subscribe("sa/iso/#", good).await.unwrap();
    wait_for_filter(&broker, "sa/iso/#", true).await;

    for _ in 0..2 {
        bus.publish("sa/iso/t", "iso.event", Payload::new(), None)
            .await
            .unwrap();
    }

    // Both arrive well before the slow handler finishes its first call.
    for _ in 0..2 {
        let env = tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .expect("good handler was held up")
            .unwrap();
        assert_eq!(env.event_type, "iso.event");
    }
    assert_eq!(bus.state(), ConnectionState::Connected);

    bus.stop().await;
}

#[tokio::test]
async fn test_unsubscribe_drops_broker_filter_with_last_handler() {
    let broker = MemoryBroker::new();
    let bus = memory_bus(&broker, "tts");
    bus.wait_connected(WAIT).await.unwrap();

    let (first, mut first_rx) = collector();
    let (second, mut second_rx) = collector();
    let first_id = bus.subscribe("sa/tts/say", first).await.unwrap();
    let second_id = bus.subscribe("sa/tts/say", second).await.unwrap();
    wait_for_filter(&broker, "sa/tts/say", true).await;

    assert!(bus.unsubscribe("sa/tts/say", first_id).await.unwrap());
    bus.publish("sa/tts/say", "tts.say", Payload::new(), None)
        .await
        .unwrap();
    assert_eq!(recv(&mut second_rx).await.event_type, "tts.say");
    assert!(first_rx.recv().await.is_none());

    assert!(bus.unsubscribe("sa/tts/say", second_id).await.unwrap());
    wait_for_filter(&broker, "sa/tts/say", false).await;
    assert!(!bus.unsubscribe("sa/tts/say", second_id).await.unwrap());

    bus.stop().await;
}

#[tokio::test]
async fn test_undecodable_messages_are_skipped() {
    let broker = MemoryBroker::new();
    let bus = memory_bus(&broker, "chat");
    bus.wait_connected(WAIT).await.unwrap();

    let (handler, mut rx) = collector();
    bus.subscribe("sa/chat/#", handler).await.unwrap();
    wait_for_filter(&broker, "sa/chat/#", true).await;

    broker.inject("sa/chat/in", "not valid json");
    broker.inject("sa/chat/in", r#"{"id": "1", "type": "x"}"#);
    bus.publish("sa/chat/in", "chat.message", Payload::new(), None)
        .await
        .unwrap();

    assert_eq!(recv(&mut rx).await.event_type, "chat.message");
    assert!(drain(&mut rx).is_empty());

    bus.stop().await;
}

#[tokio::test]
async fn test_invalid_filter_and_topic_rejected() {
    let broker = MemoryBroker::new();
    let bus = memory_bus(&broker, "m");
    bus.wait_connected(WAIT).await.unwrap();

    let (handler, _rx) = collector();
    assert!(matches!(
        bus.subscribe("sa/#/x", handler).await,
        Err(BusError::Topic(_))
    ));
    assert!(matches!(
        bus.publish("sa/+/x", "t", Payload::new(), None).await,
        Err(BusError::Topic(_))
    ));
    assert!(matches!(
        bus.publish("sa/m/x", "", Payload::new(), None).await,
        Err(BusError::EmptyField("type"))
    ));

    bus.stop().await;
}

#[tokio::test]
async fn test_start_listening_runs_until_stop() {
    let broker = MemoryBroker::new();
    let bus = memory_bus(&broker, "listener");
    let publisher = memory_bus(&broker, "talker");
    publisher.wait_connected(WAIT).await.unwrap();

    let (handler, mut rx) = collector();
    let listening = {
        let bus = bus.clone();
        tokio::spawn(async move { bus.start_listening(vec![("sa/talk/+", handler)]).await })
    };
    wait_for_filter(&broker, "sa/talk/+", true).await;

    publisher
        .publish("sa/talk/hello", "talk.hello", Payload::new(), None)
        .await
        .unwrap();
    assert_eq!(recv(&mut rx).await.source, "talker");
    assert!(!listening.is_finished());

    bus.stop().await;
    tokio::time::timeout(WAIT, listening)
        .await
        .expect("start_listening did not return after stop")
        .unwrap()
        .unwrap();

    publisher.stop().await;
}

#[tokio::test]
async fn test_stop_is_idempotent_and_final() {
    let broker = MemoryBroker::new();
    let bus = memory_bus(&broker, "m");
    let publisher = memory_bus(&broker, "p");
    bus.wait_connected(WAIT).await.unwrap();
    publisher.wait_connected(WAIT).await.unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let handler = handler_fn(move |_env: Envelope| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            anyhow::Ok(())
        }
    });
    bus.subscribe("sa/stop/#", handler).await.unwrap();
    wait_for_filter(&broker, "sa/stop/#", true).await;

    bus.stop().await;
    bus.stop().await;
    assert_eq!(bus.state(), ConnectionState::Stopped);

    publisher
        .publish("sa/stop/late", "late", Payload::new(), None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    assert!(matches!(
        bus.publish("sa/m/x", "t", Payload::new(), None).await,
        Err(BusError::Stopped)
    ));
    let (handler, _rx) = collector();
    assert!(matches!(
        bus.subscribe("sa/m/#", handler).await,
        Err(BusError::Stopped)
    ));

    publisher.stop().await;
}

#[tokio::test]
async fn test_stop_waits_for_running_handler() {
    let broker = MemoryBroker::new();
    let bus = memory_bus(&broker, "m");
    bus.wait_connected(WAIT).await.unwrap();

    let (started_tx, mut started_rx) = tokio::sync::mpsc::unbounded_channel();
    let finished = Arc::new(AtomicUsize::new(0));
    let done = finished.clone();
    let handler = handler_fn(move |_env: Envelope| {
        let started_tx = started_tx.clone();
        let done = done.clone();
        async move {
            let _ = started_tx.send(());
            tokio::time::sleep(Duration::from_millis(200)).await;
            done.fetch_add(1, Ordering::SeqCst);
            anyhow::Ok(())
        }
    });
    bus.subscribe("sa/m/work", handler).await.unwrap();
    wait_for_filter(&broker, "sa/m/work", true).await;

    bus.publish("sa/m/work", "work", Payload::new(), None)
        .await
        .unwrap();
    tokio::time::timeout(WAIT, started_rx.recv())
        .await
        .unwrap()
        .unwrap();

    bus.stop().await;
    assert_eq!(finished.load(Ordering::SeqCst), 1);
}
