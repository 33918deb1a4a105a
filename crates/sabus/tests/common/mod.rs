//! Shared helpers for the bus integration tests.

#![allow(dead_code)]

use sabus::{handler_fn, BusConfig, Envelope, EnvelopeHandler, EventBus, MemoryBroker, Payload, ReconnectPolicy};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub const WAIT: Duration = Duration::from_secs(2);

/// A bus on the in-memory broker with short reconnect delays.
pub fn memory_bus(broker: &MemoryBroker, module: &str) -> Arc<EventBus> {
    let config = BusConfig::new(module).with_reconnect(ReconnectPolicy::new(
        Duration::from_millis(50),
        Duration::from_millis(400),
    ));
    Arc::new(EventBus::with_transport(config, broker.transport()))
}

/// Handler that forwards every envelope into a channel.
pub fn collector() -> (Arc<dyn EnvelopeHandler>, mpsc::UnboundedReceiver<Envelope>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = handler_fn(move |env: Envelope| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(env);
            anyhow::Ok(())
        }
    });
    (handler, rx)
}

pub fn payload(value: serde_json::Value) -> Payload {
    match value {
        serde_json::Value::Object(map) => map,
        other => panic!("payload must be an object, got {other}"),
    }
}

/// Wait until the broker holds (or no longer holds) `filter` for some session.
pub async fn wait_for_filter(broker: &MemoryBroker, filter: &str, present: bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let held = broker.subscriptions().iter().any(|f| f == filter);
        if held == present {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "broker filter {filter} never became present={present}: {:?}",
            broker.subscriptions()
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Receive one envelope or fail the test.
pub async fn recv(rx: &mut mpsc::UnboundedReceiver<Envelope>) -> Envelope {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for envelope")
        .expect("handler channel closed")
}

/// Everything received so far, without waiting.
pub fn drain(rx: &mut mpsc::UnboundedReceiver<Envelope>) -> Vec<Envelope> {
    let mut out = Vec::new();
    while let Ok(env) = rx.try_recv() {
        out.push(env);
    }
    out
}
