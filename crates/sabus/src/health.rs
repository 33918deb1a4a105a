//! Periodic health heartbeats on `<prefix>/sys/health`.
//!
//! A reporter publishes one heartbeat when started, then one every
//! interval, and exactly one final `stopped` heartbeat when stopped.
//! Publishing is best effort: a failed heartbeat is logged, remembered in
//! `last_error`, and the loop carries on.

use crate::bus::EventBus;
use crate::envelope::{utc_timestamp, Payload};
use crate::error::BusError;
use crate::topic;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Event type of heartbeat envelopes.
pub const HEARTBEAT_EVENT: &str = "health.heartbeat";

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Starting = 0,
    Running = 1,
    Error = 2,
    Stopped = 3,
}

impl HealthStatus {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => HealthStatus::Starting,
            1 => HealthStatus::Running,
            2 => HealthStatus::Error,
            _ => HealthStatus::Stopped,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Starting => "starting",
            HealthStatus::Running => "running",
            HealthStatus::Error => "error",
            HealthStatus::Stopped => "stopped",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Heartbeat payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub module: String,
    pub status: HealthStatus,
    /// Whole seconds since start
    pub uptime: u64,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Heartbeat {
    pub fn to_payload(&self) -> Payload {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => Payload::new(),
        }
    }

    /// Parse a heartbeat out of an envelope payload.
    pub fn from_payload(payload: &Payload) -> Result<Self, serde_json::Error> {
        serde_json::from_value(serde_json::Value::Object(payload.clone()))
    }
}

struct Inner {
    bus: Arc<EventBus>,
    module: String,
    topic: String,
    status: AtomicU8,
    last_error: Mutex<Option<String>>,
    started: Mutex<Option<Instant>>,
}

impl Inner {
    fn status(&self) -> HealthStatus {
        HealthStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    fn set_status(&self, status: HealthStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_last_error(&self, error: Option<String>) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = error;
    }

    fn uptime(&self) -> Duration {
        let started = *self.started.lock().unwrap_or_else(PoisonError::into_inner);
        started.map(|at| at.elapsed()).unwrap_or_default()
    }

    fn heartbeat(&self) -> Heartbeat {
        Heartbeat {
            module: self.module.clone(),
            status: self.status(),
            uptime: self.uptime().as_secs(),
            timestamp: utc_timestamp(),
            last_error: self.last_error(),
        }
    }

    async fn send(&self) -> Result<(), BusError> {
        let heartbeat = self.heartbeat();
        self.bus
            .publish(&self.topic, HEARTBEAT_EVENT, heartbeat.to_payload(), None)
            .await?;
        debug!("{}: heartbeat {}", self.module, heartbeat.status);
        Ok(())
    }

    /// Best-effort send: failures land in `last_error`.
    async fn beat(&self) {
        if let Err(e) = self.send().await {
            warn!("{}: heartbeat failed: {}", self.module, e);
            self.set_last_error(Some(format!("heartbeat_failed: {}", e)));
        }
    }
}

/// Publishes a module's health on a fixed interval.
pub struct HealthReporter {
    inner: Arc<Inner>,
    interval: Duration,
    task: AsyncMutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl HealthReporter {
    pub fn new(bus: Arc<EventBus>, module: impl Into<String>, interval: Duration) -> Self {
        let topic = topic::health_topic(&bus.config().topic_prefix);
        Self {
            inner: Arc::new(Inner {
                bus,
                module: module.into(),
                topic,
                status: AtomicU8::new(HealthStatus::Stopped as u8),
                last_error: Mutex::new(None),
                started: Mutex::new(None),
            }),
            interval,
            task: AsyncMutex::new(None),
        }
    }

    pub fn status(&self) -> HealthStatus {
        self.inner.status()
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.last_error()
    }

    pub fn uptime(&self) -> Duration {
        self.inner.uptime()
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    /// Send one heartbeat right now, outside the periodic loop.
    pub async fn send_heartbeat(&self) -> Result<(), BusError> {
        self.inner.send().await
    }

    /// Send a `starting` heartbeat and begin the periodic loop.
    pub async fn start(&self) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            warn!("{}: heartbeat already running", self.inner.module);
            return;
        }

        self.inner.set_status(HealthStatus::Starting);
        *self
            .inner
            .started
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
        self.inner.set_last_error(None);

        self.inner.beat().await;

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(heartbeat_loop(
            self.inner.clone(),
            self.interval,
            cancel.clone(),
        ));
        *task = Some((cancel, handle));

        self.inner.set_status(HealthStatus::Running);
        info!(
            "{}: heartbeat started (every {:?} on {})",
            self.inner.module, self.interval, self.inner.topic
        );
    }

    /// Record an error. A running reporter switches to `error`.
    pub fn report_error(&self, error: impl Into<String>) {
        let error = error.into();
        warn!("{}: reported error: {}", self.inner.module, error);
        self.inner.set_last_error(Some(error));
        let _ = self.inner.status.compare_exchange(
            HealthStatus::Running as u8,
            HealthStatus::Error as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Stop the loop and send exactly one final `stopped` heartbeat.
    /// Safe to call more than once.
    pub async fn stop(&self) {
        let mut task = self.task.lock().await;
        let Some((cancel, handle)) = task.take() else {
            return;
        };

        self.inner.set_status(HealthStatus::Stopped);
        cancel.cancel();
        if let Err(e) = handle.await {
            warn!("{}: heartbeat loop ended abnormally: {}", self.inner.module, e);
        }

        self.inner.beat().await;
        info!("{}: heartbeat stopped", self.inner.module);
    }
}

async fn heartbeat_loop(inner: Arc<Inner>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            _ = ticker.tick() => inner.beat().await,
        }
    }
}
