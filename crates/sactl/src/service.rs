//! The module service template
//!
//! The smallest complete module: an event bus, a health reporter, a couple
//! of subscriptions and a periodic demo publisher, with an orderly shutdown.
//! New modules start by copying this and replacing the handlers.

use crate::shutdown::ShutdownSignal;
use anyhow::{Context, Result};
use sabus::{
    handler_fn, topic, BusConfig, Envelope, EnvelopeHandler, EventBus, HealthReporter, HealthStatus,
    Heartbeat, Payload,
};
use saconf::SaConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Event type of the demo publisher.
pub const DEMO_EVENT: &str = "demo.ping";

const DEMO_INTERVAL: Duration = Duration::from_secs(60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Service {
    bus: Arc<EventBus>,
    health: Arc<HealthReporter>,
    demo_interval: Duration,
    cancel: CancellationToken,
    tasks: Mutex<Option<(JoinHandle<()>, JoinHandle<()>)>>,
}

impl Service {
    /// Service talking to the configured broker.
    pub fn new(config: &SaConfig, module: &str) -> Result<Self> {
        let bus_config =
            BusConfig::from_config(config, module).context("Invalid bus configuration")?;
        let bus = Arc::new(EventBus::connect(bus_config));
        let heartbeat = Duration::from_secs(config.system.heartbeat_interval_secs);
        Ok(Self::with_bus(bus, heartbeat, DEMO_INTERVAL))
    }

    pub fn with_bus(bus: Arc<EventBus>, heartbeat: Duration, demo_interval: Duration) -> Self {
        let health = Arc::new(HealthReporter::new(bus.clone(), bus.module(), heartbeat));
        Self {
            bus,
            health,
            demo_interval,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(None),
        }
    }

    fn subscriptions(&self) -> Vec<(String, Arc<dyn EnvelopeHandler>)> {
        let prefix = &self.bus.config().topic_prefix;
        let module = self.bus.module().to_string();

        let on_test = handler_fn(move |env: Envelope| {
            let module = module.clone();
            async move {
                info!(
                    "{}: test event {} from {}: {}",
                    module,
                    env.event_type,
                    env.source,
                    serde_json::Value::Object(env.payload)
                );
                anyhow::Ok(())
            }
        });

        let on_health = handler_fn(|env: Envelope| async move {
            let heartbeat = Heartbeat::from_payload(&env.payload)
                .with_context(|| format!("malformed heartbeat from {}", env.source))?;
            if heartbeat.status == HealthStatus::Error {
                warn!(
                    "module {} reports error: {}",
                    heartbeat.module,
                    heartbeat.last_error.as_deref().unwrap_or("unknown")
                );
            }
            anyhow::Ok(())
        });

        vec![
            (format!("{}/test/{}", prefix, topic::MULTI_LEVEL), on_test),
            (topic::health_topic(prefix), on_health),
        ]
    }

    /// Bring the service up. Returns once the heartbeat, subscriptions and
    /// demo publisher are running.
    pub async fn start(&self) -> Result<()> {
        let mut tasks = self.tasks.lock().await;
        if tasks.is_some() {
            warn!("{}: service already started", self.bus.module());
            return Ok(());
        }
        info!("{}: starting service", self.bus.module());

        if let Err(e) = self.bus.wait_connected(CONNECT_TIMEOUT).await {
            warn!("{}: {}, continuing while the bus reconnects", self.bus.module(), e);
        }

        self.health.start().await;

        let listen = {
            let bus = self.bus.clone();
            let health = self.health.clone();
            let subscriptions = self.subscriptions();
            tokio::spawn(async move {
                if let Err(e) = bus.start_listening(subscriptions).await {
                    warn!("{}: listening failed: {}", bus.module(), e);
                    health.report_error(format!("listen: {}", e));
                }
            })
        };

        let demo = tokio::spawn(demo_publisher(
            self.bus.clone(),
            self.health.clone(),
            self.demo_interval,
            self.cancel.clone(),
        ));

        *tasks = Some((listen, demo));
        info!("{}: service started", self.bus.module());
        Ok(())
    }

    /// Stop the demo task, then the heartbeat, then the bus. Idempotent.
    pub async fn stop(&self) {
        let mut tasks = self.tasks.lock().await;
        let Some((listen, demo)) = tasks.take() else {
            return;
        };
        info!("{}: stopping service", self.bus.module());

        self.cancel.cancel();
        if let Err(e) = demo.await {
            warn!("{}: demo publisher ended abnormally: {}", self.bus.module(), e);
        }

        self.health.stop().await;
        self.bus.stop().await;

        if let Err(e) = listen.await {
            warn!("{}: listen task ended abnormally: {}", self.bus.module(), e);
        }
        info!("{}: service stopped", self.bus.module());
    }
}

async fn demo_publisher(
    bus: Arc<EventBus>,
    health: Arc<HealthReporter>,
    every: Duration,
    cancel: CancellationToken,
) {
    let topic = topic::module_topic(&bus.config().topic_prefix, "test", "demo");
    let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            _ = ticker.tick() => {
                let mut payload = Payload::new();
                payload.insert("message".to_string(), "hello from template".into());
                match bus.publish(&topic, DEMO_EVENT, payload, None).await {
                    Ok(env) => debug!("{}: published demo event {}", bus.module(), env.id),
                    Err(e) => {
                        warn!("{}: demo publish failed: {}", bus.module(), e);
                        health.report_error(format!("demo_publisher: {}", e));
                    }
                }
            }
        }
    }
    debug!("{}: demo publisher stopped", bus.module());
}

/// Run the template service until SIGINT or SIGTERM.
pub async fn run(config: &SaConfig, module: &str) -> Result<()> {
    let shutdown = ShutdownSignal::new()?;
    let service = Service::new(config, module)?;
    service.start().await?;

    shutdown.wait().await;
    service.stop().await;
    Ok(())
}
