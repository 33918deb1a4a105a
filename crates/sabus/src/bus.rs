//! The per-module bus handle.
//!
//! Each module builds its own [`EventBus`] from explicit configuration and
//! shares it by `Arc`. There is no process-wide client.

use crate::connection::{ConnectionManager, ConnectionState};
use crate::dispatch::Dispatcher;
use crate::envelope::{Envelope, Payload};
use crate::error::BusError;
use crate::handler::EnvelopeHandler;
use crate::reconnect::ReconnectPolicy;
use crate::registry::SubscriptionId;
use crate::topic;
use crate::transport::{MqttTransport, QoS, Transport};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

/// Everything a bus needs to reach the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusConfig {
    /// Module name, used as envelope `source` and in the client id
    pub module: String,
    pub broker: String,
    pub port: u16,
    /// Default QoS for publishes and subscriptions
    pub qos: QoS,
    pub keepalive_secs: u64,
    pub reconnect: ReconnectPolicy,
    /// Topic namespace prefix, e.g. `sa`
    pub topic_prefix: String,
    /// Fixed client id. Defaults to `<module>-<random>`.
    pub client_id: Option<String>,
}

impl BusConfig {
    /// A config for a broker on `localhost`, for tests and local tools.
    /// Services go through [`BusConfig::from_config`], where the broker
    /// address is required.
    pub fn new(module: impl Into<String>) -> Self {
        let mqtt = saconf::MqttConfig::default();
        Self {
            module: module.into(),
            broker: "localhost".to_string(),
            port: mqtt.port,
            qos: QoS::default(),
            keepalive_secs: mqtt.keepalive,
            reconnect: ReconnectPolicy::default(),
            topic_prefix: saconf::SystemConfig::default().service_prefix,
            client_id: None,
        }
    }

    /// Build from loaded configuration.
    pub fn from_config(config: &saconf::SaConfig, module: impl Into<String>) -> Result<Self, BusError> {
        let mqtt = &config.mqtt;
        Ok(Self {
            module: module.into(),
            broker: mqtt.broker.clone(),
            port: mqtt.port,
            qos: QoS::try_from(mqtt.qos)?,
            keepalive_secs: mqtt.keepalive,
            reconnect: ReconnectPolicy::from_config(mqtt),
            topic_prefix: config.system.service_prefix.clone(),
            client_id: None,
        })
    }

    pub fn with_broker(mut self, broker: impl Into<String>, port: u16) -> Self {
        self.broker = broker.into();
        self.port = port;
        self
    }

    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// The MQTT client id, unique per process unless fixed.
    pub fn client_id(&self) -> String {
        match &self.client_id {
            Some(id) => id.clone(),
            None => {
                let suffix = Uuid::new_v4().simple().to_string();
                format!("{}-{}", self.module, &suffix[..8])
            }
        }
    }
}

/// Publish/subscribe handle for one module.
///
/// ```rust,no_run
/// # async fn demo() -> anyhow::Result<()> {
/// use sabus::{handler_fn, BusConfig, Envelope, EventBus, Payload};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let bus = Arc::new(EventBus::connect(BusConfig::new("tts")));
/// bus.wait_connected(Duration::from_secs(5)).await?;
///
/// bus.subscribe("sa/tts/cmd/#", handler_fn(|env: Envelope| async move {
///     println!("say: {:?}", env.payload.get("text"));
///     anyhow::Ok(())
/// }))
/// .await?;
///
/// bus.publish("sa/tts/status", "tts.ready", Payload::new(), None).await?;
/// bus.stop().await;
/// # Ok(())
/// # }
/// ```
pub struct EventBus {
    config: BusConfig,
    connection: ConnectionManager,
    dispatcher: Arc<Dispatcher>,
    cancel: CancellationToken,
    listen_task: Mutex<Option<JoinHandle<()>>>,
    /// Serializes register/unregister with each other and with stop
    subscriptions: Mutex<()>,
    stopped: AtomicBool,
}

impl EventBus {
    /// Connect to the configured MQTT broker. The session comes up in the
    /// background; use [`EventBus::wait_connected`] to wait for it.
    pub fn connect(config: BusConfig) -> Self {
        let transport = MqttTransport::new(&config);
        info!(
            "{}: connecting to mqtt://{}:{}",
            config.module, config.broker, config.port
        );
        Self::with_transport(config, transport)
    }

    /// Run the bus over any transport.
    pub fn with_transport<T: Transport>(config: BusConfig, transport: T) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let connection =
            ConnectionManager::spawn(config.module.clone(), transport, config.reconnect, inbound_tx);
        let dispatcher = Arc::new(Dispatcher::new(config.module.clone()));

        let listener = dispatcher.clone();
        let listen_task = tokio::spawn(async move { listener.run(inbound_rx).await });

        Self {
            config,
            connection,
            dispatcher,
            cancel: CancellationToken::new(),
            listen_task: Mutex::new(Some(listen_task)),
            subscriptions: Mutex::new(()),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn module(&self) -> &str {
        &self.config.module
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.connection.state_receiver()
    }

    pub async fn wait_connected(&self, wait: Duration) -> Result<(), BusError> {
        self.connection.wait_connected(wait).await
    }

    /// Build an envelope from this module and send it at the configured QoS.
    ///
    /// Fails immediately when the session is down; nothing is retried.
    /// Returns the envelope that was sent.
    pub async fn publish(
        &self,
        topic: &str,
        event_type: &str,
        payload: Payload,
        corr: Option<String>,
    ) -> Result<Envelope, BusError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(BusError::Stopped);
        }
        topic::validate_topic(topic)?;

        let envelope = Envelope::build(self.config.module.as_str(), event_type, payload, corr)?;
        let encoded = envelope.encode()?;
        self.connection
            .publish(topic, encoded.into_bytes(), self.config.qos)
            .await?;

        debug!(
            "{}: published {} on {} ({})",
            self.config.module, envelope.event_type, topic, envelope.id
        );
        Ok(envelope)
    }

    /// Register a handler for `filter`. The broker hears about the filter
    /// when it is new, immediately if connected or on the next connect.
    pub async fn subscribe(
        &self,
        filter: &str,
        handler: Arc<dyn EnvelopeHandler>,
    ) -> Result<SubscriptionId, BusError> {
        topic::validate_filter(filter)?;

        let _guard = self.subscriptions.lock().await;
        if self.stopped.load(Ordering::Acquire) {
            return Err(BusError::Stopped);
        }

        let (id, first) = self
            .dispatcher
            .register(filter, &self.config.module, handler)
            .await;
        if first {
            self.connection.subscribe(filter, self.config.qos).await?;
        }
        info!("{}: subscribed to {}", self.config.module, filter);
        Ok(id)
    }

    /// Remove one registration. Returns false if it was not registered. The
    /// broker-level subscription goes when the last handler for the filter
    /// leaves.
    pub async fn unsubscribe(&self, filter: &str, id: SubscriptionId) -> Result<bool, BusError> {
        let _guard = self.subscriptions.lock().await;
        if self.stopped.load(Ordering::Acquire) {
            return Err(BusError::Stopped);
        }

        match self.dispatcher.unregister(filter, id).await {
            None => Ok(false),
            Some(last) => {
                if last {
                    self.connection.unsubscribe(filter).await?;
                }
                info!("{}: unsubscribed {} from {}", self.config.module, id, filter);
                Ok(true)
            }
        }
    }

    /// Register every subscription, then run until [`EventBus::stop`].
    pub async fn start_listening<I, S>(&self, subscriptions: I) -> Result<(), BusError>
    where
        I: IntoIterator<Item = (S, Arc<dyn EnvelopeHandler>)>,
        S: AsRef<str>,
    {
        for (filter, handler) in subscriptions {
            self.subscribe(filter.as_ref(), handler).await?;
        }
        info!("{}: listening", self.config.module);
        self.cancel.cancelled().await;
        Ok(())
    }

    /// Graceful, idempotent shutdown.
    ///
    /// The connection goes to `Stopped` (no more reconnects), the listen loop
    /// is cancelled and awaited, and handler invocations already running are
    /// awaited. Queued envelopes not yet handed to a handler are discarded.
    /// No handler runs after this returns. Must not be called from inside a
    /// handler of this bus.
    pub async fn stop(&self) {
        {
            let _guard = self.subscriptions.lock().await;
            if !self.stopped.swap(true, Ordering::AcqRel) {
                info!("{}: stopping event bus", self.config.module);
            }
        }

        self.cancel.cancel();
        self.connection.stop().await;
        self.dispatcher.shutdown().await;

        let mut listen_task = self.listen_task.lock().await;
        if let Some(handle) = listen_task.take() {
            if let Err(e) = handle.await {
                debug!("{}: listen loop ended abnormally: {}", self.config.module, e);
            }
        }
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
