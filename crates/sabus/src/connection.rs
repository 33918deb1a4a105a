//! Broker session lifecycle.
//!
//! A single reactor task owns the sending half of the transport. Publishes,
//! subscribes and unsubscribes reach it over one command channel, so every
//! outbound write goes through one send path. Sends are awaited, so a full
//! transport queue slows callers down instead of failing them. The receiving
//! half runs in a separate pump task that keeps polling the session while the
//! reactor waits. The reactor keeps the set of broker-level filters and
//! re-issues all of them after every successful connect.
//!
//! ```text
//! Disconnected -> Connecting -> Connected <-> Reconnecting
//!                                   \______________/
//!                                          |
//!                                       Stopped
//! ```
//!
//! Connect failures never surface to callers. They move the session to
//! `Reconnecting` and the pump retries with [`ReconnectPolicy`] backoff while
//! the reactor keeps serving commands.

use crate::error::{BusError, TransportError};
use crate::reconnect::ReconnectPolicy;
use crate::transport::{
    InboundMessage, QoS, Transport, TransportEvent, TransportReceiver, TransportSender,
};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Queue depth between callers and the reactor.
const COMMAND_CAPACITY: usize = 256;

/// How long `stop()` lets the transport flush its disconnect.
const DISCONNECT_FLUSH: Duration = Duration::from_millis(500);

/// Broker session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Terminal. A stopped manager is never reused.
    Stopped,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

enum ConnectionCommand {
    Publish {
        topic: String,
        payload: Vec<u8>,
        qos: QoS,
        reply: oneshot::Sender<Result<(), BusError>>,
    },
    Subscribe {
        filter: String,
        qos: QoS,
    },
    Unsubscribe {
        filter: String,
    },
}

/// Handle to the reactor owning one broker session.
pub struct ConnectionManager {
    name: String,
    cmd_tx: mpsc::Sender<ConnectionCommand>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Spawn the reactor. Inbound application messages are forwarded to
    /// `inbound` in broker order.
    pub fn spawn<T: Transport>(
        name: impl Into<String>,
        transport: T,
        policy: ReconnectPolicy,
        inbound: mpsc::UnboundedSender<InboundMessage>,
    ) -> Self {
        let name = name.into();
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let state_tx = Arc::new(state_tx);
        let cancel = CancellationToken::new();

        let reactor = Reactor {
            name: name.clone(),
            state: state_tx.clone(),
            policy,
            inbound,
            filters: BTreeMap::new(),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(reactor.run(transport, cmd_rx));

        Self {
            name,
            cmd_tx,
            state_tx,
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Observe state transitions.
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Wait until `Connected`. Fails with `Stopped` if the manager stops
    /// first, or `NotConnected` on timeout.
    pub async fn wait_connected(&self, wait: Duration) -> Result<(), BusError> {
        let mut rx = self.state_tx.subscribe();
        let reached = tokio::time::timeout(wait, async move {
            rx.wait_for(|s| matches!(s, ConnectionState::Connected | ConnectionState::Stopped))
                .await
                .map(|state| *state)
        })
        .await;

        match reached {
            Ok(Ok(ConnectionState::Connected)) => Ok(()),
            Ok(_) => Err(BusError::Stopped),
            Err(_) => Err(BusError::NotConnected {
                state: self.state(),
            }),
        }
    }

    /// Send one message. Fails fast unless the session is up.
    pub async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), BusError> {
        match self.state() {
            ConnectionState::Connected => {}
            ConnectionState::Stopped => return Err(BusError::Stopped),
            state => return Err(BusError::NotConnected { state }),
        }

        let (reply, reply_rx) = oneshot::channel();
        self.send(ConnectionCommand::Publish {
            topic: topic.to_string(),
            payload,
            qos,
            reply,
        })
        .await?;
        reply_rx.await.map_err(|_| BusError::Stopped)?
    }

    /// Add a broker-level filter. Issued now if connected, otherwise on the
    /// next connect.
    pub async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), BusError> {
        self.send(ConnectionCommand::Subscribe {
            filter: filter.to_string(),
            qos,
        })
        .await
    }

    /// Drop a broker-level filter.
    pub async fn unsubscribe(&self, filter: &str) -> Result<(), BusError> {
        self.send(ConnectionCommand::Unsubscribe {
            filter: filter.to_string(),
        })
        .await
    }

    /// Stop reconnecting, disconnect, and wait for the reactor to exit.
    /// Safe to call more than once.
    pub async fn stop(&self) {
        self.cancel.cancel();

        let mut task = self.task.lock().await;
        if let Some(handle) = task.take() {
            if let Err(e) = handle.await {
                warn!("{}: connection reactor ended abnormally: {}", self.name, e);
            }
        }
        self.state_tx.send_replace(ConnectionState::Stopped);
    }

    async fn send(&self, cmd: ConnectionCommand) -> Result<(), BusError> {
        if self.cancel.is_cancelled() {
            return Err(BusError::Stopped);
        }
        self.cmd_tx.send(cmd).await.map_err(|_| BusError::Stopped)
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// What the session pump reports to the reactor.
enum SessionEvent {
    Up,
    Message(InboundMessage),
    Down {
        error: TransportError,
        attempt: u32,
        retry_in: Duration,
    },
}

/// Drives the receiver from its own task so the session keeps moving while
/// the reactor waits on a send. Backs off after every failed poll.
async fn pump<R: TransportReceiver>(
    name: String,
    mut receiver: R,
    policy: ReconnectPolicy,
    events: mpsc::UnboundedSender<SessionEvent>,
    cancel: CancellationToken,
) {
    let mut attempt: u32 = 0;

    loop {
        let polled = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            polled = receiver.poll() => polled,
        };

        let (event, delay) = match polled {
            Ok(TransportEvent::Connected) => {
                attempt = 0;
                (SessionEvent::Up, Duration::ZERO)
            }
            Ok(TransportEvent::Message(message)) => (SessionEvent::Message(message), Duration::ZERO),
            Ok(TransportEvent::Idle) => continue,
            Err(error) => {
                attempt = attempt.saturating_add(1);
                let retry_in = policy.delay_for_attempt(attempt);
                (
                    SessionEvent::Down {
                        error,
                        attempt,
                        retry_in,
                    },
                    retry_in,
                )
            }
        };

        if events.send(event).is_err() {
            break;
        }
        if !delay.is_zero() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
    trace!("{}: session pump exited", name);
}

struct Reactor {
    name: String,
    state: Arc<watch::Sender<ConnectionState>>,
    policy: ReconnectPolicy,
    inbound: mpsc::UnboundedSender<InboundMessage>,
    /// Active broker-level filters, re-issued on every connect
    filters: BTreeMap<String, QoS>,
    cancel: CancellationToken,
}

impl Reactor {
    fn current(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("{}: connection {} -> {}", self.name, previous, state);
        }
    }

    /// Await a send, giving up when the manager is stopped.
    async fn send<F>(&self, request: F) -> Result<(), TransportError>
    where
        F: Future<Output = Result<(), TransportError>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(TransportError::Closed),
            result = request => result,
        }
    }

    async fn run<T: Transport>(mut self, transport: T, mut cmd_rx: mpsc::Receiver<ConnectionCommand>) {
        let (sender, receiver) = transport.split();
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let pump_cancel = CancellationToken::new();
        let pump_task = tokio::spawn(pump(
            self.name.clone(),
            receiver,
            self.policy,
            events_tx,
            pump_cancel.clone(),
        ));

        self.set_state(ConnectionState::Connecting);

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    debug!("{}: connection reactor cancelled", self.name);
                    break;
                }

                event = events.recv() => {
                    match event {
                        Some(event) => self.handle_event(event, &sender).await,
                        None => {
                            debug!("{}: session pump gone, reactor exiting", self.name);
                            break;
                        }
                    }
                }

                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd, &sender).await,
                        None => {
                            debug!("{}: command channel closed, reactor exiting", self.name);
                            break;
                        }
                    }
                }
            }
        }

        let was_connected = self.current() == ConnectionState::Connected;
        self.set_state(ConnectionState::Stopped);

        if was_connected {
            // Let the pump put the disconnect on the wire before it goes.
            let flush = async {
                if let Err(e) = sender.disconnect().await {
                    debug!("{}: disconnect request failed: {}", self.name, e);
                    return;
                }
                while let Some(event) = events.recv().await {
                    if matches!(event, SessionEvent::Down { .. }) {
                        break;
                    }
                }
            };
            let _ = tokio::time::timeout(DISCONNECT_FLUSH, flush).await;
        }

        pump_cancel.cancel();
        if let Err(e) = pump_task.await {
            warn!("{}: session pump ended abnormally: {}", self.name, e);
        }

        cmd_rx.close();
        while let Ok(cmd) = cmd_rx.try_recv() {
            if let ConnectionCommand::Publish { reply, .. } = cmd {
                let _ = reply.send(Err(BusError::Stopped));
            }
        }

        info!("{}: connection stopped", self.name);
    }

    async fn handle_event<S: TransportSender>(&mut self, event: SessionEvent, sender: &S) {
        match event {
            SessionEvent::Up => self.on_connected(sender).await,
            SessionEvent::Message(message) => {
                trace!("{}: inbound on {}", self.name, message.topic);
                if self.inbound.send(message).is_err() {
                    trace!("{}: inbound receiver gone, dropping message", self.name);
                }
            }
            SessionEvent::Down {
                error,
                attempt,
                retry_in,
            } => {
                if self.current() == ConnectionState::Connected {
                    warn!("{}: broker connection lost: {}", self.name, error);
                } else {
                    debug!(
                        "{}: connect attempt {} failed: {} (retry in {:?})",
                        self.name, attempt, error, retry_in
                    );
                }
                self.set_state(ConnectionState::Reconnecting);
            }
        }
    }

    async fn on_connected<S: TransportSender>(&self, sender: &S) {
        info!(
            "{}: connected to broker, restoring {} subscription(s)",
            self.name,
            self.filters.len()
        );
        self.set_state(ConnectionState::Connected);

        for (filter, qos) in &self.filters {
            if let Err(e) = self.send(sender.subscribe(filter, *qos)).await {
                warn!("{}: failed to restore subscription {}: {}", self.name, filter, e);
            }
        }
    }

    async fn handle_command<S: TransportSender>(&mut self, cmd: ConnectionCommand, sender: &S) {
        let connected = self.current() == ConnectionState::Connected;

        match cmd {
            ConnectionCommand::Publish {
                topic,
                payload,
                qos,
                reply,
            } => {
                let result = if connected {
                    trace!("{}: publish {} ({} bytes)", self.name, topic, payload.len());
                    self.send(sender.publish(&topic, qos, payload))
                        .await
                        .map_err(BusError::from)
                } else {
                    Err(BusError::NotConnected {
                        state: self.current(),
                    })
                };
                let _ = reply.send(result);
            }
            ConnectionCommand::Subscribe { filter, qos } => {
                if connected {
                    if let Err(e) = self.send(sender.subscribe(&filter, qos)).await {
                        warn!("{}: subscribe {} failed: {}", self.name, filter, e);
                    }
                } else {
                    debug!("{}: queued subscription {} until connected", self.name, filter);
                }
                self.filters.insert(filter, qos);
            }
            ConnectionCommand::Unsubscribe { filter } => {
                if self.filters.remove(&filter).is_some() && connected {
                    if let Err(e) = self.send(sender.unsubscribe(&filter)).await {
                        warn!("{}: unsubscribe {} failed: {}", self.name, filter, e);
                    }
                }
            }
        }
    }
}
