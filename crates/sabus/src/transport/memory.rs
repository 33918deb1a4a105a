//! In-process broker.
//!
//! Routes publishes to every session holding a matching filter, using the
//! same matcher the dispatcher uses. Tests drive failure modes through
//! [`MemoryBroker::set_online`] and [`MemoryBroker::disconnect_all`].

use super::{InboundMessage, QoS, Transport, TransportEvent, TransportReceiver, TransportSender};
use crate::error::TransportError;
use crate::topic;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

enum Delivery {
    Message(InboundMessage),
    Closed,
}

struct Session {
    filters: BTreeMap<String, QoS>,
    tx: mpsc::UnboundedSender<Delivery>,
}

struct BrokerState {
    online: bool,
    next_session: u64,
    sessions: HashMap<u64, Session>,
    connects: u64,
}

/// A broker living inside the process. Clones share the same broker.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                online: true,
                next_session: 1,
                sessions: HashMap::new(),
                connects: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A new client connection to this broker.
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            broker: self.clone(),
        }
    }

    /// Going offline drops every session and refuses new ones.
    pub fn set_online(&self, online: bool) {
        let mut state = self.lock();
        state.online = online;
        if !online {
            close_all(&mut state);
        }
    }

    /// Drop every session, as if the broker restarted.
    pub fn disconnect_all(&self) {
        close_all(&mut self.lock());
    }

    /// Deliver raw bytes as if some other client published them.
    pub fn inject(&self, topic: &str, payload: impl Into<Bytes>) {
        self.route(topic, payload.into());
    }

    /// Every filter held by every live session, sorted.
    pub fn subscriptions(&self) -> Vec<String> {
        let state = self.lock();
        let mut filters: Vec<String> = state
            .sessions
            .values()
            .flat_map(|s| s.filters.keys().cloned())
            .collect();
        filters.sort();
        filters
    }

    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    /// Total successful connects since creation.
    pub fn connect_count(&self) -> u64 {
        self.lock().connects
    }

    fn open_session(&self) -> Result<(u64, mpsc::UnboundedReceiver<Delivery>), TransportError> {
        let mut state = self.lock();
        if !state.online {
            return Err(TransportError::Connection("broker offline".to_string()));
        }
        let id = state.next_session;
        state.next_session += 1;
        state.connects += 1;

        let (tx, rx) = mpsc::unbounded_channel();
        state.sessions.insert(
            id,
            Session {
                filters: BTreeMap::new(),
                tx,
            },
        );
        Ok((id, rx))
    }

    fn close_session(&self, id: u64) {
        if let Some(session) = self.lock().sessions.remove(&id) {
            let _ = session.tx.send(Delivery::Closed);
        }
    }

    fn with_session<T>(
        &self,
        id: u64,
        f: impl FnOnce(&mut Session) -> T,
    ) -> Result<T, TransportError> {
        let mut state = self.lock();
        let session = state
            .sessions
            .get_mut(&id)
            .ok_or(TransportError::NoSession)?;
        Ok(f(session))
    }

    /// One copy per session, however many of its filters match.
    fn route(&self, topic: &str, payload: Bytes) {
        let state = self.lock();
        for session in state.sessions.values() {
            if session.filters.keys().any(|f| topic::matches(topic, f)) {
                let _ = session.tx.send(Delivery::Message(InboundMessage {
                    topic: topic.to_string(),
                    payload: payload.clone(),
                }));
            }
        }
    }
}

fn close_all(state: &mut BrokerState) {
    for (_, session) in state.sessions.drain() {
        let _ = session.tx.send(Delivery::Closed);
    }
}

/// Unconnected client for a [`MemoryBroker`]. Connects on first poll.
pub struct MemoryTransport {
    broker: MemoryBroker,
}

impl Transport for MemoryTransport {
    type Sender = MemorySender;
    type Receiver = MemoryReceiver;

    fn split(self) -> (MemorySender, MemoryReceiver) {
        let session = Arc::new(Mutex::new(None));
        (
            MemorySender {
                broker: self.broker.clone(),
                session: session.clone(),
            },
            MemoryReceiver {
                broker: self.broker,
                session,
                inbox: None,
            },
        )
    }
}

type SessionSlot = Arc<Mutex<Option<u64>>>;

fn current(slot: &SessionSlot) -> Option<u64> {
    *slot.lock().unwrap_or_else(PoisonError::into_inner)
}

fn set_current(slot: &SessionSlot, id: Option<u64>) {
    *slot.lock().unwrap_or_else(PoisonError::into_inner) = id;
}

pub struct MemorySender {
    broker: MemoryBroker,
    session: SessionSlot,
}

impl MemorySender {
    fn session(&self) -> Result<u64, TransportError> {
        current(&self.session).ok_or(TransportError::NoSession)
    }
}

#[async_trait]
impl TransportSender for MemorySender {
    async fn publish(&self, topic: &str, _qos: QoS, payload: Vec<u8>) -> Result<(), TransportError> {
        self.session()?;
        self.broker.route(topic, Bytes::from(payload));
        Ok(())
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), TransportError> {
        let id = self.session()?;
        self.broker.with_session(id, |s| {
            s.filters.insert(filter.to_string(), qos);
        })
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), TransportError> {
        let id = self.session()?;
        self.broker.with_session(id, |s| {
            s.filters.remove(filter);
        })
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        if let Some(id) = current(&self.session) {
            self.broker.close_session(id);
        }
        Ok(())
    }
}

pub struct MemoryReceiver {
    broker: MemoryBroker,
    session: SessionSlot,
    inbox: Option<mpsc::UnboundedReceiver<Delivery>>,
}

#[async_trait]
impl TransportReceiver for MemoryReceiver {
    async fn poll(&mut self) -> Result<TransportEvent, TransportError> {
        let Some(inbox) = self.inbox.as_mut() else {
            let (id, inbox) = self.broker.open_session()?;
            set_current(&self.session, Some(id));
            self.inbox = Some(inbox);
            return Ok(TransportEvent::Connected);
        };

        match inbox.recv().await {
            Some(Delivery::Message(message)) => Ok(TransportEvent::Message(message)),
            Some(Delivery::Closed) | None => {
                self.inbox = None;
                set_current(&self.session, None);
                Err(TransportError::Closed)
            }
        }
    }
}
