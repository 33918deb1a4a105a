//! Inbound message fan-out.
//!
//! Every subscription has a worker task fed by its own FIFO queue. The
//! listen loop decodes each inbound message once, snapshots the matching
//! subscriptions and pushes the envelope onto each queue, so a slow or
//! failing handler only ever delays itself.
//!
//! Workers run each invocation in a spawned task and await it. That keeps
//! per-handler ordering and turns a panic into a logged `JoinError`.
//!
//! On shutdown an invocation already running is allowed to finish and is
//! awaited. Envelopes still queued behind it are discarded.

use crate::envelope::Envelope;
use crate::handler::EnvelopeHandler;
use crate::registry::{Subscription, SubscriptionId, SubscriptionRegistry};
use crate::transport::InboundMessage;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, trace, warn};

pub struct Dispatcher {
    name: String,
    registry: SubscriptionRegistry,
    workers: TaskTracker,
    cancel: CancellationToken,
}

impl Dispatcher {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            registry: SubscriptionRegistry::new(),
            workers: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    /// Register a handler and start its worker.
    ///
    /// Returns the new id and whether this is the first subscription for
    /// `filter`.
    pub async fn register(
        &self,
        filter: &str,
        owner: &str,
        handler: Arc<dyn EnvelopeHandler>,
    ) -> (SubscriptionId, bool) {
        let id = SubscriptionId::new();
        let (queue, queue_rx) = mpsc::unbounded_channel();

        self.workers.spawn(worker(
            self.name.clone(),
            filter.to_string(),
            handler,
            queue_rx,
            self.cancel.clone(),
        ));

        let first = self
            .registry
            .insert(Subscription {
                id,
                filter: filter.to_string(),
                owner: owner.to_string(),
                queue,
            })
            .await;

        debug!("{}: registered {} on {}", self.name, id, filter);
        (id, first)
    }

    /// Remove a handler. Its worker exits once its queue drains.
    ///
    /// `None` if not registered, otherwise whether `filter` has no
    /// subscriptions left.
    pub async fn unregister(&self, filter: &str, id: SubscriptionId) -> Option<bool> {
        let removed = self.registry.remove(filter, id).await;
        if removed.is_some() {
            debug!("{}: unregistered {} from {}", self.name, id, filter);
        }
        removed
    }

    /// Decode one inbound message and queue it for every matching handler.
    /// Returns how many handlers it was queued for.
    pub async fn dispatch(&self, message: InboundMessage) -> usize {
        let envelope = match Envelope::try_decode(&message.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(
                    "{}: dropping undecodable message on {}: {}",
                    self.name, message.topic, e
                );
                return 0;
            }
        };

        let targets = self.registry.matching(&message.topic).await;
        if targets.is_empty() {
            trace!("{}: no handlers for {}", self.name, message.topic);
            return 0;
        }

        let mut queued = 0;
        for subscription in &targets {
            if subscription.queue.send(envelope.clone()).is_ok() {
                queued += 1;
            } else {
                debug!(
                    "{}: worker for {} already gone",
                    self.name, subscription.id
                );
            }
        }
        queued
    }

    /// Listen loop. Runs until [`Dispatcher::shutdown`] or the inbound
    /// channel closes.
    pub async fn run(&self, mut inbound: mpsc::UnboundedReceiver<InboundMessage>) {
        debug!("{}: listen loop started", self.name);
        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => break,

                message = inbound.recv() => match message {
                    Some(message) => {
                        self.dispatch(message).await;
                    }
                    None => {
                        debug!("{}: inbound channel closed", self.name);
                        break;
                    }
                },
            }
        }
        debug!("{}: listen loop stopped", self.name);
    }

    /// Stop the listen loop and all workers, waiting for in-flight handler
    /// invocations. No handler runs after this returns.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.workers.close();
        self.workers.wait().await;
        self.registry.clear().await;
    }
}

async fn worker(
    name: String,
    filter: String,
    handler: Arc<dyn EnvelopeHandler>,
    mut queue: mpsc::UnboundedReceiver<Envelope>,
    cancel: CancellationToken,
) {
    loop {
        let envelope = tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            next = queue.recv() => match next {
                Some(envelope) => envelope,
                None => break,
            },
        };

        let event_type = envelope.event_type.clone();
        let invocation = handler.clone();
        match tokio::spawn(async move { invocation.handle(envelope).await }).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(
                    "{}: handler on {} failed for {}: {:#}",
                    name, filter, event_type, e
                );
            }
            Err(e) if e.is_panic() => {
                error!("{}: handler on {} panicked for {}", name, filter, event_type);
            }
            Err(e) => {
                debug!("{}: handler on {} cancelled: {}", name, filter, e);
            }
        }
    }
    trace!("{}: worker for {} exited", name, filter);
}
