//! sabus - the event bus shared by the smart-assistant modules
//!
//! Modules (speech recognition, speech synthesis, vision, chat, rules) never
//! call each other directly. They publish [`Envelope`]s to topics on an MQTT
//! broker and subscribe to topic filters, and this crate is the one piece
//! all of them link against.
//!
//! ## Layers
//!
//! - [`envelope`]: the JSON message format (`id, ts, source, type, corr,
//!   payload, meta.ver`).
//! - [`topic`]: `+`/`#` filter matching and the `<prefix>/<module>/...`
//!   namespace.
//! - [`connection`]: a reactor task owning the broker session, reconnecting
//!   with capped backoff and restoring subscriptions.
//! - [`registry`] and [`dispatch`]: filter to handler mapping and
//!   per-handler worker queues.
//! - [`bus`]: the [`EventBus`] handle tying it together.
//! - [`health`]: periodic heartbeats on `<prefix>/sys/health`.
//!
//! ## Transports
//!
//! [`EventBus::connect`] talks MQTT through rumqttc. [`MemoryBroker`] is an
//! in-process broker with the same semantics, used by the tests and handy
//! for running modules without a broker.
//!
//! ## Delivery
//!
//! At most the broker's QoS guarantee, no persistence, and no ordering
//! across topics. A given handler sees the messages of one topic in broker
//! order; different handlers run concurrently and a failing or slow handler
//! only affects itself.

pub mod bus;
pub mod connection;
pub mod dispatch;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod health;
pub mod reconnect;
pub mod registry;
pub mod topic;
pub mod transport;

pub use bus::{BusConfig, EventBus};
pub use connection::ConnectionState;
pub use envelope::{Envelope, EnvelopeMeta, Payload, PROTOCOL_VERSION};
pub use error::{BusError, TransportError};
pub use handler::{handler_fn, EnvelopeHandler};
pub use health::{HealthReporter, HealthStatus, Heartbeat, HEARTBEAT_EVENT};
pub use reconnect::ReconnectPolicy;
pub use registry::SubscriptionId;
pub use topic::matches;
pub use transport::{MemoryBroker, QoS};
