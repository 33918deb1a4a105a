//! Error types for bus operations.

use crate::connection::ConnectionState;
use crate::topic::TopicError;
use thiserror::Error;

/// Failures surfaced to callers of the bus.
#[derive(Debug, Error)]
pub enum BusError {
    /// Publish attempted while the session is down. Not retried.
    #[error("not connected to broker (state: {state})")]
    NotConnected { state: ConnectionState },

    /// The bus was stopped; it will never accept work again.
    #[error("event bus is stopped")]
    Stopped,

    #[error(transparent)]
    Topic(#[from] TopicError),

    #[error("invalid QoS level {0}, expected 0, 1 or 2")]
    InvalidQos(u8),

    #[error("envelope field '{0}' must not be empty")]
    EmptyField(&'static str),

    #[error("failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Failures from the broker transport. These drive reconnects and are only
/// visible to callers as a failed publish.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("broker refused connection: {0}")]
    Refused(String),

    #[error("connection closed")]
    Closed,

    #[error("no broker session")]
    NoSession,

    #[error("request rejected: {0}")]
    Request(String),
}
