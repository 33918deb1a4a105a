//! Broker transport seam.
//!
//! A transport is split into a sender half (outbound requests, awaited so a
//! full queue pushes back on the caller) and a receiver half that drives the
//! session. The connection reactor polls the receiver from its own task, so
//! the session keeps moving while a send is waiting. The receiver reconnects
//! on the next poll after an error, and the reactor decides how long to wait
//! in between.
//!
//! [`MqttTransport`] talks to a real broker; [`MemoryBroker`] is an
//! in-process broker for tests and local demos.

pub mod memory;
pub mod mqtt;

pub use memory::{MemoryBroker, MemoryTransport};
pub use mqtt::MqttTransport;

use crate::error::{BusError, TransportError};
use async_trait::async_trait;
use bytes::Bytes;

/// MQTT delivery guarantee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum QoS {
    AtMostOnce,
    #[default]
    AtLeastOnce,
    ExactlyOnce,
}

impl QoS {
    pub fn level(self) -> u8 {
        match self {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }
}

impl TryFrom<u8> for QoS {
    type Error = BusError;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(BusError::InvalidQos(other)),
        }
    }
}

impl From<QoS> for rumqttc::QoS {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
            QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

/// A raw message delivered by the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
}

/// What one poll of the receiver produced.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A session was (re)established.
    Connected,
    /// An application message arrived.
    Message(InboundMessage),
    /// Protocol traffic with nothing for the bus to do (acks, pings).
    Idle,
}

/// A broker connection that can be split into send and receive halves.
pub trait Transport: Send + 'static {
    type Sender: TransportSender;
    type Receiver: TransportReceiver;

    fn split(self) -> (Self::Sender, Self::Receiver);
}

/// Outbound half. A call returns once the request is queued for the
/// session; it waits while the queue is full.
#[async_trait]
pub trait TransportSender: Send + Sync + 'static {
    async fn publish(&self, topic: &str, qos: QoS, payload: Vec<u8>) -> Result<(), TransportError>;

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), TransportError>;

    async fn unsubscribe(&self, filter: &str) -> Result<(), TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;
}

/// Inbound half. Each poll drives the session forward by one event.
///
/// After an `Err` the next poll attempts a fresh connection.
#[async_trait]
pub trait TransportReceiver: Send + 'static {
    async fn poll(&mut self) -> Result<TransportEvent, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qos_levels() {
        for level in 0..=2u8 {
            let qos = QoS::try_from(level).unwrap();
            assert_eq!(qos.level(), level);
        }
        assert!(matches!(QoS::try_from(3), Err(BusError::InvalidQos(3))));
    }

    #[test]
    fn test_default_qos_is_at_least_once() {
        assert_eq!(QoS::default(), QoS::AtLeastOnce);
        assert_eq!(rumqttc::QoS::from(QoS::default()), rumqttc::QoS::AtLeastOnce);
    }
}
