//! rumqttc-backed transport.
//!
//! `AsyncClient` is the sender and `EventLoop` is the receiver. Sends are
//! awaited: when the eventloop's request queue is full they wait for the
//! eventloop, polled from its own task, to drain it. On error the eventloop
//! keeps unacked and queued requests and reconnects on the next `poll`.

use super::{InboundMessage, QoS, Transport, TransportEvent, TransportReceiver, TransportSender};
use crate::bus::BusConfig;
use crate::error::TransportError;
use async_trait::async_trait;
use rumqttc::{AsyncClient, ClientError, ConnectionError, Event, EventLoop, MqttOptions, Packet};
use std::time::Duration;
use tracing::trace;

/// Capacity of the request queue between client and eventloop.
const REQUEST_CAPACITY: usize = 64;

pub struct MqttTransport {
    client: AsyncClient,
    eventloop: EventLoop,
}

impl MqttTransport {
    /// Build a client for the configured broker. No I/O happens until the
    /// receiver is first polled.
    pub fn new(config: &BusConfig) -> Self {
        let mut options = MqttOptions::new(config.client_id(), config.broker.clone(), config.port);
        options.set_keep_alive(Duration::from_secs(config.keepalive_secs.max(1)));
        options.set_clean_session(true);

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        Self { client, eventloop }
    }
}

impl Transport for MqttTransport {
    type Sender = MqttSender;
    type Receiver = MqttReceiver;

    fn split(self) -> (MqttSender, MqttReceiver) {
        (
            MqttSender {
                client: self.client,
            },
            MqttReceiver {
                eventloop: self.eventloop,
            },
        )
    }
}

pub struct MqttSender {
    client: AsyncClient,
}

fn request_error(err: ClientError) -> TransportError {
    TransportError::Request(err.to_string())
}

#[async_trait]
impl TransportSender for MqttSender {
    async fn publish(&self, topic: &str, qos: QoS, payload: Vec<u8>) -> Result<(), TransportError> {
        self.client
            .publish(topic, qos.into(), false, payload)
            .await
            .map_err(request_error)
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), TransportError> {
        self.client
            .subscribe(filter, qos.into())
            .await
            .map_err(request_error)
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), TransportError> {
        self.client.unsubscribe(filter).await.map_err(request_error)
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.client.disconnect().await.map_err(request_error)
    }
}

pub struct MqttReceiver {
    eventloop: EventLoop,
}

#[async_trait]
impl TransportReceiver for MqttReceiver {
    async fn poll(&mut self) -> Result<TransportEvent, TransportError> {
        match self.eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => Ok(TransportEvent::Connected),
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                Ok(TransportEvent::Message(InboundMessage {
                    topic: publish.topic,
                    payload: publish.payload,
                }))
            }
            Ok(Event::Incoming(Packet::Disconnect)) => Err(TransportError::Closed),
            Ok(event) => {
                trace!("mqtt event: {:?}", event);
                Ok(TransportEvent::Idle)
            }
            Err(ConnectionError::ConnectionRefused(code)) => {
                Err(TransportError::Refused(format!("{:?}", code)))
            }
            Err(e) => Err(TransportError::Connection(e.to_string())),
        }
    }
}
