//! Event routing and service-message forwarding
//!
//! Routing is a pure function of the rumqttc event. Forwarding parses an
//! incoming service request and pushes one [`ServiceCommand`] per parameter
//! onto the bounded arrived-command queue.

use crate::protocol::{parse_service_message, ServiceCommand};
use crate::queue::{enqueue, QueueError, QueueRetry};
use rumqttc::{Event, Outgoing, Packet, SubscribeReasonCode};
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub const ARRIVED_QUEUE: &str = "arrived";

/// Pure routing decisions for MQTT events
pub struct MessageHandler;

impl MessageHandler {
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
                Packet::Publish(publish) => EventRoute::MessageReceived {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                    retain: publish.retain,
                },
                Packet::Disconnect => EventRoute::Disconnected,
                Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                    packet_id: suback.pkid,
                    rejected: suback
                        .return_codes
                        .iter()
                        .filter(|code| matches!(code, SubscribeReasonCode::Failure))
                        .count(),
                },
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(Outgoing::Disconnect) => EventRoute::LocalDisconnect,
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Retained service requests were meant for an earlier session
    pub fn should_process_message(topic: &str, retain: bool) -> bool {
        if retain {
            debug!(topic, "Ignoring retained message");
            return false;
        }
        true
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    ConnectionAcknowledged,
    MessageReceived {
        topic: String,
        payload: Vec<u8>,
        retain: bool,
    },
    /// The broker closed the session
    Disconnected,
    /// We sent DISCONNECT ourselves
    LocalDisconnect,
    SubscriptionConfirmed { packet_id: u16, rejected: usize },
    InfrastructureEvent(String),
    OutgoingEvent,
}

/// Forwards decoded service commands to the control distributor
#[derive(Debug, Clone)]
pub struct MessageForwarder {
    arrived: mpsc::Sender<ServiceCommand>,
    retry: QueueRetry,
}

impl MessageForwarder {
    pub fn new(arrived: mpsc::Sender<ServiceCommand>, retry: QueueRetry) -> Self {
        Self { arrived, retry }
    }

    /// Decode one publish and enqueue its commands; returns how many were queued
    ///
    /// A payload that is not a JSON object yields no commands.
    pub async fn forward(&self, topic: &str, payload: &[u8]) -> Result<usize, QueueError> {
        let commands = match parse_service_message(payload) {
            Ok(commands) => commands,
            Err(e) => {
                warn!(topic, error = %e, "Dropping malformed service message");
                return Ok(0);
            }
        };

        let count = commands.len();
        for command in commands {
            debug!(
                topic,
                endpoint = %command.endpoint,
                param = %command.param,
                "Forwarding service command"
            );
            enqueue(&self.arrived, command, self.retry, ARRIVED_QUEUE).await?;
        }
        Ok(count)
    }
}
