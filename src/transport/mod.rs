//! Transport layer between the node and the DECADA broker
//!
//! [`CloudTransport`] is the seam the reconnection supervisor works against;
//! [`mqtt::MqttSession`] is the production implementation and
//! `testing::mocks::MockTransport` the scripted one.

use crate::transport::mqtt::{ConnectionState, SubscriptionRegistry};
use std::sync::Arc;

pub mod mqtt;

/// One broker session that can be torn down and rebuilt
#[async_trait::async_trait]
pub trait CloudTransport: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Open the link and wait until the broker accepts the session
    async fn connect(&mut self) -> Result<(), Self::Error>;

    /// Tear the link down; safe on a partially connected or idle session
    async fn disconnect(&mut self);

    /// QoS 0 publish
    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), Self::Error>;

    /// QoS 1 subscribe; the topic is recorded for replay even if the request fails
    async fn subscribe(&mut self, topic: &str) -> Result<(), Self::Error>;

    async fn unsubscribe(&mut self, topic: &str) -> Result<(), Self::Error>;

    fn is_connected(&self) -> bool;

    fn connection_state(&self) -> ConnectionState;

    /// Topics replayed after every reconnect
    fn subscriptions(&self) -> Arc<SubscriptionRegistry>;
}

/// Type alias for the production transport
pub type MqttTransport = mqtt::MqttSession;
