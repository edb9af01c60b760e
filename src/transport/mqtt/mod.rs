//! MQTT-over-TLS transport for the DECADA broker
//!
//! The module separates pure decisions from I/O:
//!
//! - [`connection`] - connection state, CONNECT credentials and options
//! - [`message_handler`] - event routing and service-command forwarding
//! - [`health_monitor`] - state transitions and the reconnection budget
//! - [`subscriptions`] - topics replayed after every reconnect
//! - [`tls`] - rustls client config signing through the key store
//! - [`session`] - the live session and its event-loop driver
//! - [`supervisor`] - connectivity mutex and bounded recovery

pub mod connection;
pub mod health_monitor;
pub mod message_handler;
pub mod session;
pub mod subscriptions;
pub mod supervisor;
pub mod tls;

pub use connection::{ConnectionState, MqttCredentials, MqttError, SessionSettings};
pub use health_monitor::{ConnectionEvent, FailureBudget, HealthMonitor, ReconnectionDecision};
pub use message_handler::{EventRoute, MessageForwarder, MessageHandler};
pub use session::MqttSession;
pub use subscriptions::SubscriptionRegistry;
pub use supervisor::{PublishOutcome, ReconnectionSupervisor, RecoveryOutcome};
