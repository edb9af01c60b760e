//! DECADA sensor node
//!
//! Device provisioning and MQTT connection lifecycle for sensor nodes that
//! report to the DECADA IoT platform.
//!
//! # Overview
//!
//! This crate provides:
//! - Device identity with a software or secure-element backed P-256 key
//! - Signed REST calls for device registration and certificate exchange
//! - An MQTT-over-TLS session whose client authentication signs through the key store
//! - A reconnection supervisor with subscription replay and a bounded reset budget
//! - Bounded queues between the connectivity, control and sampling workers
//!
//! # Quick Start
//!
//! ```rust
//! use decada_node::protocol::{parse_service_message, MeasurePointPost, TopicBuilder};
//! use std::collections::BTreeMap;
//!
//! let topics = TopicBuilder::new("PK1", "abc123");
//! assert_eq!(
//!     topics.measurepoint_post(),
//!     "/sys/PK1/abc123/thing/measurepoint/post"
//! );
//!
//! let post = MeasurePointPost::new("abc123", BTreeMap::from([("co2".to_string(), 415.0)]));
//! let payload = post.to_payload().unwrap();
//! assert!(!payload.is_empty());
//!
//! let commands = parse_service_message(
//!     br#"{"id":"1","method":"thing.service.sensorpollrate","params":{"sensorpollrate":"30"}}"#,
//! )
//! .unwrap();
//! assert_eq!(commands[0].endpoint, "sensorpollrate");
//! ```

pub mod cloud;
pub mod config;
pub mod crypto;
pub mod error;
pub mod node;
pub mod observability;
pub mod platform;
pub mod protocol;
pub mod queue;
pub mod store;
pub mod testing;
pub mod transport;

pub use cloud::{DeviceProvisioner, ProvisioningState};
pub use config::{ConfigError, NodeConfig};
pub use error::{NodeError, NodeResult};
pub use node::{DeviceNode, NodeServices, NodeStatus};
pub use transport::mqtt::{MqttSession, ReconnectionSupervisor};
pub use transport::CloudTransport;
