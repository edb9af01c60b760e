//! The device node: control distribution, sampling and lifecycle

pub mod control;
pub mod lifecycle;
pub mod sampling;

pub use control::{ControlDistributor, Distribution, SensorControl};
pub use lifecycle::{
    provision, renew_certificate, status, DeviceNode, Mailboxes, NodeServices, NodeStatus,
    ProvisionedIdentity,
};
pub use sampling::{JsonFileSource, MeasurementSource, SamplingWorker};
