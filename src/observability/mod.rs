//! Observability for the node: structured logging and operation spans

pub mod logging;

pub use logging::{init_default_logging, init_logging, LogFormat};

pub use logging::{lifecycle_span, mqtt_span, provisioning_span, supervisor_span};
