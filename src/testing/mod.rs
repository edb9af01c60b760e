//! Testing utilities and mock implementations
//!
//! Lets provisioning, recovery and the node workers be tested without a
//! broker, a cloud endpoint or hardware.

pub mod mocks;

pub use mocks::*;
