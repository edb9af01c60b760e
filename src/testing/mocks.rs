//! Mock implementations for testing
//!
//! Scripted stand-ins for the broker session, the platform services and the
//! secure element, so provisioning and recovery can be exercised without a
//! broker, real timers or hardware.

use crate::crypto::{CryptoError, SecureElementDriver};
use crate::node::MeasurementSource;
use crate::platform::{ResetReason, SystemReset, Watchdog};
use crate::transport::mqtt::{ConnectionState, SubscriptionRegistry};
use crate::transport::CloudTransport;
use async_trait::async_trait;
use p256::ecdsa::signature::hazmat::PrehashSigner;
use p256::ecdsa::{Signature, SigningKey};
use rand::rngs::OsRng;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;

pub type PublishedMessage = (String, Vec<u8>);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MockTransportError {
    #[error("Mock connection refused")]
    ConnectRefused,
    #[error("Mock transport not connected")]
    NotConnected,
}

/// Scripted transport with a simulated broker-side subscription view
///
/// The broker view is cleared whenever the session ends, the way a clean
/// session behaves, so replay correctness can be asserted directly.
#[derive(Debug, Default)]
pub struct MockTransport {
    connected: bool,
    connect_failures_remaining: AtomicU32,
    connect_attempts: u32,
    broker_view: BTreeSet<String>,
    duplicate_subscriptions: u32,
    published: Vec<PublishedMessage>,
    registry: Arc<SubscriptionRegistry>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` connect attempts fail
    pub fn fail_next_connects(&self, count: u32) {
        self.connect_failures_remaining
            .store(count, Ordering::SeqCst);
    }

    /// Simulate the network dropping underneath a live session
    pub fn drop_link(&mut self) {
        self.connected = false;
        self.broker_view.clear();
    }

    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts
    }

    pub fn broker_view(&self) -> Vec<String> {
        self.broker_view.iter().cloned().collect()
    }

    pub fn duplicate_subscriptions(&self) -> u32 {
        self.duplicate_subscriptions
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.published.clone()
    }
}

#[async_trait]
impl CloudTransport for MockTransport {
    type Error = MockTransportError;

    async fn connect(&mut self) -> Result<(), Self::Error> {
        self.connect_attempts += 1;
        let remaining = self.connect_failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.connect_failures_remaining
                .store(remaining - 1, Ordering::SeqCst);
            return Err(MockTransportError::ConnectRefused);
        }
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.connected = false;
        self.broker_view.clear();
    }

    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), Self::Error> {
        if !self.connected {
            return Err(MockTransportError::NotConnected);
        }
        self.published.push((topic.to_string(), payload));
        Ok(())
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), Self::Error> {
        self.registry.add(topic);
        if !self.connected {
            return Err(MockTransportError::NotConnected);
        }
        if !self.broker_view.insert(topic.to_string()) {
            self.duplicate_subscriptions += 1;
        }
        Ok(())
    }

    async fn unsubscribe(&mut self, topic: &str) -> Result<(), Self::Error> {
        self.registry.remove(topic);
        if !self.connected {
            return Err(MockTransportError::NotConnected);
        }
        self.broker_view.remove(topic);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn connection_state(&self) -> ConnectionState {
        if self.connected {
            ConnectionState::Connected
        } else if self.connect_attempts == 0 {
            ConnectionState::Idle
        } else {
            ConnectionState::Disconnected("Mock disconnection".to_string())
        }
    }

    fn subscriptions(&self) -> Arc<SubscriptionRegistry> {
        self.registry.clone()
    }
}

/// Watchdog that only counts kicks
#[derive(Debug, Default)]
pub struct CountingWatchdog {
    kicks: AtomicUsize,
}

impl CountingWatchdog {
    pub fn kicks(&self) -> usize {
        self.kicks.load(Ordering::SeqCst)
    }
}

impl Watchdog for CountingWatchdog {
    fn kick(&self) {
        self.kicks.fetch_add(1, Ordering::SeqCst);
    }
}

/// Reset that records its reasons instead of exiting
#[derive(Debug, Default)]
pub struct RecordingReset {
    reasons: Mutex<Vec<ResetReason>>,
}

impl RecordingReset {
    pub fn reasons(&self) -> Vec<ResetReason> {
        self.reasons.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl SystemReset for RecordingReset {
    fn reset(&self, reason: ResetReason) {
        if let Ok(mut reasons) = self.reasons.lock() {
            reasons.push(reason);
        }
    }
}

/// Software model of a secure element: emits raw `r || s` signatures
#[derive(Default)]
pub struct MockSecureElement {
    key: Mutex<Option<SigningKey>>,
}

impl MockSecureElement {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecureElementDriver for MockSecureElement {
    fn generate_keypair(&self) -> Result<Vec<u8>, CryptoError> {
        let key = SigningKey::random(&mut OsRng);
        let public = key.verifying_key().to_encoded_point(false).as_bytes().to_vec();
        let mut slot = self
            .key
            .lock()
            .map_err(|_| CryptoError::SecureElement("mock poisoned".to_string()))?;
        *slot = Some(key);
        Ok(public)
    }

    fn public_key(&self) -> Result<Option<Vec<u8>>, CryptoError> {
        let slot = self
            .key
            .lock()
            .map_err(|_| CryptoError::SecureElement("mock poisoned".to_string()))?;
        Ok(slot
            .as_ref()
            .map(|key| key.verifying_key().to_encoded_point(false).as_bytes().to_vec()))
    }

    fn sign_digest(&self, digest: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let slot = self
            .key
            .lock()
            .map_err(|_| CryptoError::SecureElement("mock poisoned".to_string()))?;
        let key = slot.as_ref().ok_or(CryptoError::KeyUnavailable)?;
        let signature: Signature = key
            .sign_prehash(digest)
            .map_err(|e| CryptoError::SigningError(e.to_string()))?;
        Ok(signature.to_bytes().to_vec())
    }
}

/// Measurement source returning canned readings, or nothing once drained
#[derive(Debug, Default)]
pub struct StaticReadings {
    batches: Mutex<Vec<BTreeMap<String, f64>>>,
}

impl StaticReadings {
    /// Batches are returned in order; afterwards every read is empty
    pub fn new(batches: Vec<BTreeMap<String, f64>>) -> Self {
        let mut batches = batches;
        batches.reverse();
        Self {
            batches: Mutex::new(batches),
        }
    }
}

#[async_trait]
impl MeasurementSource for StaticReadings {
    async fn read(&self) -> Result<BTreeMap<String, f64>, crate::error::NodeError> {
        Ok(self
            .batches
            .lock()
            .ok()
            .and_then(|mut batches| batches.pop())
            .unwrap_or_default())
    }
}
