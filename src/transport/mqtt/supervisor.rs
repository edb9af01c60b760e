//! Reconnection supervisor
//!
//! Owns the connectivity mutex around the transport. Every publish and the
//! whole disconnect/reconnect sequence run under it, so nothing is ever
//! written to a half torn-down session.
//!
//! Recovery blocks until the link is back. Each failed attempt bumps a
//! counter; when it reaches the budget the device is reset exactly once and
//! every later call reports [`RecoveryOutcome::FatalReset`].

use super::health_monitor::{FailureBudget, HealthMonitor, ReconnectionDecision};
use crate::platform::{ResetReason, SystemReset, Watchdog};
use crate::transport::CloudTransport;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, instrument, warn};

/// Result of a recovery request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// The link was already healthy
    Healthy,
    /// The link was rebuilt and every subscription replayed
    Recovered,
    /// The budget ran out and a reset was requested
    FatalReset,
}

/// Result of a supervised publish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Sent,
    /// The link was rebuilt but the message could not be delivered
    Dropped,
    FatalReset,
}

pub struct ReconnectionSupervisor<T: CloudTransport> {
    transport: Arc<Mutex<T>>,
    budget: FailureBudget,
    watchdog: Arc<dyn Watchdog>,
    reset: Arc<dyn SystemReset>,
    failures: AtomicU32,
    generation: AtomicU64,
    reset_latched: AtomicBool,
}

impl<T: CloudTransport> ReconnectionSupervisor<T> {
    pub fn new(
        transport: T,
        budget: FailureBudget,
        watchdog: Arc<dyn Watchdog>,
        reset: Arc<dyn SystemReset>,
    ) -> Self {
        Self {
            transport: Arc::new(Mutex::new(transport)),
            budget,
            watchdog,
            reset,
            failures: AtomicU32::new(0),
            generation: AtomicU64::new(0),
            reset_latched: AtomicBool::new(false),
        }
    }

    /// The connectivity mutex; hold it for any direct transport access
    pub fn transport(&self) -> Arc<Mutex<T>> {
        self.transport.clone()
    }

    /// Consecutive failed reconnections since the last success
    pub fn failure_count(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }

    /// Number of successful (re)connections so far
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn is_reset_pending(&self) -> bool {
        self.reset_latched.load(Ordering::SeqCst)
    }

    /// Bring the link up for the first time, with the same budget as recovery
    pub async fn connect(&self) -> RecoveryOutcome {
        let observed = self.generation();
        self.recover(observed).await
    }

    /// Rebuild the link after a failure seen while at `observed` generation
    ///
    /// If another worker already reconnected since then and the link is
    /// healthy, nothing is torn down.
    #[instrument(skip(self))]
    pub async fn recover(&self, observed: u64) -> RecoveryOutcome {
        let mut transport = self.transport.lock().await;

        if self.is_reset_pending() {
            return RecoveryOutcome::FatalReset;
        }
        if self.generation() != observed && transport.is_connected() {
            return RecoveryOutcome::Healthy;
        }

        loop {
            self.watchdog.kick();
            transport.disconnect().await;

            match Self::reconnect_once(&mut *transport).await {
                Ok(replayed) => {
                    self.failures.store(0, Ordering::SeqCst);
                    let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                    info!(generation, replayed, "MQTT link established");
                    return RecoveryOutcome::Recovered;
                }
                Err(e) => {
                    let failures =
                        HealthMonitor::next_failure_count(self.failure_count(), &self.budget);
                    self.failures.store(failures, Ordering::SeqCst);
                    warn!(error = %e, failures, category = "transport", "Reconnection attempt failed");

                    match HealthMonitor::decide_after_failure(failures, &self.budget) {
                        ReconnectionDecision::Retry { delay_ms, .. } => {
                            self.watchdog.kick();
                            tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                        }
                        ReconnectionDecision::Reset { failures } => {
                            transport.disconnect().await;
                            if !self.reset_latched.swap(true, Ordering::SeqCst) {
                                error!(failures, "Reconnection budget exhausted, resetting");
                                self.reset.reset(ResetReason::ReconnectionBudgetExhausted);
                            }
                            return RecoveryOutcome::FatalReset;
                        }
                    }
                }
            }
        }
    }

    /// Connect and replay every registered subscription
    async fn reconnect_once(transport: &mut T) -> Result<usize, T::Error> {
        transport.connect().await?;
        let topics = transport.subscriptions().all();
        for topic in &topics {
            transport.subscribe(topic).await?;
        }
        Ok(topics.len())
    }

    /// Periodic liveness check; recovers when the link is down
    pub async fn check_liveness(&self) -> RecoveryOutcome {
        let observed = {
            let transport = self.transport.lock().await;
            if self.is_reset_pending() {
                return RecoveryOutcome::FatalReset;
            }
            if transport.is_connected() {
                return RecoveryOutcome::Healthy;
            }
            self.generation()
        };
        warn!("Liveness check found the MQTT link down");
        self.recover(observed).await
    }

    /// Publish under the connectivity mutex, recovering once on failure
    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> PublishOutcome {
        let observed = {
            let mut transport = self.transport.lock().await;
            if self.is_reset_pending() {
                return PublishOutcome::FatalReset;
            }
            match transport.publish(topic, payload.clone()).await {
                Ok(()) => return PublishOutcome::Sent,
                Err(e) => warn!(topic, error = %e, "Publish failed"),
            }
            self.generation()
        };

        match self.recover(observed).await {
            RecoveryOutcome::FatalReset => PublishOutcome::FatalReset,
            RecoveryOutcome::Healthy | RecoveryOutcome::Recovered => {
                let mut transport = self.transport.lock().await;
                match transport.publish(topic, payload).await {
                    Ok(()) => PublishOutcome::Sent,
                    Err(e) => {
                        warn!(topic, error = %e, "Publish failed after recovery, dropping");
                        PublishOutcome::Dropped
                    }
                }
            }
        }
    }

    /// Register `topic` for replay and subscribe now, recovering on failure
    pub async fn subscribe(&self, topic: &str) -> RecoveryOutcome {
        let observed = {
            let mut transport = self.transport.lock().await;
            if self.is_reset_pending() {
                return RecoveryOutcome::FatalReset;
            }
            match transport.subscribe(topic).await {
                Ok(()) => return RecoveryOutcome::Healthy,
                Err(e) => warn!(topic, error = %e, "Subscribe failed"),
            }
            self.generation()
        };
        self.recover(observed).await
    }

    /// Clean shutdown of the link
    pub async fn shutdown(&self) {
        let mut transport = self.transport.lock().await;
        transport.disconnect().await;
    }
}
