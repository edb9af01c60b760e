//! Pure health and reconnection-budget decisions
//!
//! No I/O here: the session and the supervisor feed in what they observed and
//! act on the returned state or decision.

use super::connection::ConnectionState;
use crate::config::SupervisorSection;
use std::time::Duration;

/// Something the session observed about its link
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    ConnectStarted,
    ConnAckReceived,
    NetworkError(String),
    BrokerDisconnected,
    LocalDisconnect,
}

/// What to do after a failed reconnection attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectionDecision {
    /// Wait and try again; `attempt` is the number of failures so far
    Retry { attempt: u32, delay_ms: u64 },
    /// The budget is spent; reset the device
    Reset { failures: u32 },
}

/// Consecutive failures tolerated before a reset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureBudget {
    pub max_failures: u32,
    pub retry_delay: Duration,
}

impl FailureBudget {
    pub fn from_config(supervisor: &SupervisorSection) -> Self {
        Self {
            max_failures: supervisor.max_failed_reconnections.max(1),
            retry_delay: Duration::from_millis(supervisor.retry_delay_ms),
        }
    }
}

pub struct HealthMonitor;

impl HealthMonitor {
    pub fn determine_next_state(
        current: &ConnectionState,
        event: ConnectionEvent,
    ) -> ConnectionState {
        match event {
            ConnectionEvent::ConnectStarted => ConnectionState::Connecting,
            ConnectionEvent::ConnAckReceived => ConnectionState::Connected,
            ConnectionEvent::NetworkError(reason) => ConnectionState::Disconnected(reason),
            ConnectionEvent::BrokerDisconnected => {
                ConnectionState::Disconnected("broker closed the session".to_string())
            }
            ConnectionEvent::LocalDisconnect => match current {
                ConnectionState::Disconnected(reason) => {
                    ConnectionState::Disconnected(reason.clone())
                }
                _ => ConnectionState::Disconnected("client disconnected".to_string()),
            },
        }
    }

    pub fn can_publish(state: &ConnectionState) -> bool {
        matches!(state, ConnectionState::Connected)
    }

    /// Failure count after one more failed attempt, never above the budget
    pub fn next_failure_count(current: u32, budget: &FailureBudget) -> u32 {
        current.saturating_add(1).min(budget.max_failures)
    }

    pub fn decide_after_failure(failures: u32, budget: &FailureBudget) -> ReconnectionDecision {
        if failures >= budget.max_failures {
            ReconnectionDecision::Reset { failures }
        } else {
            ReconnectionDecision::Retry {
                attempt: failures,
                delay_ms: budget.retry_delay.as_millis() as u64,
            }
        }
    }
}
