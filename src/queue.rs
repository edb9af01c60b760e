//! Bounded mailboxes between workers
//!
//! Every queue in the node is a fixed-capacity `mpsc` channel. Producers never
//! block indefinitely on a full queue: they retry a bounded number of times
//! and then drop the item, reporting resource exhaustion.

use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{error, warn};

pub const UPSTREAM_CAPACITY: usize = 64;
pub const REPLY_CAPACITY: usize = 32;
pub const ARRIVED_CAPACITY: usize = 64;
pub const SENSOR_CONTROL_CAPACITY: usize = 32;

pub const DEFAULT_RETRY_PAUSE: Duration = Duration::from_millis(500);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("Queue '{queue}' still full after {attempts} attempts")]
    Exhausted { queue: &'static str, attempts: u32 },
    #[error("Queue '{queue}' closed")]
    Closed { queue: &'static str },
}

/// How hard a producer tries before giving up on an item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueRetry {
    pub attempts: u32,
    pub pause: Duration,
}

impl QueueRetry {
    pub fn new(attempts: u32) -> Self {
        Self {
            attempts: attempts.max(1),
            pause: DEFAULT_RETRY_PAUSE,
        }
    }

    pub fn with_pause(mut self, pause: Duration) -> Self {
        self.pause = pause;
        self
    }
}

impl Default for QueueRetry {
    fn default() -> Self {
        Self::new(10)
    }
}

/// Put `item` on `tx`, pausing between attempts while the queue is full
pub async fn enqueue<T>(
    tx: &mpsc::Sender<T>,
    mut item: T,
    retry: QueueRetry,
    queue: &'static str,
) -> Result<(), QueueError> {
    for attempt in 1..=retry.attempts {
        match tx.try_send(item) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Closed(_)) => return Err(QueueError::Closed { queue }),
            Err(TrySendError::Full(back)) => {
                warn!(queue, attempt, "Queue full, retrying");
                item = back;
                if attempt < retry.attempts {
                    tokio::time::sleep(retry.pause).await;
                }
            }
        }
    }

    error!(
        queue,
        attempts = retry.attempts,
        category = "fatal_resource_exhaustion",
        "Queue stayed full, dropping item"
    );
    Err(QueueError::Exhausted {
        queue,
        attempts: retry.attempts,
    })
}
