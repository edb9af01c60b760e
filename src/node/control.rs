//! Control distribution
//!
//! Service commands arrive from the broker as text. The distributor turns the
//! value into an integer and hands sensor parameters to the sampling worker;
//! anything else has no consumer on this node and is dropped.

use crate::protocol::ServiceCommand;
use crate::queue::{enqueue, QueueError, QueueRetry};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

pub const SENSOR_CONTROL_QUEUE: &str = "sensor_control";

/// Parameters containing this marker belong to the sampling worker
const SENSOR_MARKER: &str = "sensor";

/// An integer control value addressed to the sampling worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorControl {
    pub param: String,
    pub value: i64,
    pub msg_id: String,
    pub endpoint: String,
}

/// What happened to one command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Distribution {
    Routed,
    /// No worker consumes this parameter
    Unrouted,
    /// The value is not an integer
    Rejected,
}

/// Integer value of a command; decimal text is truncated toward zero
pub fn parse_control_value(text: &str) -> Option<i64> {
    let text = text.trim();
    if let Ok(value) = text.parse::<i64>() {
        return Some(value);
    }
    text.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v >= i64::MIN as f64 && *v <= i64::MAX as f64)
        .map(|v| v.trunc() as i64)
}

pub struct ControlDistributor {
    sensor_control: mpsc::Sender<SensorControl>,
    retry: QueueRetry,
}

impl ControlDistributor {
    pub fn new(sensor_control: mpsc::Sender<SensorControl>, retry: QueueRetry) -> Self {
        Self {
            sensor_control,
            retry,
        }
    }

    pub async fn distribute(&self, command: ServiceCommand) -> Result<Distribution, QueueError> {
        let Some(value) = parse_control_value(&command.value) else {
            warn!(
                param = %command.param,
                msg_id = %command.msg_id,
                "Control value is not an integer, dropping"
            );
            return Ok(Distribution::Rejected);
        };

        if !command.param.contains(SENSOR_MARKER) {
            info!(param = %command.param, value, "No consumer for control parameter");
            return Ok(Distribution::Unrouted);
        }

        let control = SensorControl {
            param: command.param,
            value,
            msg_id: command.msg_id,
            endpoint: command.endpoint,
        };
        debug!(param = %control.param, value, "Routing control to sampling worker");
        enqueue(&self.sensor_control, control, self.retry, SENSOR_CONTROL_QUEUE).await?;
        Ok(Distribution::Routed)
    }

    /// Drain the arrived-command queue until it closes or shutdown is signalled
    pub async fn run(
        self,
        mut arrived: mpsc::Receiver<ServiceCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                command = arrived.recv() => {
                    let Some(command) = command else {
                        debug!("Arrived-command queue closed");
                        return;
                    };
                    if let Err(e) = self.distribute(command).await {
                        warn!(error = %e, "Control command dropped");
                        if matches!(e, QueueError::Closed { .. }) {
                            return;
                        }
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    }
}
