//! Sensor sampling worker
//!
//! Reads the current readings once per poll period and queues them as a
//! measurepoint post. The poll period is the only sensor control this node
//! understands; every accepted change is acknowledged on the reply queue.

use super::control::SensorControl;
use crate::error::NodeError;
use crate::protocol::{MeasurePointPost, OutboundReply, ServiceReply};
use crate::queue::{enqueue, QueueError, QueueRetry};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

pub const UPSTREAM_QUEUE: &str = "upstream";
pub const REPLY_QUEUE: &str = "service_reply";

pub const POLL_RATE_PARAM: &str = "sensorpollrate";
/// Reply data key acknowledging a poll-rate change
pub const POLL_RATE_UPDATED: &str = "poll_rate_updated";
/// Longest accepted poll period: one day
pub const MAX_POLL_RATE_SECS: u64 = 86_400;

/// Where readings come from
#[async_trait]
pub trait MeasurementSource: Send + Sync {
    /// Latest value per measurepoint; an empty map means nothing to report
    async fn read(&self) -> Result<BTreeMap<String, f64>, NodeError>;
}

/// Readings kept in a JSON object file by the sensor drivers
///
/// ```json
/// {"co2": 415.0, "pm25": 7.5, "temperature": 29.1}
/// ```
#[derive(Debug, Clone)]
pub struct JsonFileSource {
    path: PathBuf,
}

impl JsonFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Numeric entries of a readings object; other values are skipped
pub fn parse_readings(bytes: &[u8]) -> Result<BTreeMap<String, f64>, NodeError> {
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|e| NodeError::Sensor(format!("malformed readings: {e}")))?;
    let Value::Object(entries) = value else {
        return Err(NodeError::Sensor(
            "readings must be a JSON object".to_string(),
        ));
    };

    Ok(entries
        .into_iter()
        .filter_map(|(name, value)| match value.as_f64() {
            Some(reading) => Some((name, reading)),
            None => {
                debug!(measurepoint = %name, "Skipping non-numeric reading");
                None
            }
        })
        .collect())
}

#[async_trait]
impl MeasurementSource for JsonFileSource {
    async fn read(&self) -> Result<BTreeMap<String, f64>, NodeError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => parse_readings(&bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No readings written yet");
                Ok(BTreeMap::new())
            }
            Err(e) => Err(NodeError::Sensor(format!(
                "{}: {e}",
                self.path.display()
            ))),
        }
    }
}

fn poll_ticker(period: Duration, start: Instant) -> Interval {
    let mut ticker = tokio::time::interval_at(start, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

pub struct SamplingWorker {
    device_id: String,
    source: Option<Arc<dyn MeasurementSource>>,
    poll_rate: Duration,
    upstream: mpsc::Sender<MeasurePointPost>,
    replies: mpsc::Sender<OutboundReply>,
    retry: QueueRetry,
}

impl SamplingWorker {
    /// Without a source the worker still answers poll-rate controls
    pub fn new(
        device_id: impl Into<String>,
        source: Option<Arc<dyn MeasurementSource>>,
        poll_rate: Duration,
        upstream: mpsc::Sender<MeasurePointPost>,
        replies: mpsc::Sender<OutboundReply>,
        retry: QueueRetry,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            source,
            poll_rate,
            upstream,
            replies,
            retry,
        }
    }

    pub fn poll_rate(&self) -> Duration {
        self.poll_rate
    }

    /// Apply one control message; true when the poll rate was updated
    pub async fn apply_control(&mut self, control: SensorControl) -> Result<bool, QueueError> {
        if control.param != POLL_RATE_PARAM {
            debug!(param = %control.param, "Unsupported sensor control");
            return Ok(false);
        }
        let secs = match u64::try_from(control.value) {
            Ok(secs) if secs > MAX_POLL_RATE_SECS => {
                warn!(
                    value = control.value,
                    max_secs = MAX_POLL_RATE_SECS,
                    "Ignoring poll rate above the maximum"
                );
                return Ok(false);
            }
            Ok(secs) if secs > 0 => secs,
            _ => {
                warn!(value = control.value, "Ignoring non-positive poll rate");
                return Ok(false);
            }
        };

        self.poll_rate = Duration::from_secs(secs);
        info!(poll_rate_secs = secs, msg_id = %control.msg_id, "Sensor poll rate updated");

        let reply = OutboundReply {
            endpoint: control.endpoint,
            reply: ServiceReply::success(&control.msg_id, POLL_RATE_UPDATED),
        };
        enqueue(&self.replies, reply, self.retry, REPLY_QUEUE).await?;
        Ok(true)
    }

    /// Read once and queue a measurepoint post; true when something was queued
    pub async fn sample(&self) -> Result<bool, NodeError> {
        let Some(source) = &self.source else {
            return Ok(false);
        };
        let readings = source.read().await?;
        if readings.is_empty() {
            debug!("No readings this period");
            return Ok(false);
        }

        let post = MeasurePointPost::new(&self.device_id, readings);
        enqueue(&self.upstream, post, self.retry, UPSTREAM_QUEUE).await?;
        Ok(true)
    }

    pub async fn run(
        mut self,
        mut controls: mpsc::Receiver<SensorControl>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = poll_ticker(self.poll_rate, Instant::now());

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sample().await {
                        warn!(error = %e, category = e.category(), "Sampling failed");
                        if matches!(e, NodeError::ChannelClosed(_)) {
                            return;
                        }
                    }
                }
                control = controls.recv() => {
                    let Some(control) = control else {
                        debug!("Sensor-control queue closed");
                        return;
                    };
                    match self.apply_control(control).await {
                        Ok(true) => {
                            let now = Instant::now();
                            let start = now.checked_add(self.poll_rate).unwrap_or(now);
                            ticker = poll_ticker(self.poll_rate, start);
                        }
                        Ok(false) => {}
                        Err(QueueError::Closed { .. }) => return,
                        Err(e) => warn!(error = %e, "Poll-rate reply dropped"),
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    }
}
