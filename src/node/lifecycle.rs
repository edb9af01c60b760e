//! Node lifecycle: provisioning, boot and the long-running workers
//!
//! Boot is strictly sequential. Registration yields the device secret, the
//! certificate exchange yields the client certificate, and only then is the
//! MQTT session built and connected. `run` then starts four workers that
//! talk to each other exclusively through bounded queues:
//!
//! - connectivity: publishes the upstream and reply queues through the supervisor
//! - liveness: kicks the watchdog and checks the link every interval
//! - control distributor: routes arrived service commands
//! - sampling: reads sensors and answers poll-rate changes

use super::control::ControlDistributor;
use super::sampling::{MeasurementSource, SamplingWorker};
use crate::cloud::provisioner::persisted_certificate;
use crate::cloud::{
    ClientCertificate, CloudAuthClient, CloudCredentials, DeviceProvisioner, DeviceSecret,
    ProvisioningPolicy, ProvisioningState,
};
use crate::config::NodeConfig;
use crate::crypto::{CryptoIdentity, KeyKind, KeyStore};
use crate::error::{NodeError, NodeResult};
use crate::platform::{Clock, ResetReason, SystemReset, Watchdog};
use crate::protocol::{
    MeasurePointPost, OutboundReply, ServiceCommand, TopicBuilder, DEFAULT_SERVICE,
};
use crate::queue::{
    QueueRetry, ARRIVED_CAPACITY, REPLY_CAPACITY, SENSOR_CONTROL_CAPACITY, UPSTREAM_CAPACITY,
};
use crate::store::{PersistStore, INIT_FLAG};
use crate::transport::mqtt::{
    tls, FailureBudget, MessageForwarder, MqttError, MqttSession, PublishOutcome,
    ReconnectionSupervisor, RecoveryOutcome, SessionSettings, SubscriptionRegistry,
};
use crate::transport::CloudTransport;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn, Instrument};

/// How long workers get to notice shutdown before they are aborted
const WORKER_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Collaborators injected into the node
#[derive(Clone)]
pub struct NodeServices {
    pub store: Arc<dyn PersistStore>,
    pub keys: Arc<dyn KeyStore>,
    pub clock: Arc<dyn Clock>,
    pub watchdog: Arc<dyn Watchdog>,
    pub reset: Arc<dyn SystemReset>,
    /// Telemetry is disabled when absent
    pub source: Option<Arc<dyn MeasurementSource>>,
}

/// Result of a completed provisioning pass
#[derive(Debug, Clone)]
pub struct ProvisionedIdentity {
    pub device_secret: DeviceSecret,
    pub certificate: ClientCertificate,
}

/// Locally known provisioning status; contains no secrets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub device_id: String,
    pub key_kind: KeyKind,
    pub state: ProvisioningState,
    pub certificate_serial: Option<String>,
    pub initialized: bool,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "device:       {}", self.device_id)?;
        writeln!(f, "key backend:  {:?}", self.key_kind)?;
        writeln!(f, "state:        {}", self.state)?;
        writeln!(
            f,
            "certificate:  {}",
            self.certificate_serial.as_deref().unwrap_or("none")
        )?;
        write!(f, "initialized:  {}", self.initialized)
    }
}

fn identity(config: &NodeConfig, services: &NodeServices) -> NodeResult<CryptoIdentity> {
    Ok(CryptoIdentity::new(
        config.device.uid.clone(),
        &config.provisioning.subject_base,
        services.keys.clone(),
        services.clock.clone(),
    )?)
}

fn provisioner(config: &NodeConfig, services: &NodeServices) -> NodeResult<DeviceProvisioner> {
    let credentials = CloudCredentials::from_config(config)?;
    let auth = CloudAuthClient::new(credentials, config.request_timeout(), services.clock.clone())?;
    Ok(DeviceProvisioner::new(
        auth,
        identity(config, services)?,
        services.store.clone(),
        services.watchdog.clone(),
        ProvisioningPolicy::from_config(config),
    )?)
}

/// Register the device if needed, make sure it holds a certificate, and mark it initialised
pub async fn provision(
    config: &NodeConfig,
    services: &NodeServices,
) -> NodeResult<ProvisionedIdentity> {
    let span = crate::provisioning_span!(device_id = %config.device.uid);
    async {
        let provisioner = provisioner(config, services)?;
        info!(state = %provisioner.state(), "Provisioning state at boot");

        let device_secret = provisioner.check_device_creation().await?;
        let certificate = provisioner.ensure_certificate().await?;
        services.store.set(INIT_FLAG, "true")?;

        info!(serial = %certificate.serial, "Device provisioned");
        Ok::<_, NodeError>(ProvisionedIdentity {
            device_secret,
            certificate,
        })
    }
    .instrument(span)
    .await
}

/// Renew the certificate and reset so the node restarts with it
pub async fn renew_certificate(
    config: &NodeConfig,
    services: &NodeServices,
) -> NodeResult<ClientCertificate> {
    let span = crate::provisioning_span!(device_id = %config.device.uid, operation = "renew");
    async {
        let provisioner = provisioner(config, services)?;
        let certificate = provisioner.renew_certificate().await?;
        services.reset.reset(ResetReason::CertificateRenewed);
        Ok::<_, NodeError>(certificate)
    }
    .instrument(span)
    .await
}

/// Provisioning status derived from the persisted state
pub fn status(config: &NodeConfig, services: &NodeServices) -> NodeResult<NodeStatus> {
    let identity = identity(config, services)?;
    let store = services.store.as_ref();

    Ok(NodeStatus {
        device_id: config.device.uid.clone(),
        key_kind: services.keys.kind(),
        state: ProvisioningState::derive(store, &identity)?,
        certificate_serial: persisted_certificate(store)?
            .map(|certificate| certificate.serial)
            .filter(|serial| !serial.is_empty()),
        initialized: store.get(INIT_FLAG)?.as_deref() == Some("true"),
    })
}

/// The queues that outlive a single worker
pub struct Mailboxes {
    upstream_tx: mpsc::Sender<MeasurePointPost>,
    upstream_rx: mpsc::Receiver<MeasurePointPost>,
    reply_tx: mpsc::Sender<OutboundReply>,
    reply_rx: mpsc::Receiver<OutboundReply>,
    arrived_tx: mpsc::Sender<ServiceCommand>,
    arrived_rx: mpsc::Receiver<ServiceCommand>,
}

impl Mailboxes {
    pub fn new() -> Self {
        let (upstream_tx, upstream_rx) = mpsc::channel(UPSTREAM_CAPACITY);
        let (reply_tx, reply_rx) = mpsc::channel(REPLY_CAPACITY);
        let (arrived_tx, arrived_rx) = mpsc::channel(ARRIVED_CAPACITY);
        Self {
            upstream_tx,
            upstream_rx,
            reply_tx,
            reply_rx,
            arrived_tx,
            arrived_rx,
        }
    }

    /// Producer side of the arrived-command queue
    pub fn arrived_sender(&self) -> mpsc::Sender<ServiceCommand> {
        self.arrived_tx.clone()
    }
}

impl Default for Mailboxes {
    fn default() -> Self {
        Self::new()
    }
}

/// A provisioned node with its supervised broker link
pub struct DeviceNode<T: CloudTransport + 'static> {
    config: NodeConfig,
    services: NodeServices,
    topics: TopicBuilder,
    supervisor: Arc<ReconnectionSupervisor<T>>,
    mailboxes: Mailboxes,
}

impl DeviceNode<MqttSession> {
    /// Provision, connect and subscribe; returns a node ready to [`run`](Self::run)
    pub async fn boot(config: NodeConfig, services: NodeServices) -> NodeResult<Self> {
        let span = crate::lifecycle_span!(phase = "boot", device_id = %config.device.uid);
        async {
            let provisioned = provision(&config, &services).await?;

            let roots = tls::root_store(config.mqtt.root_ca_path.as_deref())?;
            let tls_config = tls::build_client_config(
                roots,
                &provisioned.certificate.pem,
                services.keys.clone(),
            )?;

            let mailboxes = Mailboxes::new();
            let forwarder = MessageForwarder::new(
                mailboxes.arrived_sender(),
                QueueRetry::new(config.supervisor.queue_retry_attempts),
            );
            let session = MqttSession::new(
                SessionSettings::from_config(&config, provisioned.device_secret),
                tls_config,
                services.clock.clone(),
                forwarder,
                Arc::new(SubscriptionRegistry::new()),
            );

            let node = DeviceNode::new(config, services, session, mailboxes);
            node.start_link().await?;
            Ok::<_, NodeError>(node)
        }
        .instrument(span)
        .await
    }
}

impl<T: CloudTransport + 'static> DeviceNode<T> {
    pub fn new(
        config: NodeConfig,
        services: NodeServices,
        transport: T,
        mailboxes: Mailboxes,
    ) -> Self {
        let topics = TopicBuilder::new(&config.cloud.product_key, &config.device.uid);
        let supervisor = ReconnectionSupervisor::new(
            transport,
            FailureBudget::from_config(&config.supervisor),
            services.watchdog.clone(),
            services.reset.clone(),
        );
        Self {
            config,
            services,
            topics,
            supervisor: Arc::new(supervisor),
            mailboxes,
        }
    }

    pub fn supervisor(&self) -> &Arc<ReconnectionSupervisor<T>> {
        &self.supervisor
    }

    pub fn topics(&self) -> &TopicBuilder {
        &self.topics
    }

    /// Inject a service command as if it had arrived from the broker
    pub fn command_sender(&self) -> mpsc::Sender<ServiceCommand> {
        self.mailboxes.arrived_sender()
    }

    /// First connection, under the same budget as any later recovery, then
    /// the default service subscription
    pub async fn start_link(&self) -> NodeResult<()> {
        if self.supervisor.connect().await == RecoveryOutcome::FatalReset {
            return Err(NodeError::Transport(
                "reconnection budget exhausted before the first connection".to_string(),
            ));
        }

        let topic = self
            .topics
            .service(DEFAULT_SERVICE)
            .map_err(MqttError::from)?;
        if self.supervisor.subscribe(&topic).await == RecoveryOutcome::FatalReset {
            return Err(NodeError::Transport(format!(
                "reconnection budget exhausted subscribing to {topic}"
            )));
        }
        info!(topic = %topic, "Subscribed to service commands");
        Ok(())
    }

    /// Run every worker until `shutdown` resolves or a worker stops on its own
    ///
    /// A worker stopping early means the reset latch fired or a queue closed;
    /// both end the run with an error after a clean disconnect.
    pub async fn run<F>(self, shutdown: F) -> NodeResult<()>
    where
        F: Future<Output = ()> + Send,
    {
        let span = crate::lifecycle_span!(phase = "run", device_id = %self.config.device.uid);
        let Self {
            config,
            services,
            topics,
            supervisor,
            mailboxes,
        } = self;
        let Mailboxes {
            upstream_tx,
            upstream_rx,
            reply_tx,
            reply_rx,
            arrived_tx,
            arrived_rx,
        } = mailboxes;

        async move {
            // Held for the whole run so the control queue only closes on shutdown
            let _arrived_tx = arrived_tx;
            let retry = QueueRetry::new(config.supervisor.queue_retry_attempts);
            let (stop_tx, stop_rx) = watch::channel(false);
            let (sensor_tx, sensor_rx) = mpsc::channel(SENSOR_CONTROL_CAPACITY);

            let mut workers: JoinSet<&'static str> = JoinSet::new();
            workers.spawn(
                connectivity_worker(
                    supervisor.clone(),
                    topics,
                    upstream_rx,
                    reply_rx,
                    stop_rx.clone(),
                )
                .instrument(crate::mqtt_span!(worker = "connectivity")),
            );
            workers.spawn(
                liveness_worker(
                    supervisor.clone(),
                    services.watchdog.clone(),
                    Duration::from_secs(config.supervisor.liveness_interval_secs),
                    stop_rx.clone(),
                )
                .instrument(crate::supervisor_span!(worker = "liveness")),
            );

            let distributor = ControlDistributor::new(sensor_tx, retry);
            let distributor_stop = stop_rx.clone();
            workers.spawn(
                async move {
                    distributor.run(arrived_rx, distributor_stop).await;
                    "control"
                }
                .in_current_span(),
            );

            let sampler = SamplingWorker::new(
                config.device.uid.clone(),
                services.source.clone(),
                Duration::from_secs(config.sensors.poll_rate_secs),
                upstream_tx,
                reply_tx,
                retry,
            );
            workers.spawn(
                async move {
                    sampler.run(sensor_rx, stop_rx).await;
                    "sampling"
                }
                .in_current_span(),
            );
            info!(workers = workers.len(), "Node running");

            tokio::pin!(shutdown);
            let outcome: NodeResult<()> = tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    Ok(())
                }
                finished = workers.join_next() => {
                    let worker = finished.and_then(|joined| joined.ok()).unwrap_or("unknown");
                    if supervisor.is_reset_pending() {
                        error!(worker, "Worker stopped after reset request");
                        Err(NodeError::Transport("reconnection budget exhausted".to_string()))
                    } else {
                        error!(worker, "Worker stopped unexpectedly");
                        Err(NodeError::ChannelClosed(worker))
                    }
                }
            };

            let _ = stop_tx.send(true);
            let drained = tokio::time::timeout(WORKER_SHUTDOWN_GRACE, async {
                while workers.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!("Workers did not stop in time, aborting");
                workers.abort_all();
            }

            supervisor.shutdown().await;
            info!("Node stopped");
            outcome
        }
        .instrument(span)
        .await
    }
}

fn reply_message(
    topics: &TopicBuilder,
    reply: &OutboundReply,
) -> Result<(String, Vec<u8>), MqttError> {
    Ok((
        topics.service_reply(&reply.endpoint)?,
        reply.reply.to_payload()?,
    ))
}

async fn connectivity_worker<T: CloudTransport + 'static>(
    supervisor: Arc<ReconnectionSupervisor<T>>,
    topics: TopicBuilder,
    mut upstream: mpsc::Receiver<MeasurePointPost>,
    mut replies: mpsc::Receiver<OutboundReply>,
    mut shutdown: watch::Receiver<bool>,
) -> &'static str {
    const NAME: &str = "connectivity";
    loop {
        let message = tokio::select! {
            post = upstream.recv() => match post {
                Some(post) => post
                    .to_payload()
                    .map(|payload| (topics.measurepoint_post(), payload))
                    .map_err(MqttError::from),
                None => return NAME,
            },
            reply = replies.recv() => match reply {
                Some(reply) => reply_message(&topics, &reply),
                None => return NAME,
            },
            _ = shutdown.changed() => return NAME,
        };

        let (topic, payload) = match message {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, category = "protocol", "Dropping unencodable message");
                continue;
            }
        };

        match supervisor.publish(&topic, payload).await {
            PublishOutcome::Sent => debug!(topic = %topic, "Published"),
            PublishOutcome::Dropped => warn!(topic = %topic, "Message dropped after recovery"),
            PublishOutcome::FatalReset => {
                error!(topic = %topic, "Publishing stopped: node is resetting");
                return NAME;
            }
        }
    }
}

async fn liveness_worker<T: CloudTransport + 'static>(
    supervisor: Arc<ReconnectionSupervisor<T>>,
    watchdog: Arc<dyn Watchdog>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> &'static str {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await; // First tick completes immediately, skip it

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                watchdog.kick();
                if supervisor.check_liveness().await == RecoveryOutcome::FatalReset {
                    return "liveness";
                }
            }
            _ = shutdown.changed() => return "liveness",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SoftwareKeyStore;
    use crate::platform::ManualClock;
    use crate::protocol::ServiceReply;
    use crate::store::MemoryStore;
    use crate::testing::mocks::{CountingWatchdog, MockTransport, RecordingReset};

    fn services() -> NodeServices {
        let store: Arc<dyn PersistStore> = Arc::new(MemoryStore::new());
        let keys = Arc::new(SoftwareKeyStore::load(store.clone()).unwrap());
        NodeServices {
            store,
            keys,
            clock: Arc::new(ManualClock::new(1_600_000_000_000)),
            watchdog: Arc::new(CountingWatchdog::default()),
            reset: Arc::new(RecordingReset::default()),
            source: None,
        }
    }

    #[test]
    fn test_status_of_fresh_node() {
        let status = status(&NodeConfig::test_config(), &services()).unwrap();
        assert_eq!(status.device_id, "abc123");
        assert_eq!(status.key_kind, KeyKind::Software);
        assert_eq!(status.state, ProvisioningState::Unprovisioned);
        assert_eq!(status.certificate_serial, None);
        assert!(!status.initialized);
        assert!(status.to_string().contains("certificate:  none"));
    }

    #[test]
    fn test_reply_message_targets_reply_topic() {
        let topics = TopicBuilder::new("PK1", "abc123");
        let reply = OutboundReply {
            endpoint: "sensorpollrate".to_string(),
            reply: ServiceReply::success("9", "poll_rate_updated"),
        };
        let (topic, payload) = reply_message(&topics, &reply).unwrap();
        assert_eq!(topic, "/sys/PK1/abc123/thing/service/sensorpollrate_reply");
        assert!(String::from_utf8(payload).unwrap().contains(r#""id":"9""#));

        let bad = OutboundReply {
            endpoint: "a/b".to_string(),
            reply: ServiceReply::success("9", "x"),
        };
        assert!(reply_message(&topics, &bad).is_err());
    }

    #[tokio::test]
    async fn test_start_link_subscribes_default_service() {
        let node = DeviceNode::new(
            NodeConfig::test_config(),
            services(),
            MockTransport::new(),
            Mailboxes::new(),
        );
        node.start_link().await.unwrap();

        let transport = node.supervisor().transport();
        let transport = transport.lock().await;
        assert_eq!(
            transport.broker_view(),
            vec!["/sys/PK1/abc123/thing/service/sensorpollrate".to_string()]
        );
    }

    #[tokio::test]
    async fn test_start_link_fails_when_budget_runs_out() {
        let mut config = NodeConfig::test_config();
        config.supervisor.max_failed_reconnections = 2;
        config.supervisor.retry_delay_ms = 0;
        let transport = MockTransport::new();
        transport.fail_next_connects(10);

        let node = DeviceNode::new(config, services(), transport, Mailboxes::new());
        let err = node.start_link().await.unwrap_err();
        assert_eq!(err.category(), "transport");
        assert!(node.supervisor().is_reset_pending());
    }
}
