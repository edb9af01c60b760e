//! MQTT-over-TLS session to the DECADA broker
//!
//! A session owns at most one rumqttc client and one driver task polling its
//! event loop. The driver never reconnects on its own: when the link fails it
//! records the reason and stops, leaving recovery to the reconnection
//! supervisor.

use super::connection::{
    configure_mqtt_options, ConnectionState, MqttCredentials, MqttError, SessionSettings,
};
use super::health_monitor::{ConnectionEvent, HealthMonitor};
use super::message_handler::{EventRoute, MessageForwarder, MessageHandler};
use super::subscriptions::SubscriptionRegistry;
use crate::error::sanitize_error_message;
use crate::platform::Clock;
use crate::queue::QueueError;
use crate::transport::CloudTransport;
use rumqttc::tokio_rustls::rustls::ClientConfig;
use rumqttc::{AsyncClient, EventLoop, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Pending requests rumqttc buffers between the client and the event loop
const REQUEST_CHANNEL_CAPACITY: usize = 10;

/// How long a driver gets to flush DISCONNECT before it is aborted
const DRIVER_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

pub struct MqttSession {
    settings: SessionSettings,
    tls: Arc<ClientConfig>,
    clock: Arc<dyn Clock>,
    forwarder: MessageForwarder,
    subscriptions: Arc<SubscriptionRegistry>,
    client: Option<AsyncClient>,
    driver: Option<JoinHandle<()>>,
    state_tx: watch::Sender<ConnectionState>,
}

fn apply_event(state_tx: &watch::Sender<ConnectionState>, event: ConnectionEvent) {
    state_tx.send_modify(|state| *state = HealthMonitor::determine_next_state(state, event));
}

impl MqttSession {
    pub fn new(
        settings: SessionSettings,
        tls: Arc<ClientConfig>,
        clock: Arc<dyn Clock>,
        forwarder: MessageForwarder,
        subscriptions: Arc<SubscriptionRegistry>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        Self {
            settings,
            tls,
            clock,
            forwarder,
            subscriptions,
            client: None,
            driver: None,
            state_tx,
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Receiver that observes every state change of this session
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Wait for ConnAck, or for the driver to report why the link failed
    async fn wait_for_connection_confirmation(
        mut state_rx: watch::Receiver<ConnectionState>,
        timeout: Duration,
    ) -> Result<(), MqttError> {
        let outcome = tokio::time::timeout(timeout, async {
            loop {
                let state = state_rx.borrow_and_update().clone();
                match state {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Disconnected(reason) => {
                        return Err(MqttError::ConnectionFailed(reason));
                    }
                    ConnectionState::Idle | ConnectionState::Connecting => {}
                }
                if state_rx.changed().await.is_err() {
                    return Err(MqttError::ConnectionFailed(
                        "State channel closed".to_string(),
                    ));
                }
            }
        })
        .await;

        match outcome {
            Ok(result) => result,
            Err(_) => Err(MqttError::ConnectionFailed(
                "ConnAck timeout - no connection confirmation received".to_string(),
            )),
        }
    }

    /// Poll the event loop until the link ends or DISCONNECT is sent
    async fn drive(
        mut event_loop: EventLoop,
        state_tx: watch::Sender<ConnectionState>,
        forwarder: MessageForwarder,
    ) {
        loop {
            let event = match event_loop.poll().await {
                Ok(event) => event,
                Err(e) => {
                    let reason = sanitize_error_message(&e.to_string());
                    warn!(%reason, category = "transport", "MQTT event loop stopped");
                    apply_event(&state_tx, ConnectionEvent::NetworkError(reason));
                    break;
                }
            };

            match MessageHandler::route_mqtt_event(&event) {
                EventRoute::ConnectionAcknowledged => {
                    info!("Broker accepted MQTT session");
                    apply_event(&state_tx, ConnectionEvent::ConnAckReceived);
                }
                EventRoute::MessageReceived {
                    topic,
                    payload,
                    retain,
                } => {
                    if !MessageHandler::should_process_message(&topic, retain) {
                        continue;
                    }
                    match forwarder.forward(&topic, &payload).await {
                        Ok(_) => {}
                        Err(e @ QueueError::Exhausted { .. }) => {
                            error!(error = %e, category = "fatal_resource_exhaustion", "Service command dropped");
                        }
                        Err(e @ QueueError::Closed { .. }) => {
                            debug!(error = %e, "Control distributor gone, command dropped");
                        }
                    }
                }
                EventRoute::Disconnected => {
                    warn!("Broker closed the MQTT session");
                    apply_event(&state_tx, ConnectionEvent::BrokerDisconnected);
                    break;
                }
                EventRoute::LocalDisconnect => {
                    apply_event(&state_tx, ConnectionEvent::LocalDisconnect);
                    break;
                }
                EventRoute::SubscriptionConfirmed {
                    packet_id,
                    rejected,
                } => {
                    if rejected > 0 {
                        warn!(packet_id, rejected, "Broker rejected subscription");
                    } else {
                        debug!(packet_id, "Subscription confirmed");
                    }
                }
                EventRoute::InfrastructureEvent(description) => {
                    debug!(event = %description, "MQTT infrastructure event");
                }
                EventRoute::OutgoingEvent => {}
            }
        }
    }

    fn connected_client(&self) -> Result<&AsyncClient, MqttError> {
        let state = self.connection_state();
        match &self.client {
            Some(client) if HealthMonitor::can_publish(&state) => Ok(client),
            _ => Err(MqttError::NotConnected { state }),
        }
    }
}

#[async_trait::async_trait]
impl CloudTransport for MqttSession {
    type Error = MqttError;

    async fn connect(&mut self) -> Result<(), MqttError> {
        // at most one live client per session
        self.disconnect().await;

        let credentials = MqttCredentials::derive(
            &self.settings.device_id,
            &self.settings.product_key,
            &self.settings.device_secret,
            self.clock.now_ms(),
        );
        let options = configure_mqtt_options(&self.settings, &credentials, self.tls.clone());
        let (client, event_loop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);

        apply_event(&self.state_tx, ConnectionEvent::ConnectStarted);
        let state_rx = self.state_tx.subscribe();

        info!(
            client_id = %credentials.client_id,
            host = %self.settings.host,
            port = self.settings.port,
            "Connecting to MQTT broker"
        );
        self.driver = Some(tokio::spawn(Self::drive(
            event_loop,
            self.state_tx.clone(),
            self.forwarder.clone(),
        )));
        self.client = Some(client);

        if let Err(e) =
            Self::wait_for_connection_confirmation(state_rx, self.settings.connect_timeout).await
        {
            warn!(error = %e, "MQTT connect failed");
            self.disconnect().await;
            return Err(e);
        }
        Ok(())
    }

    async fn disconnect(&mut self) {
        let was_connected = self.is_connected();

        if let Some(client) = self.client.take() {
            if was_connected {
                for topic in self.subscriptions.all() {
                    if let Err(e) = client.try_unsubscribe(topic.as_str()) {
                        debug!(%topic, error = %e, "Unsubscribe not sent");
                    }
                }
            }
            if let Err(e) = client.try_disconnect() {
                debug!(error = %e, "DISCONNECT not sent");
            }
        }

        if let Some(mut handle) = self.driver.take() {
            match tokio::time::timeout(DRIVER_SHUTDOWN_GRACE, &mut handle).await {
                Ok(Ok(())) => debug!("MQTT driver stopped"),
                Ok(Err(e)) if !e.is_cancelled() => warn!(error = %e, "MQTT driver ended with error"),
                Ok(Err(_)) => {}
                Err(_) => {
                    warn!("MQTT driver did not stop in time, aborting");
                    handle.abort();
                }
            }
            apply_event(&self.state_tx, ConnectionEvent::LocalDisconnect);
            info!("MQTT session torn down");
        }
    }

    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), MqttError> {
        let client = self.connected_client()?;
        client
            .publish(topic, QoS::AtMostOnce, false, payload)
            .await?;
        Ok(())
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), MqttError> {
        if self.subscriptions.add(topic) {
            debug!(topic, "Registered subscription");
        }
        let client = self.connected_client()?;
        client.subscribe(topic, QoS::AtLeastOnce).await?;
        info!(topic, "Subscribed");
        Ok(())
    }

    async fn unsubscribe(&mut self, topic: &str) -> Result<(), MqttError> {
        self.subscriptions.remove(topic);
        let client = self.connected_client()?;
        client.unsubscribe(topic).await?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        let driver_alive = self
            .driver
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false);
        driver_alive && HealthMonitor::can_publish(&self.connection_state())
    }

    fn connection_state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    fn subscriptions(&self) -> Arc<SubscriptionRegistry> {
        self.subscriptions.clone()
    }
}

impl Drop for MqttSession {
    fn drop(&mut self) {
        if let Some(handle) = self.driver.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::DeviceSecret;
    use crate::crypto::{KeyStore, SoftwareKeyStore};
    use crate::platform::ManualClock;
    use crate::protocol::ServiceCommand;
    use crate::queue::QueueRetry;
    use crate::store::MemoryStore;
    use crate::transport::mqtt::tls;
    use bytes::BytesMut;
    use rumqttc::tokio_rustls::rustls::pki_types::PrivatePkcs8KeyDer;
    use rumqttc::tokio_rustls::rustls::{RootCertStore, ServerConfig};
    use rumqttc::tokio_rustls::TlsAcceptor;
    use rumqttc::{ConnAck, ConnectReturnCode, Packet, Publish, SubAck, SubscribeReasonCode};
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    const SERVICE_TOPIC: &str = "/sys/PK1/abc123/thing/service/sensorpollrate";
    const CONFIG_TOPIC: &str = "/sys/PK1/abc123/thing/service/config";

    fn session(port: u16, connect_timeout: Duration) -> MqttSession {
        session_trusting(port, connect_timeout, tls::root_store(None).unwrap()).0
    }

    /// Session whose TLS config trusts `roots`, plus the arrived-command queue
    fn session_trusting(
        port: u16,
        connect_timeout: Duration,
        roots: RootCertStore,
    ) -> (MqttSession, mpsc::Receiver<ServiceCommand>) {
        let keys = SoftwareKeyStore::load(Arc::new(MemoryStore::new())).unwrap();
        keys.generate_keypair().unwrap();
        let cert = rcgen::generate_simple_self_signed(vec!["abc123".to_string()])
            .unwrap()
            .cert
            .pem();
        let tls = tls::build_client_config(roots, &cert, Arc::new(keys)).unwrap();

        let settings = SessionSettings {
            device_id: "abc123".to_string(),
            product_key: "PK1".to_string(),
            device_secret: DeviceSecret::new("SECRET"),
            host: "127.0.0.1".to_string(),
            port,
            keep_alive: Duration::from_secs(3600),
            connect_timeout,
        };
        let (tx, rx) = mpsc::channel(4);
        let session = MqttSession::new(
            settings,
            tls,
            Arc::new(ManualClock::new(1_600_000_000_000)),
            MessageForwarder::new(tx, QueueRetry::new(1)),
            Arc::new(SubscriptionRegistry::new()),
        );
        (session, rx)
    }

    /// Single-client MQTT 3.1.1 broker behind TLS on 127.0.0.1
    ///
    /// Accepts the CONNECT, acknowledges every SUBSCRIBE and sends `publish`
    /// after the first one. Resolves to the topics the client unsubscribed
    /// from before it disconnected.
    struct LocalBroker {
        port: u16,
        roots: RootCertStore,
        unsubscribed: JoinHandle<Vec<String>>,
    }

    impl LocalBroker {
        async fn start(publish: Publish) -> Self {
            let ca_key = rcgen::KeyPair::generate().unwrap();
            let mut ca_params = rcgen::CertificateParams::new(vec![]).unwrap();
            ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
            ca_params
                .distinguished_name
                .push(rcgen::DnType::CommonName, "local test CA");
            let ca = ca_params.self_signed(&ca_key).unwrap();

            let server_key = rcgen::KeyPair::generate().unwrap();
            let mut server_params =
                rcgen::CertificateParams::new(vec!["127.0.0.1".to_string()]).unwrap();
            server_params
                .distinguished_name
                .push(rcgen::DnType::CommonName, "127.0.0.1");
            let server_cert = server_params
                .signed_by(&server_key, &ca, &ca_key)
                .unwrap();
            let server_config = ServerConfig::builder()
                .with_no_client_auth()
                .with_single_cert(
                    vec![server_cert.der().clone()],
                    PrivatePkcs8KeyDer::from(server_key.serialize_der()).into(),
                )
                .unwrap();

            let mut roots = RootCertStore::empty();
            roots.add(ca.der().clone()).unwrap();

            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            let acceptor = TlsAcceptor::from(Arc::new(server_config));
            let unsubscribed = tokio::spawn(async move {
                let (tcp, _) = listener.accept().await.unwrap();
                let mut stream = acceptor.accept(tcp).await.unwrap();
                serve(&mut stream, publish).await
            });

            Self {
                port,
                roots,
                unsubscribed,
            }
        }
    }

    async fn serve<S>(stream: &mut S, publish: Publish) -> Vec<String>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut buffer = BytesMut::new();
        let mut pending_publish = Some(publish);
        let mut unsubscribed = Vec::new();

        while let Some(packet) = next_packet(stream, &mut buffer).await {
            let mut out = BytesMut::new();
            match packet {
                Packet::Connect(_) => {
                    ConnAck::new(ConnectReturnCode::Success, false)
                        .write(&mut out)
                        .unwrap();
                }
                Packet::Subscribe(subscribe) => {
                    let codes = subscribe
                        .filters
                        .iter()
                        .map(|_| SubscribeReasonCode::Success(QoS::AtLeastOnce))
                        .collect();
                    SubAck::new(subscribe.pkid, codes).write(&mut out).unwrap();
                    if let Some(publish) = pending_publish.take() {
                        publish.write(&mut out).unwrap();
                    }
                }
                Packet::Unsubscribe(unsubscribe) => unsubscribed.extend(unsubscribe.topics),
                Packet::Disconnect => break,
                _ => {}
            }
            if !out.is_empty() {
                stream.write_all(&out).await.unwrap();
                stream.flush().await.unwrap();
            }
        }
        unsubscribed
    }

    /// Next complete packet, or None once the client hangs up
    async fn next_packet<S: AsyncRead + Unpin>(
        stream: &mut S,
        buffer: &mut BytesMut,
    ) -> Option<Packet> {
        loop {
            match rumqttc::mqttbytes::v4::read(buffer, 64 * 1024) {
                Ok(packet) => return Some(packet),
                Err(rumqttc::mqttbytes::Error::InsufficientBytes(_)) => {}
                Err(e) => panic!("malformed packet from client: {e}"),
            }
            match stream.read_buf(buffer).await {
                Ok(0) | Err(_) => return None,
                Ok(_) => {}
            }
        }
    }

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_new_session_is_idle() {
        let session = session(18885, Duration::from_secs(1));
        assert_eq!(session.connection_state(), ConnectionState::Idle);
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent_on_idle_session() {
        let mut session = session(18885, Duration::from_secs(1));
        session.disconnect().await;
        session.disconnect().await;
        assert_eq!(session.connection_state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_publish_requires_connection() {
        let mut session = session(18885, Duration::from_secs(1));
        let result = session.publish("/sys/PK1/abc123/thing/measurepoint/post", vec![]).await;
        assert!(matches!(
            result,
            Err(MqttError::NotConnected {
                state: ConnectionState::Idle
            })
        ));
    }

    #[tokio::test]
    async fn test_subscribe_while_offline_still_registers_topic() {
        let mut session = session(18885, Duration::from_secs(1));
        assert!(session.subscribe("topicA").await.is_err());
        assert!(session.subscriptions().contains("topicA"));

        assert!(session.unsubscribe("topicA").await.is_err());
        assert!(!session.subscriptions().contains("topicA"));
    }

    #[tokio::test]
    async fn test_connect_refused_reports_failure() {
        let port = closed_port().await;
        let mut session = session(port, Duration::from_secs(5));

        let result = session.connect().await;
        assert!(matches!(result, Err(MqttError::ConnectionFailed(_))));
        assert!(!session.is_connected());
        assert!(matches!(
            session.connection_state(),
            ConnectionState::Disconnected(_)
        ));
    }

    #[tokio::test]
    async fn test_connect_times_out_without_connack() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let silent = tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let mut session = session(port, Duration::from_millis(200));
        let result = session.connect().await;
        assert!(matches!(result, Err(MqttError::ConnectionFailed(reason)) if reason.contains("timeout")));
        assert!(!session.is_connected());
        silent.abort();
    }

    #[tokio::test]
    async fn test_connack_connects_and_forwards_service_requests() {
        let payload = br#"{"id":"1017","method":"thing.service.sensorpollrate","params":{"sensorpollrate":"30"}}"#;
        let broker =
            LocalBroker::start(Publish::new(SERVICE_TOPIC, QoS::AtMostOnce, payload.to_vec()))
                .await;
        let (mut session, mut arrived) =
            session_trusting(broker.port, Duration::from_secs(5), broker.roots.clone());

        session.connect().await.unwrap();
        assert_eq!(session.connection_state(), ConnectionState::Connected);
        assert!(session.is_connected());

        session.subscribe(SERVICE_TOPIC).await.unwrap();
        session.subscribe(CONFIG_TOPIC).await.unwrap();

        let command = tokio::time::timeout(Duration::from_secs(5), arrived.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            command,
            ServiceCommand {
                endpoint: "sensorpollrate".to_string(),
                msg_id: "1017".to_string(),
                param: "sensorpollrate".to_string(),
                value: "30".to_string(),
            }
        );

        session.disconnect().await;
        assert!(!session.is_connected());

        let mut unsubscribed = tokio::time::timeout(Duration::from_secs(5), broker.unsubscribed)
            .await
            .unwrap()
            .unwrap();
        unsubscribed.sort();
        let mut registered = session.subscriptions().all();
        registered.sort();
        assert_eq!(registered.len(), 2);
        assert_eq!(unsubscribed, registered);
    }
}
