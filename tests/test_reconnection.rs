//! Reconnection supervision against a scripted transport
//!
//! Tests the observable recovery contract: subscriptions survive every
//! reconnect exactly once, concurrent callers share one recovery, and the
//! reset fires once no matter how many callers hit the exhausted budget.

use decada_node::platform::ResetReason;
use decada_node::testing::mocks::{CountingWatchdog, MockTransport, RecordingReset};
use decada_node::transport::mqtt::{
    FailureBudget, PublishOutcome, ReconnectionSupervisor, RecoveryOutcome,
};
use decada_node::transport::CloudTransport;
use std::sync::Arc;
use std::time::Duration;

const SERVICE_TOPIC: &str = "/sys/PK1/abc123/thing/service/sensorpollrate";
const TELEMETRY_TOPIC: &str = "/sys/PK1/abc123/thing/measurepoint/post";

struct Harness {
    supervisor: Arc<ReconnectionSupervisor<MockTransport>>,
    watchdog: Arc<CountingWatchdog>,
    reset: Arc<RecordingReset>,
}

fn harness(transport: MockTransport, max_failures: u32) -> Harness {
    let watchdog = Arc::new(CountingWatchdog::default());
    let reset = Arc::new(RecordingReset::default());
    let supervisor = ReconnectionSupervisor::new(
        transport,
        FailureBudget {
            max_failures,
            retry_delay: Duration::from_millis(1),
        },
        watchdog.clone(),
        reset.clone(),
    );
    Harness {
        supervisor: Arc::new(supervisor),
        watchdog,
        reset,
    }
}

#[tokio::test]
async fn test_link_drop_is_detected_and_subscriptions_replayed() {
    let h = harness(MockTransport::new(), 5);
    assert_eq!(h.supervisor.connect().await, RecoveryOutcome::Recovered);
    assert_eq!(
        h.supervisor.subscribe(SERVICE_TOPIC).await,
        RecoveryOutcome::Healthy
    );

    for _ in 0..3 {
        h.supervisor.transport().lock().await.drop_link();
        assert_eq!(
            h.supervisor.check_liveness().await,
            RecoveryOutcome::Recovered
        );
    }

    let transport = h.supervisor.transport();
    let transport = transport.lock().await;
    assert_eq!(transport.broker_view(), vec![SERVICE_TOPIC.to_string()]);
    assert_eq!(transport.duplicate_subscriptions(), 0);
    assert_eq!(h.supervisor.generation(), 4);
    assert!(h.watchdog.kicks() >= 4);
}

#[tokio::test]
async fn test_publish_rides_through_a_dropped_link() {
    let h = harness(MockTransport::new(), 5);
    h.supervisor.connect().await;
    h.supervisor.subscribe(SERVICE_TOPIC).await;

    {
        let transport = h.supervisor.transport();
        let mut transport = transport.lock().await;
        transport.drop_link();
        transport.fail_next_connects(2);
    }

    assert_eq!(
        h.supervisor.publish(TELEMETRY_TOPIC, b"{}".to_vec()).await,
        PublishOutcome::Sent
    );
    assert_eq!(h.supervisor.failure_count(), 0);

    let transport = h.supervisor.transport();
    let transport = transport.lock().await;
    assert_eq!(transport.published().len(), 1);
    assert!(transport.is_connected());
    assert_eq!(transport.broker_view(), vec![SERVICE_TOPIC.to_string()]);
}

#[tokio::test]
async fn test_concurrent_callers_share_one_recovery() {
    let h = harness(MockTransport::new(), 5);
    h.supervisor.connect().await;
    h.supervisor.transport().lock().await.drop_link();
    let attempts_before = h.supervisor.transport().lock().await.connect_attempts();

    let (a, b, c) = tokio::join!(
        h.supervisor.publish(TELEMETRY_TOPIC, b"1".to_vec()),
        h.supervisor.publish(TELEMETRY_TOPIC, b"2".to_vec()),
        h.supervisor.check_liveness(),
    );
    assert_eq!(a, PublishOutcome::Sent);
    assert_eq!(b, PublishOutcome::Sent);
    assert_ne!(c, RecoveryOutcome::FatalReset);

    let attempts = h.supervisor.transport().lock().await.connect_attempts() - attempts_before;
    assert_eq!(attempts, 1, "only one caller should have reconnected");
}

#[tokio::test]
async fn test_exhausted_budget_resets_exactly_once_for_all_callers() {
    let transport = MockTransport::new();
    transport.fail_next_connects(u32::MAX);
    let h = harness(transport, 3);

    let (first, second, third) = tokio::join!(
        h.supervisor.connect(),
        h.supervisor.publish(TELEMETRY_TOPIC, b"x".to_vec()),
        h.supervisor.check_liveness(),
    );
    assert_eq!(first, RecoveryOutcome::FatalReset);
    assert_eq!(second, PublishOutcome::FatalReset);
    assert_eq!(third, RecoveryOutcome::FatalReset);

    assert_eq!(
        h.reset.reasons(),
        vec![ResetReason::ReconnectionBudgetExhausted]
    );
    assert_eq!(h.supervisor.failure_count(), 3);
    assert!(h.supervisor.is_reset_pending());
    assert_eq!(h.supervisor.transport().lock().await.connect_attempts(), 3);
}
