//! Platform services the node calls into: watchdog, hard reset and wall clock
//!
//! Each one is an injected trait object, so retry loops can be driven in tests
//! without real timers or real resets.

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Exit code used when the process resets itself; service managers restart on it.
pub const RESET_EXIT_CODE: i32 = 75;

/// Why the node asked for a full reset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetReason {
    /// Too many consecutive failed reconnections
    ReconnectionBudgetExhausted,
    /// A renewed certificate was persisted and must be reloaded from scratch
    CertificateRenewed,
    /// The watchdog was not kicked in time
    WatchdogExpired,
}

impl fmt::Display for ResetReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ResetReason::ReconnectionBudgetExhausted => "reconnection budget exhausted",
            ResetReason::CertificateRenewed => "certificate renewed",
            ResetReason::WatchdogExpired => "watchdog expired",
        };
        f.write_str(text)
    }
}

/// Liveness deadline that every blocking retry loop must service
pub trait Watchdog: Send + Sync {
    fn kick(&self);
}

/// Full device reset
///
/// Production implementations do not return. Test implementations do, so
/// callers must stop work themselves after requesting a reset.
pub trait SystemReset: Send + Sync {
    fn reset(&self, reason: ResetReason);
}

/// Millisecond wall clock used for request timestamps and CSR subjects
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// Wall clock backed by the host's UTC time
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Reset implemented as a process exit with [`RESET_EXIT_CODE`]
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessReset;

impl SystemReset for ProcessReset {
    fn reset(&self, reason: ResetReason) {
        error!(reason = %reason, exit_code = RESET_EXIT_CODE, "Performing system reset");
        std::process::exit(RESET_EXIT_CODE);
    }
}

/// Software watchdog: resets the node when it is not kicked within `timeout`
pub struct SoftwareWatchdog {
    started: Instant,
    last_kick_ms: AtomicU64,
    timeout: Duration,
}

impl SoftwareWatchdog {
    /// Create the watchdog and spawn its monitor task
    pub fn start(timeout: Duration, reset: Arc<dyn SystemReset>) -> (Arc<Self>, JoinHandle<()>) {
        let watchdog = Arc::new(Self {
            started: Instant::now(),
            last_kick_ms: AtomicU64::new(0),
            timeout,
        });

        let monitor = Arc::clone(&watchdog);
        let check_every = (timeout / 4).max(Duration::from_millis(100));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(check_every);
            loop {
                ticker.tick().await;
                if monitor.expired() {
                    reset.reset(ResetReason::WatchdogExpired);
                    return;
                }
            }
        });

        (watchdog, handle)
    }

    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// True when the last kick is older than the timeout
    pub fn expired(&self) -> bool {
        let since_kick = self
            .elapsed_ms()
            .saturating_sub(self.last_kick_ms.load(Ordering::Acquire));
        Duration::from_millis(since_kick) > self.timeout
    }
}

impl Watchdog for SoftwareWatchdog {
    fn kick(&self) {
        self.last_kick_ms.store(self.elapsed_ms(), Ordering::Release);
        debug!("watchdog kicked");
    }
}

/// Clock that only moves when told to; handy for deterministic signatures
#[derive(Debug)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now: AtomicI64::new(start_ms),
        }
    }

    pub fn advance(&self, by_ms: i64) {
        self.now.fetch_add(by_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}
