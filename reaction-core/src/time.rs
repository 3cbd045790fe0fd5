//! Clock abstraction
//!
//! Every timestamp handled by the actors and written to the log is a wall
//! clock value in nanoseconds since the UNIX epoch. Tests swap the real clock
//! for a [`MockTimeProvider`] they advance by hand.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Nanoseconds since the UNIX epoch
pub type Timestamp = u64;

/// Time provider trait
pub trait TimeProvider: Send + Sync {
    /// Current wall clock timestamp in nanoseconds
    fn now_ns(&self) -> Timestamp;

    /// Advance time by a duration (mock time only)
    fn advance(&self, _duration: Duration) {}

    /// Set absolute time (mock time only)
    fn set_time(&self, _now_ns: Timestamp) {}
}

/// System clock
#[derive(Debug, Clone)]
pub struct RealTimeProvider;

impl TimeProvider for RealTimeProvider {
    fn now_ns(&self) -> Timestamp {
        use std::time::{SystemTime, UNIX_EPOCH};

        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0)
    }
}

/// Mock time provider for testing
#[derive(Debug, Clone, Default)]
pub struct MockTimeProvider {
    now: Arc<AtomicU64>,
}

impl MockTimeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn at(now_ns: Timestamp) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(now_ns)),
        }
    }
}

impl TimeProvider for MockTimeProvider {
    fn now_ns(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }

    fn advance(&self, duration: Duration) {
        self.now.fetch_add(duration.as_nanos() as u64, Ordering::SeqCst);
    }

    fn set_time(&self, now_ns: Timestamp) {
        self.now.store(now_ns, Ordering::SeqCst);
    }
}

/// Shared clock handle given to every component
#[derive(Clone)]
pub struct TimeManager {
    provider: Arc<dyn TimeProvider>,
}

impl TimeManager {
    pub fn real() -> Self {
        Self {
            provider: Arc::new(RealTimeProvider),
        }
    }

    pub fn with_mock(mock: MockTimeProvider) -> Self {
        Self {
            provider: Arc::new(mock),
        }
    }

    pub fn now_ns(&self) -> Timestamp {
        self.provider.now_ns()
    }

    pub fn provider(&self) -> &Arc<dyn TimeProvider> {
        &self.provider
    }
}

impl std::fmt::Debug for TimeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeManager").field("now_ns", &self.now_ns()).finish()
    }
}

/// `ts + d`, saturating
pub fn add(ts: Timestamp, d: Duration) -> Timestamp {
    ts.saturating_add(d.as_nanos() as u64)
}

/// Time elapsed from `earlier` to `later`, zero if `later` is before
pub fn elapsed(earlier: Timestamp, later: Timestamp) -> Duration {
    Duration::from_nanos(later.saturating_sub(earlier))
}
