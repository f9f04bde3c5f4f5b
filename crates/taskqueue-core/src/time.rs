//! Time abstraction for testable scheduling and backoff.
//!
//! Backoff delays, `scheduled_at` gating, and every persisted timestamp go
//! through a [`Clock`], so tests can drive time deterministically instead of
//! sleeping.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use chrono::{DateTime, Utc};

/// Injectable time source.
///
/// Production code uses [`RealClock`]; tests inject [`TestClock`] to advance
/// virtual time immediately.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current instant for duration measurements.
    fn now(&self) -> Instant;

    /// Current wall-clock time for persisted timestamps.
    fn now_system(&self) -> SystemTime;

    /// Sleeps for the given duration.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    /// Wall-clock time as the `chrono` type the models store.
    fn now_utc(&self) -> DateTime<Utc> {
        DateTime::from(self.now_system())
    }
}

/// Production clock backed by system time and tokio sleeps.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    pub fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn now_system(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Deterministic clock for tests.
///
/// Monotonic and system time advance together; `sleep` advances the clock
/// instead of waiting, so backoff-heavy paths run instantly.
#[derive(Debug, Clone)]
pub struct TestClock {
    /// Monotonic nanoseconds since clock creation.
    monotonic_ns: Arc<AtomicU64>,
    /// System time as nanoseconds since UNIX_EPOCH.
    system_ns: Arc<AtomicU64>,
    base_instant: Instant,
}

impl TestClock {
    /// Creates a test clock starting at the current wall-clock time.
    pub fn new() -> Self {
        Self::with_start_time(SystemTime::now())
    }

    /// Creates a test clock starting at a specific time.
    pub fn with_start_time(start: SystemTime) -> Self {
        let since_epoch = start.duration_since(UNIX_EPOCH).unwrap_or_default();

        Self {
            monotonic_ns: Arc::new(AtomicU64::new(0)),
            system_ns: Arc::new(AtomicU64::new(
                u64::try_from(since_epoch.as_nanos().min(u128::from(u64::MAX))).unwrap_or(0),
            )),
            base_instant: Instant::now(),
        }
    }

    /// Advances both clocks by the given duration.
    pub fn advance(&self, duration: Duration) {
        let ns = u64::try_from(duration.as_nanos().min(u128::from(u64::MAX))).unwrap_or(0);
        self.monotonic_ns.fetch_add(ns, Ordering::AcqRel);
        self.system_ns.fetch_add(ns, Ordering::AcqRel);
    }

    /// Jumps system time to a specific instant.
    ///
    /// Monotonic time only ever moves forward; backwards jumps affect the
    /// system clock alone.
    pub fn jump_to(&self, time: SystemTime) {
        let target_ns = u64::try_from(
            time.duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos()
                .min(u128::from(u64::MAX)),
        )
        .unwrap_or(0);
        let current_ns = self.system_ns.load(Ordering::Acquire);

        if target_ns > current_ns {
            self.advance(Duration::from_nanos(target_ns - current_ns));
        } else {
            self.system_ns.store(target_ns, Ordering::Release);
        }
    }

    /// Elapsed virtual time since creation.
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.monotonic_ns.load(Ordering::Acquire))
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        self.base_instant + Duration::from_nanos(self.monotonic_ns.load(Ordering::Acquire))
    }

    fn now_system(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_nanos(self.system_ns.load(Ordering::Acquire))
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.advance(duration);
        // yield so concurrent tasks observe the new time
        Box::pin(tokio::task::yield_now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_moves_both_clocks() {
        let clock = TestClock::new();
        let start_instant = clock.now();
        let start_system = clock.now_system();

        clock.advance(Duration::from_secs(10));

        assert_eq!(clock.now().duration_since(start_instant), Duration::from_secs(10));
        assert_eq!(
            clock.now_system().duration_since(start_system).unwrap(),
            Duration::from_secs(10)
        );
    }

    #[test]
    fn jump_backwards_leaves_monotonic_alone() {
        let clock = TestClock::with_start_time(UNIX_EPOCH + Duration::from_secs(5000));
        let before = clock.now();

        clock.jump_to(UNIX_EPOCH + Duration::from_secs(1000));

        assert_eq!(clock.now_system(), UNIX_EPOCH + Duration::from_secs(1000));
        assert!(clock.now() >= before);
    }

    #[tokio::test]
    async fn sleep_advances_instead_of_waiting() {
        let clock = TestClock::new();
        let start = clock.now();
        clock.sleep(Duration::from_secs(3600)).await;
        assert_eq!(clock.now().duration_since(start), Duration::from_secs(3600));
    }

    #[test]
    fn now_utc_tracks_system_time() {
        let clock = TestClock::with_start_time(UNIX_EPOCH + Duration::from_secs(1_700_000_000));
        let utc = clock.now_utc();
        assert_eq!(utc.timestamp(), 1_700_000_000);
    }
}
