//! Clock abstraction shared by workers, the delivery client and the
//! in-memory store.
//!
//! Due-times in the ready set are unix seconds with a fractional part, so the
//! trait exposes that directly alongside the usual instant and wall-clock
//! readings.

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

/// Source of time for everything that schedules or measures.
///
/// Production code uses `RealClock`. Tests inject `TestClock` so that retry
/// schedules and TTL expiry can be driven without waiting.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Monotonic instant for measuring durations.
    fn now(&self) -> Instant;

    /// Wall-clock time for timestamps and due-times.
    fn now_system(&self) -> SystemTime;

    /// Suspends the caller for `duration`.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    /// Wall-clock time as a UTC timestamp.
    fn now_utc(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from(self.now_system())
    }

    /// Wall-clock time as fractional seconds since the unix epoch.
    fn unix_seconds(&self) -> f64 {
        self.now_system().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
    }
}

/// Clock backed by the operating system and tokio's timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    /// Creates a new real clock.
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

/// Manually driven clock.
///
/// Clones share the same underlying time, so a test can hand one clone to
/// the engine and advance another. `sleep` advances the clock by the
/// requested amount and yields once instead of waiting.
#[derive(Debug, Clone)]
pub struct TestClock {
    elapsed_ns: Arc<AtomicU64>,
    wall_ns: Arc<AtomicU64>,
    origin: Instant,
}

fn saturating_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

impl TestClock {
    /// Creates a test clock starting at the current wall-clock time.
    pub fn new() -> Self {
        Self::with_start_time(SystemTime::now())
    }

    /// Creates a test clock starting at `start`.
    pub fn with_start_time(start: SystemTime) -> Self {
        let wall = start.duration_since(UNIX_EPOCH).unwrap_or_default();
        Self {
            elapsed_ns: Arc::new(AtomicU64::new(0)),
            wall_ns: Arc::new(AtomicU64::new(saturating_nanos(wall))),
            origin: Instant::now(),
        }
    }

    /// Moves both monotonic and wall-clock time forward.
    pub fn advance(&self, duration: Duration) {
        let ns = saturating_nanos(duration);
        self.elapsed_ns.fetch_add(ns, Ordering::AcqRel);
        self.wall_ns.fetch_add(ns, Ordering::AcqRel);
    }

    /// Sets wall-clock time to `time`.
    ///
    /// Monotonic time only ever moves forward; a jump into the past changes
    /// wall-clock time alone.
    pub fn jump_to(&self, time: SystemTime) {
        let target = saturating_nanos(time.duration_since(UNIX_EPOCH).unwrap_or_default());
        let current = self.wall_ns.load(Ordering::Acquire);
        if target > current {
            self.advance(Duration::from_nanos(target - current));
        } else {
            self.wall_ns.store(target, Ordering::Release);
        }
    }

    /// Total time advanced since creation.
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.elapsed_ns.load(Ordering::Acquire))
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }

    fn now_system(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_nanos(self.wall_ns.load(Ordering::Acquire))
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.advance(duration);
        Box::pin(tokio::task::yield_now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_moves_both_clocks() {
        let start = UNIX_EPOCH + Duration::from_secs(1_000);
        let clock = TestClock::with_start_time(start);
        let before = clock.now();

        clock.advance(Duration::from_secs(30));

        assert_eq!(clock.now().duration_since(before), Duration::from_secs(30));
        assert_eq!(clock.now_system(), start + Duration::from_secs(30));
    }

    #[test]
    fn unix_seconds_keeps_fraction() {
        let clock = TestClock::with_start_time(UNIX_EPOCH + Duration::from_millis(1_500));
        assert!((clock.unix_seconds() - 1.5).abs() < f64::EPSILON);
    }

    #[test]
    fn jump_backwards_only_changes_wall_clock() {
        let clock = TestClock::with_start_time(UNIX_EPOCH + Duration::from_secs(5_000));
        clock.advance(Duration::from_secs(10));

        clock.jump_to(UNIX_EPOCH + Duration::from_secs(100));

        assert_eq!(clock.now_system(), UNIX_EPOCH + Duration::from_secs(100));
        assert_eq!(clock.elapsed(), Duration::from_secs(10));
    }

    #[test]
    fn clones_share_time() {
        let clock = TestClock::new();
        let handle = clock.clone();

        handle.advance(Duration::from_secs(7));

        assert_eq!(clock.elapsed(), Duration::from_secs(7));
    }

    #[tokio::test]
    async fn sleep_advances_without_waiting() {
        let clock = TestClock::new();

        clock.sleep(Duration::from_secs(3600)).await;

        assert_eq!(clock.elapsed(), Duration::from_secs(3600));
    }
}
