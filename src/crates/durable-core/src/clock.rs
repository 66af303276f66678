//! Time source for waits, deadlines and retry delays
//!
//! [`SystemClock`] reads wall-clock time and sleeps on the tokio timer.
//! [`ManualClock`] is a virtual clock for tests: `sleep` advances it instantly,
//! so an hour-long timed wait completes in microseconds.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Source of "now" and of delays
#[async_trait]
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current time
    fn now(&self) -> DateTime<Utc>;

    /// Wait for `duration`
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    /// Wait until `deadline` (returns immediately if it has passed)
    async fn sleep_until(&self, deadline: DateTime<Utc>) {
        if let Ok(remaining) = (deadline - self.now()).to_std() {
            self.sleep(remaining).await;
        }
    }
}

/// Wall-clock time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Virtual clock controlled by the test.
///
/// Clones share the same time.
///
/// ```rust
/// use durable_core::clock::{Clock, ManualClock};
/// use std::time::Duration;
///
/// let clock = ManualClock::new();
/// let start = clock.now();
/// clock.advance(Duration::from_secs(3600));
/// assert_eq!((clock.now() - start).num_seconds(), 3600);
/// ```
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    /// Start at the current wall-clock time
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Start at a fixed instant
    pub fn starting_at(now: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
        }
    }

    /// Move time forward
    pub fn advance(&self, duration: Duration) {
        let Ok(delta) = chrono::Duration::from_std(duration) else {
            return;
        };
        let mut now = self.now.lock();
        *now = now.checked_add_signed(delta).unwrap_or(*now);
    }

    /// Jump to `instant` (never moves backwards)
    pub fn set(&self, instant: DateTime<Utc>) {
        let mut now = self.now.lock();
        if instant > *now {
            *now = instant;
        }
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(duration);
        tokio::task::yield_now().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_manual_clock_sleep_advances() {
        let clock = ManualClock::new();
        let start = clock.now();
        clock.sleep(Duration::from_secs(90)).await;
        assert_eq!((clock.now() - start).num_seconds(), 90);
    }

    #[tokio::test]
    async fn test_sleep_until_past_deadline_is_noop() {
        let clock = ManualClock::new();
        let start = clock.now();
        clock.sleep_until(start - chrono::Duration::seconds(5)).await;
        assert_eq!(clock.now(), start);

        clock.sleep_until(start + chrono::Duration::seconds(5)).await;
        assert_eq!(clock.now(), start + chrono::Duration::seconds(5));
    }

    #[test]
    fn test_set_never_moves_backwards() {
        let clock = ManualClock::new();
        let start = clock.now();
        clock.set(start - chrono::Duration::hours(1));
        assert_eq!(clock.now(), start);
    }

    #[tokio::test(start_paused = true)]
    async fn test_system_clock_sleeps_on_tokio_timer() {
        let before = tokio::time::Instant::now();
        SystemClock.sleep(Duration::from_secs(10)).await;
        assert!(before.elapsed() >= Duration::from_secs(10));
    }
}
