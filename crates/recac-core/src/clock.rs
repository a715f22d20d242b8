//! Clock capability.
//!
//! Sessions sleep between iterations and the orchestrator ticks on an
//! interval; tests inject [`ManualClock`] so those waits return immediately.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Time source and sleep capability.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current wall-clock time.
    fn now(&self) -> DateTime<Utc>;

    /// Sleep for the given duration.
    async fn sleep(&self, duration: Duration);
}

/// Real clock backed by `Utc::now` and `tokio::time::sleep`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Test clock: `sleep` returns immediately and advances the reported time.
#[derive(Debug)]
pub struct ManualClock {
    now: parking_lot::Mutex<DateTime<Utc>>,
    slept: parking_lot::Mutex<Vec<Duration>>,
}

impl ManualClock {
    /// Create a manual clock starting at the given instant.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: parking_lot::Mutex::new(start),
            slept: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Advance the reported time without sleeping.
    pub fn advance(&self, duration: Duration) {
        let mut now = self.now.lock();
        *now += chrono::Duration::from_std(duration).unwrap_or_default();
    }

    /// Every duration passed to `sleep` so far, in call order.
    pub fn slept(&self) -> Vec<Duration> {
        self.slept.lock().clone()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }

    async fn sleep(&self, duration: Duration) {
        self.slept.lock().push(duration);
        self.advance(duration);
    }
}
