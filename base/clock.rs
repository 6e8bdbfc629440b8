//! Clock abstraction, so every component that needs "now" can be driven
//! deterministically in tests (per the capability-interface design note:
//! components receive a `Clock` as a constructor dependency rather than
//! calling `jiff::Timestamp::now()` directly).

use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Abstract interface to wall-clock time and sleeping.
///
/// Real code uses [`SystemClock`]; tests use [`SimulatedClock`] so that
/// watermark advancement, backoff schedules, and retention age-out can be
/// exercised without waiting in real time.
pub trait Clock: Send + Sync + 'static {
    /// The current wall-clock time.
    fn now(&self) -> jiff::Timestamp;

    /// Sleeps (or, for a simulated clock, advances) for `dur`.
    fn sleep(&self, dur: Duration) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>;
}

#[derive(Copy, Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> jiff::Timestamp {
        jiff::Timestamp::now()
    }

    fn sleep(&self, dur: Duration) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
        Box::pin(tokio::time::sleep(dur))
    }
}

/// A clock that only advances when told to, for deterministic tests of
/// watermark/backoff/retention logic.
#[derive(Clone)]
pub struct SimulatedClock(Arc<Mutex<jiff::Timestamp>>);

impl SimulatedClock {
    pub fn new(start: jiff::Timestamp) -> Self {
        SimulatedClock(Arc::new(Mutex::new(start)))
    }

    /// Advances the clock by `dur` without actually sleeping.
    pub fn advance(&self, dur: Duration) {
        let mut t = self.0.lock().unwrap();
        *t = *t + jiff::SignedDuration::try_from(dur).expect("duration fits in i64 seconds");
    }
}

impl Clock for SimulatedClock {
    fn now(&self) -> jiff::Timestamp {
        *self.0.lock().unwrap()
    }

    fn sleep(&self, dur: Duration) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
        self.advance(dur);
        Box::pin(std::future::ready(()))
    }
}
