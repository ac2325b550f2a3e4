//! Clock abstractions used by the token bucket and by callers orchestrating retries.
//!
//! Time is expressed as unix-epoch nanoseconds so that bucket state written by one process can be
//! interpreted by another. Arithmetic stays in integers end to end.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;

/// Clock abstraction so timing can be faked in tests.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current time as nanoseconds since the unix epoch.
    fn now_nanos(&self) -> u64;

    /// Suspend for at least `duration`.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

/// Saturating conversion of a duration to whole nanoseconds.
pub(crate) fn duration_to_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

/// Wall clock backed by `SystemTime::now()`, sleeping on the tokio timer.
///
/// Processes sharing a bucket through a networked backend should keep their clocks in sync
/// (NTP); a reading behind the persisted refill mark is treated as no elapsed time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_nanos(&self) -> u64 {
        let since_epoch = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        duration_to_nanos(since_epoch)
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// 2023-11-14T22:13:20Z, an arbitrary non-zero starting point for virtual time.
const DEFAULT_ORIGIN_NANOS: u64 = 1_700_000_000_000_000_000;

/// Deterministic, manually advanced clock for tests.
///
/// `sleep` advances virtual time instead of waiting, so a test that "sleeps" for the wait a bucket
/// reported observes exactly that much elapsed time. Clones share the same timeline, and
/// concurrent advances from many tasks are all applied.
#[derive(Debug, Clone)]
pub struct ManualClock {
    inner: Arc<ManualInner>,
}

#[derive(Debug)]
struct ManualInner {
    origin: u64,
    now: watch::Sender<u64>,
}

impl ManualClock {
    /// Create a clock starting at a fixed instant.
    pub fn new() -> Self {
        Self::starting_at(DEFAULT_ORIGIN_NANOS)
    }

    /// Create a clock starting at `origin` nanoseconds since the epoch.
    pub fn starting_at(origin: u64) -> Self {
        let (now, _) = watch::channel(origin);
        Self { inner: Arc::new(ManualInner { origin, now }) }
    }

    /// Move virtual time forward by `duration` and wake every waiter whose deadline is reached.
    pub fn advance(&self, duration: Duration) {
        let delta = duration_to_nanos(duration);
        self.inner.now.send_modify(|now| *now = now.saturating_add(delta));
    }

    /// Jump to an absolute instant. Moving backwards is allowed so tests can model clock skew.
    pub fn set(&self, nanos: u64) {
        self.inner.now.send_replace(nanos);
    }

    /// Return to the instant the clock was created at.
    pub fn reset(&self) {
        self.set(self.inner.origin);
    }

    /// Resolve once virtual time reaches `deadline` (nanoseconds since the epoch).
    pub async fn wait_until(&self, deadline: u64) {
        let mut rx = self.inner.now.subscribe();
        // The sender lives as long as `self`, so the only error (sender dropped) cannot happen here.
        let _ = rx.wait_for(|now| *now >= deadline).await;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now_nanos(&self) -> u64 {
        *self.inner.now.borrow()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        self.advance(duration);
        Box::pin(async {})
    }
}
