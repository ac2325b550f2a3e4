//! Token bucket admission control.
//!
//! Each call runs one read-modify-write of the bucket's state under the identity's lock:
//!
//! 1. read the state, seeding a new bucket on a miss;
//! 2. convert elapsed time into whole tokens, carrying the remainder (residue) forward by moving
//!    `last_refill` only to the last whole-token boundary;
//! 3. admit if enough tokens remain, otherwise report how long until they will;
//! 4. write the state back, denied or not, so refill bookkeeping is never lost.
//!
//! Nothing ticks in the background and nothing is cached between calls: every decision is a
//! function of the stored state and the clock, which keeps passive stores (etcd, redis) correct
//! across processes.

use crate::clock::{duration_to_nanos, Clock, SystemClock};
use crate::context::LimitContext;
use crate::error::LimitError;
use crate::rate_limit::config::BucketConfig;
use crate::rate_limit::lock::Lock;
use crate::rate_limit::store::{BucketState, StateBackend};
use std::sync::Arc;
use std::time::Duration;

/// Advance `state` to `now`, returning the residue in nanoseconds.
///
/// Less than one period since the mark leaves the state untouched, so partial time keeps
/// accruing even while the bucket is full. A refill that reaches capacity restarts accrual at
/// `now`. A `now` behind `last_refill` counts as no elapsed time and never moves the mark
/// backwards.
pub(crate) fn refill(state: &mut BucketState, now: u64) -> u64 {
    let period = duration_to_nanos(state.refill_period).max(1);
    let elapsed = now.saturating_sub(state.last_refill);
    let new_tokens = elapsed / period;
    let residue = elapsed % period;

    if new_tokens == 0 {
        return residue;
    }
    if state.available.saturating_add(new_tokens) >= state.capacity {
        state.available = state.capacity;
        state.last_refill = now;
        return 0;
    }
    state.available += new_tokens;
    state.last_refill = now - residue;
    residue
}

/// Time until `tokens` are available, given the refilled state and its residue.
fn wait_for(state: &BucketState, tokens: u64, residue: u64) -> Duration {
    let missing = u128::from(tokens.saturating_sub(state.available));
    let period = state.refill_period.as_nanos();
    let nanos = (missing * period).saturating_sub(u128::from(residue));
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}

/// A token bucket shared by every process that uses the same identity, store and lock.
///
/// # Example
/// ```
/// use std::sync::Arc;
/// use std::time::Duration;
/// use tollgate::{BucketConfig, InMemoryStateBackend, LimitContext, LocalLock, ManualClock, TokenBucket};
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let clock = ManualClock::new();
/// let bucket = TokenBucket::new(
///     "api",
///     BucketConfig::new(2, Duration::from_secs(1)).unwrap(),
///     Arc::new(InMemoryStateBackend::new()),
///     Arc::new(LocalLock::new()),
/// )
/// .with_clock(clock.clone());
///
/// let ctx = LimitContext::background();
/// assert!(bucket.limit(&ctx).await.is_ok());
/// assert!(bucket.limit(&ctx).await.is_ok());
/// let denied = bucket.limit(&ctx).await.unwrap_err();
/// assert_eq!(denied.retry_after(), Some(Duration::from_secs(1)));
///
/// clock.advance(Duration::from_secs(1));
/// assert!(bucket.limit(&ctx).await.is_ok());
/// # });
/// ```
pub struct TokenBucket<S: ?Sized, L: ?Sized> {
    identity: String,
    config: BucketConfig,
    store: Arc<S>,
    lock: Arc<L>,
    clock: Arc<dyn Clock>,
    race_check: bool,
}

impl<S: ?Sized, L: ?Sized> Clone for TokenBucket<S, L> {
    fn clone(&self) -> Self {
        Self {
            identity: self.identity.clone(),
            config: self.config,
            store: self.store.clone(),
            lock: self.lock.clone(),
            clock: self.clock.clone(),
            race_check: self.race_check,
        }
    }
}

impl<S: ?Sized, L: ?Sized> std::fmt::Debug for TokenBucket<S, L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucket")
            .field("identity", &self.identity)
            .field("config", &self.config)
            .field("clock", &self.clock)
            .field("race_check", &self.race_check)
            .field("store", &"<state backend>")
            .field("lock", &"<lock>")
            .finish()
    }
}

impl<S, L> TokenBucket<S, L>
where
    S: StateBackend + ?Sized,
    L: Lock + ?Sized,
{
    /// Create a bucket for `identity` over a shared store and lock, using the system clock.
    pub fn new(identity: impl Into<String>, config: BucketConfig, store: Arc<S>, lock: Arc<L>) -> Self {
        Self {
            identity: identity.into(),
            config,
            store,
            lock,
            clock: Arc::new(SystemClock),
            race_check: false,
        }
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Make every write conditional on the revision read in the same call.
    ///
    /// A write that loses returns [`LimitError::RaceCondition`] and admits nothing. Useful when the
    /// lock is a lease that can lapse during a slow decision.
    pub fn with_race_check(mut self, enabled: bool) -> Self {
        self.race_check = enabled;
        self
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn config(&self) -> &BucketConfig {
        &self.config
    }

    fn seed(&self, now: u64) -> BucketState {
        BucketState {
            capacity: self.config.capacity(),
            refill_period: self.config.refill_period(),
            available: self.config.initial_available(),
            last_refill: now,
        }
    }

    /// Admit one request, or report how long to wait.
    ///
    /// `Ok(())` means admitted with no wait. [`LimitError::Exhausted`] carries the wait; every
    /// other error means no decision was made.
    pub async fn limit(&self, ctx: &LimitContext) -> Result<(), LimitError> {
        self.take(ctx, 1).await
    }

    /// Admit a request costing `tokens`, all or nothing.
    pub async fn take(&self, ctx: &LimitContext, tokens: u64) -> Result<(), LimitError> {
        ctx.check()?;
        if tokens == 0 {
            return Ok(());
        }

        let guard = self.lock.acquire(ctx, &self.identity).await?;
        let result = self.decide(ctx, tokens).await;
        guard.release().await;
        result
    }

    async fn decide(&self, ctx: &LimitContext, tokens: u64) -> Result<(), LimitError> {
        let snapshot = ctx.run(self.store.get(&self.identity)).await??;
        let now = self.clock.now_nanos();

        let (mut state, revision) = match snapshot {
            Some(snapshot) => {
                snapshot.state.validate()?;
                (snapshot.state, snapshot.revision)
            }
            None => (self.seed(now), 0),
        };
        if tokens > state.capacity {
            return Err(LimitError::ExceedsCapacity { requested: tokens, capacity: state.capacity });
        }

        let residue = refill(&mut state, now);
        let outcome = if state.available >= tokens {
            state.available -= tokens;
            Ok(())
        } else {
            Err(LimitError::Exhausted { wait: wait_for(&state, tokens, residue) })
        };

        // The write is the commit. Backends apply it atomically, so a caller that goes away
        // mid-write leaves either the old state or the new one.
        ctx.run(self.commit(&state, revision)).await??;

        match &outcome {
            Ok(()) => tracing::debug!(
                target: "tollgate::bucket",
                identity = %self.identity,
                tokens,
                available = state.available,
                "admitted"
            ),
            Err(err) => tracing::debug!(
                target: "tollgate::bucket",
                identity = %self.identity,
                tokens,
                wait = ?err.retry_after(),
                "denied"
            ),
        }
        outcome
    }

    async fn commit(&self, state: &BucketState, revision: u64) -> Result<(), LimitError> {
        let expected = self.race_check.then_some(revision);
        let written = self.store.set(&self.identity, state, self.config.state_ttl(), expected).await?;
        if written {
            Ok(())
        } else {
            tracing::debug!(
                target: "tollgate::bucket",
                identity = %self.identity,
                revision,
                "conditional write lost a race"
            );
            Err(LimitError::RaceCondition)
        }
    }

    /// Wait for admission: retry [`limit`](Self::limit), sleeping on the bucket's clock for each
    /// reported wait, until admitted, `ctx` ends, or a non-exhaustion error occurs.
    pub async fn wait(&self, ctx: &LimitContext) -> Result<(), LimitError> {
        loop {
            match self.limit(ctx).await {
                Err(LimitError::Exhausted { wait }) => ctx.run(self.clock.sleep(wait)).await?,
                other => return other,
            }
        }
    }

    /// Overwrite the identity's state with a freshly seeded bucket.
    ///
    /// The only operation that may move the refill mark backwards.
    pub async fn reset(&self, ctx: &LimitContext) -> Result<(), LimitError> {
        ctx.check()?;
        let guard = self.lock.acquire(ctx, &self.identity).await?;
        let result = self.write_seed(ctx).await;
        guard.release().await;
        result
    }

    async fn write_seed(&self, ctx: &LimitContext) -> Result<(), LimitError> {
        let state = self.seed(self.clock.now_nanos());
        ctx.run(self.store.set(&self.identity, &state, self.config.state_ttl(), None)).await??;
        tracing::debug!(target: "tollgate::bucket", identity = %self.identity, "reset");
        Ok(())
    }

    /// Current state advanced to now, without consuming tokens or writing anything.
    ///
    /// An identity with no stored state reports the state it would be seeded with.
    pub async fn state(&self, ctx: &LimitContext) -> Result<BucketState, LimitError> {
        let snapshot = ctx.run(self.store.get(&self.identity)).await??;
        let now = self.clock.now_nanos();
        let mut state = match snapshot {
            Some(snapshot) => {
                snapshot.state.validate()?;
                snapshot.state
            }
            None => self.seed(now),
        };
        refill(&mut state, now);
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::rate_limit::lock::{LocalLock, NoopLock};
    use crate::rate_limit::store::{InMemoryStateBackend, Snapshot, StoreError};

    const SECOND: u64 = 1_000_000_000;

    fn state(capacity: u64, available: u64, last_refill: u64) -> BucketState {
        BucketState { capacity, refill_period: Duration::from_secs(1), available, last_refill }
    }

    fn bucket(capacity: u64, period: Duration, clock: &ManualClock) -> TokenBucket<InMemoryStateBackend, LocalLock> {
        TokenBucket::new(
            "test",
            BucketConfig::new(capacity, period).unwrap(),
            Arc::new(InMemoryStateBackend::new()),
            Arc::new(LocalLock::new()),
        )
        .with_clock(clock.clone())
    }

    #[test]
    fn refill_carries_residue() {
        let mut s = state(10, 0, 0);
        let residue = refill(&mut s, 2 * SECOND + 300);
        assert_eq!(s.available, 2);
        assert_eq!(residue, 300);
        assert_eq!(s.last_refill, 2 * SECOND);
    }

    #[test]
    fn refill_short_slices_accumulate() {
        let mut s = state(10, 0, 0);
        let mut now = 0;
        for _ in 0..4 {
            now += SECOND / 4;
            refill(&mut s, now);
        }
        assert_eq!(s.available, 1);
        assert_eq!(s.last_refill, SECOND);
    }

    #[test]
    fn refill_caps_at_capacity_and_restarts_accrual() {
        let mut s = state(3, 1, 0);
        let residue = refill(&mut s, 10 * SECOND + 5);
        assert_eq!(s.available, 3);
        assert_eq!(residue, 0);
        assert_eq!(s.last_refill, 10 * SECOND + 5);
    }

    #[test]
    fn full_bucket_keeps_partial_period() {
        let mut s = state(1, 1, 0);
        let residue = refill(&mut s, SECOND / 2);
        assert_eq!(s, state(1, 1, 0), "no whole token yet, nothing moves");
        assert_eq!(residue, SECOND / 2);
    }

    #[tokio::test]
    async fn spending_half_a_period_after_seeding_still_refills_on_schedule() {
        let clock = ManualClock::new();
        let bucket = bucket(1, Duration::from_secs(1), &clock);
        let ctx = LimitContext::background();

        bucket.reset(&ctx).await.unwrap();
        clock.advance(Duration::from_millis(500));
        bucket.limit(&ctx).await.unwrap();
        clock.advance(Duration::from_millis(500));
        // The full second since seeding produced the next token.
        bucket.limit(&ctx).await.unwrap();

        let err = bucket.limit(&ctx).await.unwrap_err();
        assert_eq!(err.retry_after(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn refill_ignores_clock_behind_mark() {
        let mut s = state(3, 1, 5 * SECOND);
        let residue = refill(&mut s, 4 * SECOND);
        assert_eq!(s, state(3, 1, 5 * SECOND));
        assert_eq!(residue, 0);

        let mut full = state(3, 3, 5 * SECOND);
        refill(&mut full, 4 * SECOND);
        assert_eq!(full.last_refill, 5 * SECOND, "mark never regresses");
    }

    #[test]
    fn wait_accounts_for_missing_tokens_and_residue() {
        let s = state(5, 1, 0);
        assert_eq!(wait_for(&s, 3, SECOND / 4), Duration::from_millis(1750));
        assert_eq!(wait_for(&state(5, 0, 0), 1, 0), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn admits_capacity_then_denies_with_full_period() {
        let clock = ManualClock::new();
        let bucket = bucket(2, Duration::from_secs(1), &clock);
        let ctx = LimitContext::background();

        bucket.limit(&ctx).await.unwrap();
        bucket.limit(&ctx).await.unwrap();
        let err = bucket.limit(&ctx).await.unwrap_err();
        assert!(err.is_exhausted());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(1)));

        clock.sleep(err.retry_after().unwrap()).await;
        bucket.limit(&ctx).await.unwrap();
    }

    #[tokio::test]
    async fn denial_wait_shrinks_with_elapsed_residue() {
        let clock = ManualClock::new();
        let bucket = bucket(1, Duration::from_secs(1), &clock);
        let ctx = LimitContext::background();

        bucket.limit(&ctx).await.unwrap();
        clock.advance(Duration::from_millis(300));
        let err = bucket.limit(&ctx).await.unwrap_err();
        assert_eq!(err.retry_after(), Some(Duration::from_millis(700)));
    }

    #[tokio::test]
    async fn take_is_all_or_nothing() {
        let clock = ManualClock::new();
        let bucket = bucket(5, Duration::from_millis(100), &clock);
        let ctx = LimitContext::background();

        bucket.take(&ctx, 4).await.unwrap();
        let err = bucket.take(&ctx, 3).await.unwrap_err();
        assert_eq!(err.retry_after(), Some(Duration::from_millis(200)));
        assert_eq!(bucket.state(&ctx).await.unwrap().available, 1, "denied take consumed nothing");

        let err = bucket.take(&ctx, 6).await.unwrap_err();
        assert!(matches!(err, LimitError::ExceedsCapacity { requested: 6, capacity: 5 }));

        bucket.take(&ctx, 0).await.unwrap();
        assert_eq!(bucket.state(&ctx).await.unwrap().available, 1);
    }

    #[tokio::test]
    async fn initial_available_seeds_new_buckets() {
        let clock = ManualClock::new();
        let bucket = TokenBucket::new(
            "empty-start",
            BucketConfig::builder(3, Duration::from_secs(2)).initial_available(0).build().unwrap(),
            Arc::new(InMemoryStateBackend::new()),
            Arc::new(NoopLock),
        )
        .with_clock(clock.clone());
        let ctx = LimitContext::background();

        let err = bucket.limit(&ctx).await.unwrap_err();
        assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));
        clock.advance(Duration::from_secs(2));
        bucket.limit(&ctx).await.unwrap();
    }

    #[tokio::test]
    async fn denied_call_still_persists_refill_bookkeeping() {
        let clock = ManualClock::starting_at(0);
        let store = Arc::new(InMemoryStateBackend::new());
        let bucket = TokenBucket::new(
            "bookkeeping",
            BucketConfig::builder(2, Duration::from_secs(1)).initial_available(0).build().unwrap(),
            store.clone(),
            Arc::new(NoopLock),
        )
        .with_clock(clock.clone());
        let ctx = LimitContext::background();

        assert!(bucket.limit(&ctx).await.unwrap_err().is_exhausted());
        clock.advance(Duration::from_millis(1500));
        bucket.limit(&ctx).await.unwrap();
        let err = bucket.limit(&ctx).await.unwrap_err();
        assert_eq!(err.retry_after(), Some(Duration::from_millis(500)));

        let stored = store.get("bookkeeping").await.unwrap().unwrap().state;
        assert_eq!(stored.available, 0);
        assert_eq!(stored.last_refill, SECOND);
    }

    #[tokio::test]
    async fn reset_refills_and_state_does_not_consume() {
        let clock = ManualClock::new();
        let bucket = bucket(3, Duration::from_secs(10), &clock);
        let ctx = LimitContext::background();

        for _ in 0..3 {
            bucket.limit(&ctx).await.unwrap();
        }
        assert_eq!(bucket.state(&ctx).await.unwrap().available, 0);
        assert_eq!(bucket.state(&ctx).await.unwrap().available, 0);

        bucket.reset(&ctx).await.unwrap();
        assert_eq!(bucket.state(&ctx).await.unwrap().available, 3);
        bucket.limit(&ctx).await.unwrap();
    }

    #[tokio::test]
    async fn wait_sleeps_on_the_clock_until_admitted() {
        let clock = ManualClock::new();
        let bucket = bucket(1, Duration::from_millis(250), &clock);
        let ctx = LimitContext::background();
        let start = clock.now_nanos();

        bucket.wait(&ctx).await.unwrap();
        bucket.wait(&ctx).await.unwrap();
        bucket.wait(&ctx).await.unwrap();
        assert_eq!(clock.now_nanos() - start, 500_000_000);
    }

    #[tokio::test]
    async fn race_check_discards_decision_on_conflict() {
        let clock = ManualClock::new();
        let store = Arc::new(InMemoryStateBackend::new());
        let bucket = TokenBucket::new(
            "raced",
            BucketConfig::new(5, Duration::from_secs(1)).unwrap(),
            store.clone(),
            Arc::new(NoopLock),
        )
        .with_clock(clock.clone())
        .with_race_check(true);
        let ctx = LimitContext::background();

        bucket.limit(&ctx).await.unwrap();
        // Conflicting writers are simulated by a store that always reports a lost race.
        #[derive(Debug)]
        struct AlwaysConflict(Arc<InMemoryStateBackend>);
        #[async_trait::async_trait]
        impl StateBackend for AlwaysConflict {
            async fn get(&self, identity: &str) -> Result<Option<Snapshot>, StoreError> {
                self.0.get(identity).await
            }
            async fn set(
                &self,
                _identity: &str,
                _state: &BucketState,
                _ttl: Duration,
                expected: Option<u64>,
            ) -> Result<bool, StoreError> {
                Ok(expected.is_none())
            }
        }
        let conflicted = TokenBucket::new(
            "raced",
            BucketConfig::new(5, Duration::from_secs(1)).unwrap(),
            Arc::new(AlwaysConflict(store.clone())),
            Arc::new(NoopLock),
        )
        .with_clock(clock.clone())
        .with_race_check(true);

        let err = conflicted.limit(&ctx).await.unwrap_err();
        assert!(err.is_race_condition());
        assert_eq!(store.get("raced").await.unwrap().unwrap().state.available, 4);
    }

    #[tokio::test]
    async fn corrupt_state_is_reported_not_trusted() {
        let clock = ManualClock::new();
        let store = Arc::new(InMemoryStateBackend::new());
        store
            .set("bad", &state(2, 9, 0), Duration::from_secs(60), None)
            .await
            .unwrap();
        let bucket = TokenBucket::new(
            "bad",
            BucketConfig::new(2, Duration::from_secs(1)).unwrap(),
            store,
            Arc::new(NoopLock),
        )
        .with_clock(clock);

        let err = bucket.limit(&LimitContext::background()).await.unwrap_err();
        assert!(err.is_backend());
    }

    #[derive(Clone)]
    struct SharedWriter(Arc<std::sync::Mutex<Vec<u8>>>);

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SharedWriter {
        type Writer = SharedGuard;
        fn make_writer(&'a self) -> Self::Writer {
            SharedGuard(self.0.clone())
        }
    }

    struct SharedGuard(Arc<std::sync::Mutex<Vec<u8>>>);
    impl std::io::Write for SharedGuard {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn decisions_are_logged_under_bucket_target() {
        let buffer = Arc::new(std::sync::Mutex::new(Vec::new()));
        let subscriber = tracing_subscriber::fmt()
            .with_writer(tracing_subscriber::fmt::writer::BoxMakeWriter::new(SharedWriter(
                buffer.clone(),
            )))
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_target(true)
            .without_time()
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let clock = ManualClock::new();
        let bucket = bucket(1, Duration::from_secs(1), &clock);
        let ctx = LimitContext::background();
        bucket.limit(&ctx).await.unwrap();
        bucket.limit(&ctx).await.unwrap_err();

        let logs = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
        assert!(logs.contains("tollgate::bucket"), "events carry the bucket target: {logs}");
        assert!(logs.contains("admitted"), "admission is logged: {logs}");
        assert!(logs.contains("denied"), "denial is logged: {logs}");
        assert!(logs.contains("identity=test"), "identity is recorded: {logs}");
    }
}
