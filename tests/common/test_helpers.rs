use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tollgate::{
    BucketConfig, BucketState, InMemoryStateBackend, LimitContext, Lock, LockError, LockGuard,
    ManualClock, Snapshot, StateBackend, StoreError, TokenBucket,
};

/// Bucket over a fresh in-memory store and the given lock, driven by `clock`.
pub fn memory_bucket<L: Lock + 'static>(
    capacity: u64,
    period: Duration,
    lock: L,
    clock: &ManualClock,
) -> (TokenBucket<InMemoryStateBackend, L>, Arc<InMemoryStateBackend>) {
    let store = Arc::new(InMemoryStateBackend::new());
    let bucket = TokenBucket::new(
        uuid_like(),
        BucketConfig::new(capacity, period).expect("valid config"),
        store.clone(),
        Arc::new(lock),
    )
    .with_clock(clock.clone());
    (bucket, store)
}

/// Unique-enough identity per test bucket.
pub fn uuid_like() -> String {
    static NEXT: AtomicUsize = AtomicUsize::new(0);
    format!("bucket-{}", NEXT.fetch_add(1, Ordering::SeqCst))
}

/// Store wrapper that stalls operations on the tokio timer first.
#[derive(Debug, Clone)]
pub struct SlowBackend<B> {
    pub inner: B,
    pub read_delay: Duration,
    pub write_delay: Duration,
    pub writes: Arc<AtomicUsize>,
}

impl<B> SlowBackend<B> {
    /// Every read and write stalls for `delay`.
    pub fn new(inner: B, delay: Duration) -> Self {
        Self { inner, read_delay: delay, write_delay: delay, writes: Arc::new(AtomicUsize::new(0)) }
    }

    /// Reads answer at once; writes stall for `delay`.
    pub fn slow_writes(inner: B, delay: Duration) -> Self {
        Self { read_delay: Duration::ZERO, ..Self::new(inner, delay) }
    }
}

async fn stall(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

#[async_trait]
impl<B: StateBackend> StateBackend for SlowBackend<B> {
    async fn get(&self, identity: &str) -> Result<Option<Snapshot>, StoreError> {
        stall(self.read_delay).await;
        self.inner.get(identity).await
    }

    async fn set(
        &self,
        identity: &str,
        state: &BucketState,
        ttl: Duration,
        expected: Option<u64>,
    ) -> Result<bool, StoreError> {
        stall(self.write_delay).await;
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.set(identity, state, ttl, expected).await
    }
}

/// Store wrapper whose operations can be switched to fail like an unreachable server.
#[derive(Debug, Clone, Default)]
pub struct FlakyBackend {
    pub inner: InMemoryStateBackend,
    pub fail_reads: Arc<AtomicBool>,
    pub fail_writes: Arc<AtomicBool>,
}

#[async_trait]
impl StateBackend for FlakyBackend {
    async fn get(&self, identity: &str) -> Result<Option<Snapshot>, StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable("connection refused"));
        }
        self.inner.get(identity).await
    }

    async fn set(
        &self,
        identity: &str,
        state: &BucketState,
        ttl: Duration,
        expected: Option<u64>,
    ) -> Result<bool, StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable("connection reset"));
        }
        self.inner.set(identity, state, ttl, expected).await
    }
}

/// Lock wrapper counting acquisitions and releases.
#[derive(Debug, Clone)]
pub struct CountingLock<L> {
    pub inner: L,
    pub acquired: Arc<AtomicUsize>,
    pub released: Arc<AtomicUsize>,
}

impl<L> CountingLock<L> {
    pub fn new(inner: L) -> Self {
        Self { inner, acquired: Arc::new(AtomicUsize::new(0)), released: Arc::new(AtomicUsize::new(0)) }
    }
}

struct CountedRelease {
    inner: Option<LockGuard>,
    released: Arc<AtomicUsize>,
}

impl Drop for CountedRelease {
    fn drop(&mut self) {
        drop(self.inner.take());
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl<L: Lock> Lock for CountingLock<L> {
    async fn acquire(&self, ctx: &LimitContext, identity: &str) -> Result<LockGuard, LockError> {
        let guard = self.inner.acquire(ctx, identity).await?;
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(LockGuard::held(CountedRelease { inner: Some(guard), released: self.released.clone() }))
    }
}
