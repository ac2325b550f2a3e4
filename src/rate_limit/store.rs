use crate::error::BoxError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

/// Persisted state of one bucket.
///
/// `last_refill` marks the last whole-token boundary in unix-epoch nanoseconds; the time elapsed
/// past it that has not yet produced a token is the residue carried into the next call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BucketState {
    /// Maximum tokens the bucket holds. Fixed when the state is first written.
    pub capacity: u64,
    /// Time to produce one token.
    #[cfg_attr(
        feature = "serde",
        serde(rename = "refill_period_nanos", with = "crate::rate_limit::duration_nanos")
    )]
    pub refill_period: Duration,
    /// Tokens usable right now.
    pub available: u64,
    /// Last whole-token boundary, nanoseconds since the unix epoch.
    #[cfg_attr(feature = "serde", serde(rename = "last_refill_nanos"))]
    pub last_refill: u64,
}

impl BucketState {
    /// Check the invariants a decoded state must satisfy before the bucket trusts it.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.capacity == 0 {
            return Err(StoreError::Corrupt("capacity is zero".into()));
        }
        if self.refill_period.is_zero() {
            return Err(StoreError::Corrupt("refill period is zero".into()));
        }
        if self.available > self.capacity {
            return Err(StoreError::Corrupt(format!(
                "available {} exceeds capacity {}",
                self.available, self.capacity
            )));
        }
        Ok(())
    }
}

/// A stored state together with the revision it was read at.
///
/// Revisions are opaque and increase with every write of a key; `0` means "absent".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub state: BucketState,
    pub revision: u64,
}

/// Errors from a state backend.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum StoreError {
    /// Transport or server failure; the stored state is unknown but unchanged by this call.
    #[error("backend unavailable: {0}")]
    Unavailable(#[source] BoxError),
    /// State could not be encoded or decoded.
    #[error("failed to encode or decode bucket state: {0}")]
    Serialization(String),
    /// State decoded but violates bucket invariants.
    #[error("stored bucket state is invalid: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Wrap a client error as [`StoreError::Unavailable`].
    pub fn unavailable(err: impl Into<BoxError>) -> Self {
        StoreError::Unavailable(err.into())
    }
}

/// Durable storage for bucket state, keyed by bucket identity.
///
/// Implementations must make each `set` all-or-nothing: either the state and its new TTL are
/// fully visible or the call reports failure.
#[async_trait]
pub trait StateBackend: Send + Sync {
    /// Fetch the live state for `identity`, or `None` if it was never written or has expired.
    async fn get(&self, identity: &str) -> Result<Option<Snapshot>, StoreError>;

    /// Store `state` for `identity`, refreshing its expiry to `ttl` from now.
    ///
    /// * `expected: None` writes unconditionally.
    /// * `expected: Some(rev)` writes only if the stored revision is still `rev` (`0` meaning the
    ///   key must still be absent).
    ///
    /// Returns `Ok(true)` if the write applied, `Ok(false)` if the revision check failed.
    async fn set(
        &self,
        identity: &str,
        state: &BucketState,
        ttl: Duration,
        expected: Option<u64>,
    ) -> Result<bool, StoreError>;
}

#[derive(Debug)]
struct Entry {
    state: BucketState,
    revision: u64,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    last_revision: u64,
}

/// Process-local state backend. Clones share the same storage.
///
/// Expired entries read as absent; [`purge_expired`](Self::purge_expired) reclaims their memory.
/// Everything is dropped with the last clone.
#[derive(Default, Clone, Debug)]
pub struct InMemoryStateBackend {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryStateBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self) -> MutexGuard<'_, Inner> {
        // The map is never left half-updated, so a poisoned lock is still consistent.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Drop every entry whose TTL has elapsed. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut guard = self.guard();
        let before = guard.entries.len();
        guard.entries.retain(|_, entry| entry.is_live(now));
        before - guard.entries.len()
    }

    /// Number of stored entries, expired or not.
    pub fn len(&self) -> usize {
        self.guard().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl StateBackend for InMemoryStateBackend {
    async fn get(&self, identity: &str) -> Result<Option<Snapshot>, StoreError> {
        let now = Instant::now();
        let guard = self.guard();
        Ok(guard
            .entries
            .get(identity)
            .filter(|entry| entry.is_live(now))
            .map(|entry| Snapshot { state: entry.state, revision: entry.revision }))
    }

    async fn set(
        &self,
        identity: &str,
        state: &BucketState,
        ttl: Duration,
        expected: Option<u64>,
    ) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut guard = self.guard();

        if let Some(expected) = expected {
            let current = guard
                .entries
                .get(identity)
                .filter(|entry| entry.is_live(now))
                .map_or(0, |entry| entry.revision);
            if current != expected {
                return Ok(false); // Race detected
            }
        }

        guard.last_revision += 1;
        let revision = guard.last_revision;
        let expires_at = now.checked_add(ttl).unwrap_or_else(|| now + Duration::from_secs(86_400 * 365));
        guard.entries.insert(identity.to_string(), Entry { state: *state, revision, expires_at });
        Ok(true)
    }
}
