//! Rate limiting primitives.
//!
//! This module provides the building blocks for rate limiting:
//! - [`TokenBucket`]: the admission algorithm.
//! - [`StateBackend`]: where bucket state lives (in-memory here; etcd and redis in companion
//!   crates).
//! - [`Lock`]: serialises decisions per bucket identity (no-op, in-process, or distributed).
//! - [`RateLimitLayer`]: Tower middleware that enforces a [`RateLimiter`].
//!
//! # Architecture
//!
//! The pieces are independent and meet only through traits:
//! - **Middleware**: `RateLimitLayer` wraps your service. It doesn't know *how* limiting works,
//!   only that it should ask a `RateLimiter`.
//! - **Logic**: `TokenBucket` does the integer refill math and decides.
//! - **Storage**: `StateBackend` holds state keyed by identity, with TTL and revision checks.
//! - **Exclusion**: `Lock` guarantees one in-flight decision per identity.

use crate::context::LimitContext;
use crate::error::LimitError;
use async_trait::async_trait;

pub mod config;
pub mod lock;
pub mod middleware;
pub mod store;
pub mod token_bucket;

pub use config::{BucketConfig, BucketConfigBuilder, BucketConfigError, DEFAULT_STATE_TTL};
pub use lock::{Lock, LockError, LockGuard, LocalLock, NoopLock};
pub use middleware::{RateLimitLayer, RateLimitService, RateLimitedError};
pub use store::{BucketState, InMemoryStateBackend, Snapshot, StateBackend, StoreError};
pub use token_bucket::TokenBucket;

/// Core interface for admission decisions.
///
/// Decouples the middleware from the algorithm and from where its state lives.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Admit one request (`Ok`) or explain why not.
    async fn limit(&self, ctx: &LimitContext) -> Result<(), LimitError>;
}

#[async_trait]
impl<S, L> RateLimiter for TokenBucket<S, L>
where
    S: StateBackend + ?Sized,
    L: Lock + ?Sized,
{
    async fn limit(&self, ctx: &LimitContext) -> Result<(), LimitError> {
        TokenBucket::limit(self, ctx).await
    }
}

/// Serde helper storing a `Duration` as integer nanoseconds.
#[cfg(feature = "serde")]
pub(crate) mod duration_nanos {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(crate::clock::duration_to_nanos(*duration))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_nanos)
    }
}
