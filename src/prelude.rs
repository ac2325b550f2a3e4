//! Convenient re-exports for common tollgate types.
pub use crate::{
    clock::{Clock, ManualClock, SystemClock},
    context::{CancelReason, LimitContext},
    error::LimitError,
    rate_limit::{
        BucketConfig, BucketState, InMemoryStateBackend, LocalLock, Lock, LockGuard, NoopLock,
        RateLimitLayer, RateLimiter, Snapshot, StateBackend, StoreError, TokenBucket,
    },
};
