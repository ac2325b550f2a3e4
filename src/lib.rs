#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # tollgate
//!
//! Token-bucket admission control that stays exact when many tasks, or many processes, share one
//! bucket.
//!
//! ## Features
//!
//! - **Integer refill math** with the fractional remainder carried between calls, so no elapsed
//!   time is ever lost
//! - **Pluggable state** through [`StateBackend`] (in-memory here; etcd and redis in the
//!   `tollgate-etcd` and `tollgate-redis` crates)
//! - **Pluggable mutual exclusion** through [`Lock`] with guaranteed release
//! - **Deterministic time** through [`Clock`] and [`ManualClock`]
//! - **Cancellation** of every call through [`LimitContext`]
//! - **Tower middleware** via [`RateLimitLayer`]
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tollgate::{BucketConfig, InMemoryStateBackend, LimitContext, LocalLock, TokenBucket};
//!
//! #[tokio::main]
//! async fn main() {
//!     let bucket = TokenBucket::new(
//!         "user:42",
//!         BucketConfig::new(10, Duration::from_millis(100)).unwrap(),
//!         Arc::new(InMemoryStateBackend::new()),
//!         Arc::new(LocalLock::new()),
//!     );
//!
//!     match bucket.limit(&LimitContext::with_timeout(Duration::from_secs(1))).await {
//!         Ok(()) => { /* proceed */ }
//!         Err(e) if e.is_exhausted() => { let _retry_in = e.retry_after(); }
//!         Err(e) => panic!("limiter unavailable: {e}"),
//!     }
//! }
//! ```

pub mod clock;
pub mod context;
pub mod error;
pub mod prelude;
pub mod rate_limit;

// Re-exports
pub use clock::{Clock, ManualClock, SystemClock};
pub use context::{CancelReason, LimitContext};
pub use error::{BoxError, LimitError};
pub use rate_limit::{
    BucketConfig, BucketConfigBuilder, BucketConfigError, BucketState, InMemoryStateBackend,
    LocalLock, Lock, LockError, LockGuard, NoopLock, RateLimitLayer, RateLimitService,
    RateLimitedError, RateLimiter, Snapshot, StateBackend, StoreError, TokenBucket,
};
