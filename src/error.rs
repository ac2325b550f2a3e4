//! Error types returned by admission calls
use crate::context::CancelReason;
use crate::rate_limit::lock::LockError;
use crate::rate_limit::store::StoreError;
use std::time::Duration;

/// Boxed error used to carry client failures (etcd, redis, ...) across trait boundaries.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Outcome of an admission call that did not admit the request.
///
/// [`LimitError::Exhausted`] is the expected, non-fatal denial; everything else means the decision
/// could not be made.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum LimitError {
    /// No token available. `wait` is how long until enough tokens accrue.
    #[error("rate limit exhausted; retry after {wait:?}")]
    Exhausted { wait: Duration },
    /// The caller's context ended before the decision completed. No state was changed.
    #[error("admission aborted: {0}")]
    Cancelled(CancelReason),
    /// The state backend failed.
    #[error("state backend: {0}")]
    Store(#[from] StoreError),
    /// The lock service failed.
    #[error("lock service: {0}")]
    Lock(#[source] BoxError),
    /// A conditional write found the state changed since it was read.
    #[error("bucket state changed concurrently; decision discarded")]
    RaceCondition,
    /// More tokens were requested than the bucket can ever hold.
    #[error("requested {requested} tokens but bucket capacity is {capacity}")]
    ExceedsCapacity { requested: u64, capacity: u64 },
}

impl From<LockError> for LimitError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Cancelled(reason) => LimitError::Cancelled(reason),
            LockError::Backend(source) => LimitError::Lock(source),
        }
    }
}

impl From<CancelReason> for LimitError {
    fn from(reason: CancelReason) -> Self {
        LimitError::Cancelled(reason)
    }
}

impl LimitError {
    /// Check if this is an ordinary "out of tokens" denial.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }
    /// Wait reported by an exhausted bucket, if this is an exhaustion.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Exhausted { wait } => Some(*wait),
            _ => None,
        }
    }
    /// Check if the caller's context ended the call.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
    /// Check if the state backend or lock service failed.
    pub fn is_backend(&self) -> bool {
        matches!(self, Self::Store(_) | Self::Lock(_))
    }
    /// Check if a conditional write lost a race.
    pub fn is_race_condition(&self) -> bool {
        matches!(self, Self::RaceCondition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn exhausted_display_includes_wait() {
        let err = LimitError::Exhausted { wait: Duration::from_millis(1500) };
        let msg = err.to_string();
        assert!(msg.contains("exhausted"));
        assert!(msg.contains("1.5s"));
        assert_eq!(err.retry_after(), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn predicates_cover_all_variants() {
        let exhausted = LimitError::Exhausted { wait: Duration::ZERO };
        assert!(exhausted.is_exhausted());
        assert!(!exhausted.is_backend());

        let cancelled = LimitError::from(CancelReason::DeadlineExceeded);
        assert!(cancelled.is_cancelled());
        assert!(cancelled.retry_after().is_none());

        let store = LimitError::from(StoreError::Corrupt("bad".into()));
        assert!(store.is_backend());

        let lock = LimitError::from(LockError::Backend("down".into()));
        assert!(lock.is_backend());
        assert!(lock.source().is_some());

        assert!(LimitError::RaceCondition.is_race_condition());
    }

    #[test]
    fn lock_cancellation_maps_to_cancelled() {
        let err = LimitError::from(LockError::Cancelled(CancelReason::Cancelled));
        assert!(err.is_cancelled());
        assert!(!err.is_backend());
        assert_eq!(err.to_string(), "admission aborted: context cancelled");
    }

    #[test]
    fn store_error_is_the_source() {
        let err = LimitError::from(StoreError::Serialization("truncated".into()));
        let source = err.source().expect("store error kept as source");
        assert!(source.to_string().contains("truncated"));
    }
}
