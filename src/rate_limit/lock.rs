//! Mutual exclusion over a bucket identity for the span of one admission decision.

use crate::context::{CancelReason, LimitContext};
use crate::error::BoxError;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

/// Errors from lock acquisition.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum LockError {
    /// The context ended before ownership was obtained.
    #[error("{0}")]
    Cancelled(CancelReason),
    /// The coordination service failed.
    #[error("lock backend: {0}")]
    Backend(#[source] BoxError),
}

impl LockError {
    /// Wrap a client error as [`LockError::Backend`].
    pub fn backend(err: impl Into<BoxError>) -> Self {
        LockError::Backend(err.into())
    }
}

impl From<CancelReason> for LockError {
    fn from(reason: CancelReason) -> Self {
        LockError::Cancelled(reason)
    }
}

/// Exclusive ownership of a named resource.
#[async_trait]
pub trait Lock: Send + Sync {
    /// Wait (subject to `ctx`) until `identity` is owned exclusively, then return its guard.
    async fn acquire(&self, ctx: &LimitContext, identity: &str) -> Result<LockGuard, LockError>;
}

enum Release {
    /// Nothing to give back.
    Noop,
    /// Dropping the value gives ownership back.
    Held(Box<dyn Any + Send>),
    /// Awaiting the future gives ownership back.
    Remote(BoxFuture<'static, ()>),
}

/// Release handle returned by [`Lock::acquire`].
///
/// Release happens exactly once: through [`release`](LockGuard::release), or on drop (early
/// return, cancellation, panic). Dropping a guard whose release is asynchronous spawns the release
/// onto the current tokio runtime.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard {
    release: Option<Release>,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.release {
            None => "released",
            Some(Release::Noop) => "noop",
            Some(Release::Held(_)) => "held",
            Some(Release::Remote(_)) => "remote",
        };
        f.debug_struct("LockGuard").field("kind", &kind).finish()
    }
}

impl LockGuard {
    /// A guard with nothing to release.
    pub fn noop() -> Self {
        Self { release: Some(Release::Noop) }
    }

    /// A guard that releases by dropping `hold` (e.g. an owned mutex guard).
    pub fn held<T: Send + 'static>(hold: T) -> Self {
        Self { release: Some(Release::Held(Box::new(hold))) }
    }

    /// A guard that releases by running `release`. Failures inside it are the implementor's to log.
    pub fn remote<F>(release: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self { release: Some(Release::Remote(Box::pin(release))) }
    }

    /// Give ownership back and wait for the release to finish.
    pub async fn release(mut self) {
        match self.release.take() {
            Some(Release::Remote(fut)) => fut.await,
            Some(Release::Held(hold)) => drop(hold),
            Some(Release::Noop) | None => {}
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(Release::Remote(fut)) = self.release.take() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(fut);
                }
                Err(_) => tracing::warn!(
                    target: "tollgate::lock",
                    "lock guard dropped outside a tokio runtime; relying on lease expiry"
                ),
            }
        }
    }
}

/// Grants ownership immediately.
///
/// Correct only when nothing else mutates the same identity concurrently, e.g. one task per
/// bucket over a process-local backend.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLock;

#[async_trait]
impl Lock for NoopLock {
    async fn acquire(&self, ctx: &LimitContext, _identity: &str) -> Result<LockGuard, LockError> {
        ctx.check()?;
        Ok(LockGuard::noop())
    }
}

type Slots = Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>;

/// In-process lock: one async mutex per identity.
///
/// Serialises tasks of one process sharing a bucket identity; distinct identities never contend.
/// Clones share the same set of mutexes. Idle identities are forgotten once nobody holds or waits
/// on them.
#[derive(Debug, Default, Clone)]
pub struct LocalLock {
    slots: Slots,
}

impl LocalLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of identities currently held or awaited.
    pub fn active(&self) -> usize {
        lock_slots(&self.slots).len()
    }
}

fn lock_slots(slots: &Slots) -> std::sync::MutexGuard<'_, HashMap<String, Arc<tokio::sync::Mutex<()>>>> {
    slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn prune(slots: &Slots, identity: &str) {
    let mut map = lock_slots(slots);
    if map.get(identity).is_some_and(|slot| Arc::strong_count(slot) == 1) {
        map.remove(identity);
    }
}

struct LocalHold {
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
    slots: Slots,
    identity: String,
}

impl Drop for LocalHold {
    fn drop(&mut self) {
        drop(self.guard.take());
        prune(&self.slots, &self.identity);
    }
}

#[async_trait]
impl Lock for LocalLock {
    async fn acquire(&self, ctx: &LimitContext, identity: &str) -> Result<LockGuard, LockError> {
        let slot = lock_slots(&self.slots).entry(identity.to_string()).or_default().clone();

        match ctx.run(slot.lock_owned()).await {
            Ok(guard) => Ok(LockGuard::held(LocalHold {
                guard: Some(guard),
                slots: self.slots.clone(),
                identity: identity.to_string(),
            })),
            Err(reason) => {
                prune(&self.slots, identity);
                Err(LockError::Cancelled(reason))
            }
        }
    }
}
