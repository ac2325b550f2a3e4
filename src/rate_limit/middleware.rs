use crate::context::LimitContext;
use crate::error::LimitError;
use crate::rate_limit::RateLimiter;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tower_layer::Layer;
use tower_service::Service;

/// Error returned by [`RateLimitService`].
#[derive(thiserror::Error, Debug)]
pub enum RateLimitedError<E> {
    /// The limiter denied or failed; the inner service was not called.
    #[error("{0}")]
    Limited(#[source] LimitError),
    /// The inner service failed.
    #[error("{0}")]
    Inner(#[source] E),
}

impl<E> RateLimitedError<E> {
    /// Wait reported by an exhausted limiter, for `Retry-After` style responses.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Limited(err) => err.retry_after(),
            Self::Inner(_) => None,
        }
    }

    /// Get the inner error if this is an Inner variant
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            Self::Limited(_) => None,
        }
    }
}

/// A layer that enforces rate limits using a [`RateLimiter`].
#[derive(Clone, Debug)]
pub struct RateLimitLayer<L> {
    limiter: Arc<L>,
    decision_timeout: Option<Duration>,
}

impl<L> RateLimitLayer<L> {
    /// Create a new rate limit layer.
    pub fn new(limiter: L) -> Self {
        Self::from_shared(Arc::new(limiter))
    }

    /// Create a layer over a limiter shared with other code.
    pub fn from_shared(limiter: Arc<L>) -> Self {
        Self { limiter, decision_timeout: None }
    }

    /// Bound how long a single admission decision (lock + backend I/O) may take.
    pub fn with_decision_timeout(mut self, timeout: Duration) -> Self {
        self.decision_timeout = Some(timeout);
        self
    }
}

impl<S, L> Layer<S> for RateLimitLayer<L>
where
    L: RateLimiter + 'static,
{
    type Service = RateLimitService<S, L>;

    fn layer(&self, service: S) -> Self::Service {
        RateLimitService {
            inner: service,
            limiter: self.limiter.clone(),
            decision_timeout: self.decision_timeout,
        }
    }
}

/// Middleware service that enforces rate limits.
#[derive(Clone, Debug)]
pub struct RateLimitService<S, L> {
    inner: S,
    limiter: Arc<L>,
    decision_timeout: Option<Duration>,
}

impl<S, L, Req> Service<Req> for RateLimitService<S, L>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Future: Send + 'static,
    L: RateLimiter + 'static,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = RateLimitedError<S::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(RateLimitedError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let limiter = self.limiter.clone();
        // Take the service that was driven to readiness and leave a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let ctx = match self.decision_timeout {
            Some(timeout) => LimitContext::with_timeout(timeout),
            None => LimitContext::background(),
        };

        Box::pin(async move {
            limiter.limit(&ctx).await.map_err(RateLimitedError::Limited)?;
            inner.call(req).await.map_err(RateLimitedError::Inner)
        })
    }
}
