use std::time::Duration;

/// How long an untouched bucket's state survives in a networked backend.
pub const DEFAULT_STATE_TTL: Duration = Duration::from_secs(60 * 60);

/// Validated construction-time configuration for a [`TokenBucket`](super::TokenBucket).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "RawBucketConfig", into = "RawBucketConfig"))]
pub struct BucketConfig {
    capacity: u64,
    refill_period: Duration,
    initial_available: u64,
    state_ttl: Duration,
}

/// Errors produced when validating bucket configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BucketConfigError {
    /// Capacity must be >= 1.
    ZeroCapacity,
    /// Refill period must be > 0.
    ZeroRefillPeriod,
    /// Initial tokens must not exceed capacity.
    InitialAboveCapacity {
        /// Value provided by caller.
        initial_available: u64,
        /// Configured capacity.
        capacity: u64,
    },
    /// State TTL must be > 0.
    ZeroStateTtl,
}

impl std::fmt::Display for BucketConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BucketConfigError::ZeroCapacity => write!(f, "capacity must be >= 1"),
            BucketConfigError::ZeroRefillPeriod => write!(f, "refill_period must be > 0"),
            BucketConfigError::InitialAboveCapacity { initial_available, capacity } => write!(
                f,
                "initial_available ({}) must not exceed capacity ({})",
                initial_available, capacity
            ),
            BucketConfigError::ZeroStateTtl => write!(f, "state_ttl must be > 0"),
        }
    }
}

impl std::error::Error for BucketConfigError {}

impl BucketConfig {
    /// A full bucket of `capacity` tokens producing one token per `refill_period`.
    ///
    /// # Examples
    /// ```
    /// use tollgate::BucketConfig;
    /// use std::time::Duration;
    /// let cfg = BucketConfig::new(10, Duration::from_millis(100)).unwrap();
    /// assert_eq!(cfg.initial_available(), 10);
    /// assert!(BucketConfig::new(0, Duration::from_secs(1)).is_err());
    /// ```
    pub fn new(capacity: u64, refill_period: Duration) -> Result<Self, BucketConfigError> {
        Self::builder(capacity, refill_period).build()
    }

    /// Start a builder for the optional settings.
    pub fn builder(capacity: u64, refill_period: Duration) -> BucketConfigBuilder {
        BucketConfigBuilder {
            capacity,
            refill_period,
            initial_available: None,
            state_ttl: DEFAULT_STATE_TTL,
        }
    }

    fn validate(&self) -> Result<(), BucketConfigError> {
        if self.capacity == 0 {
            return Err(BucketConfigError::ZeroCapacity);
        }
        if self.refill_period.is_zero() {
            return Err(BucketConfigError::ZeroRefillPeriod);
        }
        if self.initial_available > self.capacity {
            return Err(BucketConfigError::InitialAboveCapacity {
                initial_available: self.initial_available,
                capacity: self.capacity,
            });
        }
        if self.state_ttl.is_zero() {
            return Err(BucketConfigError::ZeroStateTtl);
        }
        Ok(())
    }

    /// Maximum tokens.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Time to produce one token.
    pub fn refill_period(&self) -> Duration {
        self.refill_period
    }

    /// Tokens a freshly seeded bucket starts with.
    pub fn initial_available(&self) -> u64 {
        self.initial_available
    }

    /// Expiry refreshed on every write of the bucket's state.
    pub fn state_ttl(&self) -> Duration {
        self.state_ttl
    }
}

/// Builder for [`BucketConfig`].
#[derive(Debug, Clone)]
pub struct BucketConfigBuilder {
    capacity: u64,
    refill_period: Duration,
    initial_available: Option<u64>,
    state_ttl: Duration,
}

impl BucketConfigBuilder {
    /// Tokens a freshly seeded bucket starts with (defaults to capacity).
    pub fn initial_available(mut self, tokens: u64) -> Self {
        self.initial_available = Some(tokens);
        self
    }

    /// Expiry for stored state (defaults to [`DEFAULT_STATE_TTL`]).
    pub fn state_ttl(mut self, ttl: Duration) -> Self {
        self.state_ttl = ttl;
        self
    }

    pub fn build(self) -> Result<BucketConfig, BucketConfigError> {
        let cfg = BucketConfig {
            capacity: self.capacity,
            refill_period: self.refill_period,
            initial_available: self.initial_available.unwrap_or(self.capacity),
            state_ttl: self.state_ttl,
        };
        cfg.validate()?;
        Ok(cfg)
    }
}

/// Unvalidated wire form of [`BucketConfig`]; durations are integer nanoseconds.
#[cfg(feature = "serde")]
#[derive(serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct RawBucketConfig {
    capacity: u64,
    refill_period_nanos: u64,
    #[serde(default)]
    initial_available: Option<u64>,
    #[serde(default)]
    state_ttl_nanos: Option<u64>,
}

#[cfg(feature = "serde")]
impl TryFrom<RawBucketConfig> for BucketConfig {
    type Error = BucketConfigError;

    fn try_from(raw: RawBucketConfig) -> Result<Self, Self::Error> {
        let mut builder = BucketConfig::builder(raw.capacity, Duration::from_nanos(raw.refill_period_nanos));
        if let Some(initial) = raw.initial_available {
            builder = builder.initial_available(initial);
        }
        if let Some(ttl) = raw.state_ttl_nanos {
            builder = builder.state_ttl(Duration::from_nanos(ttl));
        }
        builder.build()
    }
}

#[cfg(feature = "serde")]
impl From<BucketConfig> for RawBucketConfig {
    fn from(cfg: BucketConfig) -> Self {
        RawBucketConfig {
            capacity: cfg.capacity,
            refill_period_nanos: crate::clock::duration_to_nanos(cfg.refill_period),
            initial_available: Some(cfg.initial_available),
            state_ttl_nanos: Some(crate::clock::duration_to_nanos(cfg.state_ttl)),
        }
    }
}
