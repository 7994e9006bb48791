use serde::{Deserialize, Serialize};
use shared::config::Config;
use shared::{Error, Result, TtlMs};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::Instant;

pub mod response {

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct PutResponse {
        /// false when an existing entry was overwritten
        pub created: bool,
        /// key removed to make room under the size bound
        pub evicted: Option<String>,
    }

    impl PutResponse {
        pub fn new(created: bool, evicted: Option<String>) -> Self {
            Self { created, evicted }
        }
    }

    #[derive(Clone, Debug, Default, PartialEq, Eq)]
    pub struct InvalidateResponse {
        pub invalidated: usize,
    }

    impl InvalidateResponse {
        pub fn new(invalidated: usize) -> Self {
            Self { invalidated }
        }

        pub fn merge(mut self, other: InvalidateResponse) -> Self {
            self.invalidated += other.invalidated;
            self
        }
    }
}

/// A cached value together with its bookkeeping.
#[derive(Clone, Debug)]
pub struct CacheEntry<V> {
    pub key: String,
    pub value: V,
    pub created_at: Instant,
    /// `None` means the entry never expires
    pub expires_at: Option<Instant>,
    pub ttl: TtlMs,
    pub group: Option<String>,
}

impl<V> CacheEntry<V> {
    pub fn new(key: impl Into<String>, value: V, ttl: TtlMs, group: Option<String>) -> Self {
        let now = Instant::now();
        Self {
            key: key.into(),
            value,
            created_at: now,
            expires_at: ttl.as_duration().map(|d| now + d),
            ttl,
            group,
        }
    }

    pub fn is_expired_at(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(expires_at) if now >= expires_at)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    /// Restart the expiry window from now (sliding expiration)
    pub fn touch(&mut self) {
        self.expires_at = self.ttl.as_duration().map(|d| Instant::now() + d);
    }

    /// `None` for entries that never expire
    pub fn remaining_ttl(&self) -> Option<Duration> {
        self.expires_at
            .map(|expires_at| expires_at.saturating_duration_since(Instant::now()))
    }
}

/// Where a cached operation keeps its results.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheScope {
    /// Private to one wrapped operation
    #[default]
    Memory,
    /// Shared by every wrapper using the same cache name on a registry
    Session,
    /// Session scope plus write-through to the registry's persistence backend
    Persistent,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheConfig {
    pub name: String,
    pub ttl: TtlMs,
    pub scope: CacheScope,
    pub group: Option<String>,
    pub sliding_expiration: bool,
    pub stale_while_revalidate: bool,
    pub max_cache_size: Option<usize>,
}

impl CacheConfig {
    pub fn new(name: impl Into<String>, ttl: TtlMs) -> Self {
        Self {
            name: name.into(),
            ttl,
            scope: CacheScope::Memory,
            group: None,
            sliding_expiration: false,
            stale_while_revalidate: false,
            max_cache_size: None,
        }
    }

    /// Defaults taken from the process configuration
    pub fn from_config(name: impl Into<String>, config: &Config) -> Self {
        Self {
            max_cache_size: config.max_cache_size,
            ..Self::new(name, TtlMs(config.default_ttl_ms))
        }
    }

    pub fn scope(mut self, scope: CacheScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn sliding_expiration(mut self, enabled: bool) -> Self {
        self.sliding_expiration = enabled;
        self
    }

    pub fn stale_while_revalidate(mut self, enabled: bool) -> Self {
        self.stale_while_revalidate = enabled;
        self
    }

    pub fn max_cache_size(mut self, max_entries: usize) -> Self {
        self.max_cache_size = Some(max_entries);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::configuration("cache name must not be empty"));
        }
        if self.max_cache_size == Some(0) {
            return Err(Error::configuration("max_cache_size must be greater than zero"));
        }
        if matches!(self.group.as_deref(), Some(g) if g.trim().is_empty()) {
            return Err(Error::configuration("cache group must not be empty"));
        }
        Ok(())
    }
}

/// Delay schedule between retry attempts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackoffStrategy {
    Immediate,
    FixedDelay,
    #[default]
    Exponential,
    Fibonacci,
    Random,
    Incremental,
}

impl BackoffStrategy {
    fn as_str(&self) -> &'static str {
        match self {
            BackoffStrategy::Immediate => "immediate",
            BackoffStrategy::FixedDelay => "fixed-delay",
            BackoffStrategy::Exponential => "exponential",
            BackoffStrategy::Fibonacci => "fibonacci",
            BackoffStrategy::Random => "random",
            BackoffStrategy::Incremental => "incremental",
        }
    }
}

impl fmt::Display for BackoffStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackoffStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "immediate" => Ok(BackoffStrategy::Immediate),
            "fixed-delay" | "fixed" => Ok(BackoffStrategy::FixedDelay),
            "exponential" => Ok(BackoffStrategy::Exponential),
            "fibonacci" => Ok(BackoffStrategy::Fibonacci),
            "random" => Ok(BackoffStrategy::Random),
            "incremental" | "linear" => Ok(BackoffStrategy::Incremental),
            other => Err(Error::Configuration(format!(
                "unknown backoff strategy '{}'",
                other
            ))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub strategy: BackoffStrategy,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub increment: Duration,
    pub retryable_error_codes: Vec<u16>,
}

impl RetryConfig {
    pub fn new(max_retries: u32, strategy: BackoffStrategy) -> Self {
        Self {
            max_retries,
            strategy,
            ..Self::default()
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            max_retries: config.retry_max_retries,
            strategy: BackoffStrategy::Exponential,
            initial_delay: Duration::from_millis(config.retry_initial_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
            increment: Duration::from_millis(config.retry_increment_ms),
            retryable_error_codes: config.retryable_status_codes.clone(),
        }
    }

    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn increment(mut self, increment: Duration) -> Self {
        self.increment = increment;
        self
    }

    pub fn retryable_error_codes(mut self, codes: impl Into<Vec<u16>>) -> Self {
        self.retryable_error_codes = codes.into();
        self
    }

    pub fn validate(&self) -> Result<()> {
        let bounded = !matches!(
            self.strategy,
            BackoffStrategy::Immediate | BackoffStrategy::FixedDelay
        );
        if bounded && self.max_delay < self.initial_delay {
            return Err(Error::Configuration(format!(
                "max_delay ({:?}) must not be below initial_delay ({:?}) for {} backoff",
                self.max_delay, self.initial_delay, self.strategy
            )));
        }
        Ok(())
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Why a polling loop ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Predicate,
    MaxAttempts,
    MaxDuration,
    Error,
    Cancelled,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            StopReason::Predicate => "predicate",
            StopReason::MaxAttempts => "max_attempts",
            StopReason::MaxDuration => "max_duration",
            StopReason::Error => "error",
            StopReason::Cancelled => "cancelled",
        };
        f.write_str(reason)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PollConfig {
    pub interval: Duration,
    pub max_attempts: Option<u32>,
    pub max_duration: Option<Duration>,
    pub continue_on_error: bool,
}

impl PollConfig {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            max_attempts: None,
            max_duration: None,
            continue_on_error: true,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(Duration::from_millis(config.poll_interval_ms))
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn max_duration(mut self, duration: Duration) -> Self {
        self.max_duration = Some(duration);
        self
    }

    pub fn continue_on_error(mut self, enabled: bool) -> Self {
        self.continue_on_error = enabled;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(Error::configuration("poll interval must be greater than zero"));
        }
        if self.max_attempts == Some(0) {
            return Err(Error::configuration("max_attempts must be greater than zero"));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatchConfig {
    pub batch_size: usize,
    pub concurrency: usize,
}

impl BatchConfig {
    pub fn new(batch_size: usize, concurrency: usize) -> Self {
        Self {
            batch_size,
            concurrency,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.batch_size, config.batch_concurrency)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::configuration("batch_size must be greater than zero"));
        }
        if self.concurrency == 0 {
            return Err(Error::configuration("concurrency must be greater than zero"));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoConfig {
    pub name: String,
    pub max_size: Option<usize>,
}

impl MemoConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_size: None,
        }
    }

    pub fn max_size(mut self, max_entries: usize) -> Self {
        self.max_size = Some(max_entries);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::configuration("memoizer name must not be empty"));
        }
        if self.max_size == Some(0) {
            return Err(Error::configuration("memoizer max_size must be greater than zero"));
        }
        Ok(())
    }
}
