//! Resilience utilities: backoff with jitter and rate limiting.
//!
//! - [`RetryConfig`]: Exponential backoff for transient failures. Used by the
//!   change consumer between reconnects and by the Redis connector.
//! - [`RateLimiter`]: Token bucket capping events/sec on a single stream.
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() {
//! use directory_replicator::resilience::{RateLimiter, RateLimitConfig, RetryConfig};
//!
//! let retry = RetryConfig::default();
//! let delay = retry.delay_with_jitter(3); // ~400ms +/- 20%
//!
//! let limiter = RateLimiter::new(RateLimitConfig::default());
//! limiter.acquire().await; // Blocks if over limit
//! # let _ = delay;
//! # }
//! ```

use governor::{
    clock::DefaultClock, middleware::NoOpMiddleware, state::{InMemoryState, NotKeyed}, Quota,
    RateLimiter as GovLimiter,
};
use rand::Rng;
use std::num::NonZeroU32;
use std::time::Duration;

/// Configuration for retry/backoff behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts for bounded retries (connection setup).
    /// `usize::MAX` retries forever. Stream reconnects ignore this.
    pub max_attempts: usize,

    /// Initial delay before first retry.
    pub initial_delay: Duration,

    /// Maximum delay between retries (ceiling for exponential backoff).
    pub max_delay: Duration,

    /// Backoff multiplier (e.g., 2.0 = double delay each retry).
    pub backoff_factor: f64,

    /// Random spread applied to each delay, as a fraction (0.2 = +/-20%).
    pub jitter_factor: f64,

    /// Timeout for each individual connection attempt.
    pub connection_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            jitter_factor: 0.2,
            connection_timeout: Duration::from_secs(5),
        }
    }
}

impl RetryConfig {
    /// Infinite retry for long-running streams.
    ///
    /// # Backoff Schedule
    ///
    /// ```text
    /// Attempt  Delay (before jitter)
    /// -------  ---------------------
    /// 1        1s
    /// 2        2s
    /// 3        4s
    /// ...
    /// 9+       300s (cap)
    /// ```
    pub fn daemon() -> Self {
        Self {
            max_attempts: usize::MAX,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            backoff_factor: 2.0,
            jitter_factor: 0.2,
            connection_timeout: Duration::from_secs(30),
        }
    }

    /// Fast-fail retry for tests. No jitter, so delays are exact.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
            jitter_factor: 0.0,
            connection_timeout: Duration::from_millis(500),
        }
    }

    /// Calculate delay for a given attempt number (1-indexed), without jitter.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        let exponent = (attempt - 1).min(i32::MAX as usize) as i32;
        let multiplier = self.backoff_factor.powi(exponent);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }

        Duration::from_secs_f64(delay_secs)
    }

    /// Delay for `attempt` with random jitter applied, still capped at `max_delay`.
    pub fn delay_with_jitter(&self, attempt: usize) -> Duration {
        let base = self.delay_for_attempt(attempt);
        let jitter = self.jitter_factor.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return base;
        }

        let spread = rand::thread_rng().gen_range(-jitter..=jitter);
        let secs = (base.as_secs_f64() * (1.0 + spread)).max(0.0);
        std::cmp::min(Duration::from_secs_f64(secs), self.max_delay)
    }
}

// =============================================================================
// Rate Limiting
// =============================================================================

/// Configuration for rate limiting.
///
/// Uses a token bucket algorithm: tokens refill at `refill_rate` per second,
/// up to `burst_size` tokens. Each event consumes one token.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum tokens that can be accumulated (burst capacity).
    pub burst_size: u32,

    /// Tokens added per second (sustained rate).
    pub refill_rate: u32,
}

impl Default for RateLimitConfig {
    /// Default: 1000 events/sec with burst of 100.
    fn default() -> Self {
        Self {
            burst_size: 100,
            refill_rate: 1000,
        }
    }
}

/// Token bucket rate limiter.
pub struct RateLimiter {
    limiter: GovLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>,
    config: RateLimitConfig,
}

impl RateLimiter {
    /// Create a new rate limiter with the given configuration.
    pub fn new(config: RateLimitConfig) -> Self {
        let quota = Quota::per_second(NonZeroU32::new(config.refill_rate).unwrap_or(NonZeroU32::MIN))
            .allow_burst(NonZeroU32::new(config.burst_size).unwrap_or(NonZeroU32::MIN));

        Self {
            limiter: GovLimiter::direct(quota),
            config,
        }
    }

    /// Acquire a permit, blocking until one is available.
    ///
    /// This method is cancel-safe.
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }

    /// Try to acquire a permit without blocking.
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }
}
