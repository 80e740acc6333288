//! Configuration for the synchronization engine.

use std::time::Duration;

/// Configuration for the engine and its collaborators.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Cache TTL; also the freshness window for `load_settings`.
    pub cache_ttl: Duration,
    /// Maximum number of cache entries.
    pub cache_capacity: usize,
    /// Quiet period before a debounced remote flush.
    pub quiet_period: Duration,
    /// Retry behavior for remote saves.
    pub retry: RetryPolicy,
    /// Offline queue behavior.
    pub queue: QueueConfig,
    /// Timeout applied to every remote call.
    pub request_timeout: Duration,
    /// Maximum simultaneous in-flight remote requests.
    pub max_in_flight: u32,
    /// How long a rate-limited target stays blocked.
    pub rate_limit_cooldown: Duration,
    /// Interval of the durable-store polling fallback watcher.
    pub watch_interval: Duration,
}

impl EngineConfig {
    /// Creates a configuration with the default values.
    #[must_use]
    pub fn new() -> Self {
        Self {
            cache_ttl: Duration::from_secs(300),
            cache_capacity: 1024,
            quiet_period: Duration::from_millis(500),
            retry: RetryPolicy::default(),
            queue: QueueConfig::default(),
            request_timeout: Duration::from_secs(10),
            max_in_flight: 2,
            rate_limit_cooldown: Duration::from_secs(30),
            watch_interval: Duration::from_secs(2),
        }
    }

    /// Sets the cache TTL.
    #[must_use]
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Sets the cache capacity.
    #[must_use]
    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    /// Sets the debounce quiet period.
    #[must_use]
    pub fn with_quiet_period(mut self, quiet_period: Duration) -> Self {
        self.quiet_period = quiet_period;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the queue configuration.
    #[must_use]
    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    /// Sets the remote request timeout.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the in-flight remote request budget.
    #[must_use]
    pub fn with_max_in_flight(mut self, budget: u32) -> Self {
        self.max_in_flight = budget;
        self
    }

    /// Sets the rate-limit cooldown window.
    #[must_use]
    pub fn with_rate_limit_cooldown(mut self, cooldown: Duration) -> Self {
        self.rate_limit_cooldown = cooldown;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounded exponential backoff policy.
///
/// Delays are deterministic: `base * multiplier^(attempt-1)`, capped at
/// `max_delay`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first).
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Backoff multiplier.
    pub multiplier: f64,
    /// Cap on any single delay.
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Creates a policy with the given attempt limit.
    #[must_use]
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::from_millis(1000),
            multiplier: 2.0,
            max_delay: Duration::from_millis(10_000),
        }
    }

    /// Creates a policy that never retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            multiplier: 1.0,
            max_delay: Duration::ZERO,
        }
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Sets the multiplier.
    #[must_use]
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Sets the delay cap.
    #[must_use]
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Computes the delay before retrying after `attempt` (1-indexed)
    /// has failed.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let delay = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent as i32);
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Configuration for the offline/request queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum number of parked requests.
    pub capacity: usize,
    /// Interval between periodic drain ticks.
    pub drain_interval: Duration,
    /// Requests re-submitted per drain.
    pub drain_batch: usize,
}

impl QueueConfig {
    /// Sets the queue capacity.
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Sets the drain tick interval.
    #[must_use]
    pub fn with_drain_interval(mut self, interval: Duration) -> Self {
        self.drain_interval = interval;
        self
    }

    /// Sets the drain batch size.
    #[must_use]
    pub fn with_drain_batch(mut self, batch: usize) -> Self {
        self.drain_batch = batch;
        self
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 64,
            drain_interval: Duration::from_millis(100),
            drain_batch: 3,
        }
    }
}
