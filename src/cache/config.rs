//! Cache configuration.

use std::time::Duration;

/// Configuration for a cache registry and its backing store.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of stored results in the store.
    pub max_capacity: u64,

    /// Time-to-live for stored results.
    /// `None` keeps results until evicted by capacity.
    pub ttl: Option<Duration>,

    /// Time-to-idle for stored results.
    pub tti: Option<Duration>,

    /// Upper bound on a single `run`.
    /// `None` lets recomputations run to completion.
    pub run_timeout: Option<Duration>,

    /// Maximum number of recomputations executing at the same time.
    pub max_concurrent_runs: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_capacity: 10_000,
            ttl: None,
            tti: None,
            run_timeout: None,
            max_concurrent_runs: 16,
        }
    }
}

impl CacheConfig {
    /// Create a new cache config with the given max capacity.
    pub fn with_capacity(max_capacity: u64) -> Self {
        Self {
            max_capacity,
            ..Default::default()
        }
    }

    /// Set max capacity for the store (builder pattern).
    #[must_use]
    pub fn max_capacity(mut self, max_capacity: u64) -> Self {
        self.max_capacity = max_capacity;
        self
    }

    /// Set time-to-live for stored results.
    #[must_use]
    pub fn ttl(mut self, duration: Duration) -> Self {
        self.ttl = Some(duration);
        self
    }

    /// Set time-to-idle for stored results.
    #[must_use]
    pub fn tti(mut self, duration: Duration) -> Self {
        self.tti = Some(duration);
        self
    }

    /// Abort recomputations that take longer than `duration`.
    #[must_use]
    pub fn run_timeout(mut self, duration: Duration) -> Self {
        self.run_timeout = Some(duration);
        self
    }

    /// Limit how many recomputations may run concurrently.
    ///
    /// Values below 1 are raised to 1.
    #[must_use]
    pub fn max_concurrent_runs(mut self, limit: usize) -> Self {
        self.max_concurrent_runs = limit.max(1);
        self
    }

    /// Create config for a small number of heavy reports.
    /// Low capacity, few concurrent runs, generous timeout.
    pub fn heavy_reports() -> Self {
        Self {
            max_capacity: 1_000,
            ttl: None,
            tti: None,
            run_timeout: Some(Duration::from_secs(300)), // 5 minutes
            max_concurrent_runs: 4,
        }
    }

    /// Create config for many cheap, frequently invalidated lookups.
    /// High capacity, idle eviction so stale versions go away quickly.
    pub fn hot_lookups() -> Self {
        Self {
            max_capacity: 50_000,
            ttl: None,
            tti: Some(Duration::from_secs(600)), // 10 minutes idle
            run_timeout: Some(Duration::from_secs(10)),
            max_concurrent_runs: 64,
        }
    }
}
