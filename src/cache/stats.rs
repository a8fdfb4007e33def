//! Cache usage statistics.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};

/// Statistics about one computation cache, or several merged together.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    /// Lookups answered from the store.
    pub hits: u64,
    /// Lookups that found nothing stored for the current version.
    pub misses: u64,
    /// Recomputations started.
    pub runs: u64,
    /// Recomputations that failed or timed out.
    pub failures: u64,
    /// Caches currently recomputing.
    pub recomputing: u64,
    /// When a recomputation last stored a result.
    pub last_refreshed: Option<DateTime<Utc>>,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Fold `other` into `self`.
    pub fn merge(&mut self, other: &CacheStats) {
        self.hits += other.hits;
        self.misses += other.misses;
        self.runs += other.runs;
        self.failures += other.failures;
        self.recomputing += other.recomputing;
        self.last_refreshed = self.last_refreshed.max(other.last_refreshed);
    }
}

/// Live counters owned by a computation cache.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub runs: AtomicU64,
    pub failures: AtomicU64,
}

impl Counters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            runs: self.runs.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            ..Default::default()
        }
    }
}
