//! Configuration module.
//!
//! Loads configuration from environment variables (and `.env`).

use std::env;
use std::time::Duration;

use anyhow::{Context, Result, bail};

use crate::cache::CacheConfig;
use crate::utils::parse_duration;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Tracing filter used when `RUST_LOG` is not set.
    pub log_filter: String,

    /// Registry and store settings.
    pub cache: CacheConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// | Variable                      | Meaning                       | Default  |
    /// |-------------------------------|-------------------------------|----------|
    /// | `COMPUTE_CACHE_PRESET`        | `heavy_reports`/`hot_lookups` | none     |
    /// | `COMPUTE_CACHE_CAPACITY`      | max stored results            | 10000    |
    /// | `COMPUTE_CACHE_TTL`           | result time-to-live, e.g. 1h  | none     |
    /// | `COMPUTE_CACHE_TTI`           | result time-to-idle           | none     |
    /// | `COMPUTE_CACHE_RUN_TIMEOUT`   | per-run timeout, e.g. 30s     | none     |
    /// | `COMPUTE_CACHE_MAX_RUNS`      | concurrent recomputations     | 16       |
    /// | `COMPUTE_CACHE_LOG`           | default log filter            | info     |
    ///
    /// # Errors
    /// Returns an error if a variable is set but malformed.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_vars(|key| env::var(key).ok())
    }

    /// Build configuration from an arbitrary variable lookup.
    pub fn from_vars<F>(var: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cache = match var("COMPUTE_CACHE_PRESET").as_deref().map(str::trim) {
            None | Some("") | Some("default") => CacheConfig::default(),
            Some("heavy_reports") => CacheConfig::heavy_reports(),
            Some("hot_lookups") => CacheConfig::hot_lookups(),
            Some(other) => bail!("Unknown COMPUTE_CACHE_PRESET: {other:?}"),
        };

        if let Some(raw) = var("COMPUTE_CACHE_CAPACITY") {
            cache.max_capacity = raw
                .trim()
                .parse()
                .with_context(|| format!("COMPUTE_CACHE_CAPACITY is not a number: {raw:?}"))?;
        }

        if let Some(ttl) = duration_var(&var, "COMPUTE_CACHE_TTL")? {
            cache = cache.ttl(ttl);
        }
        if let Some(tti) = duration_var(&var, "COMPUTE_CACHE_TTI")? {
            cache = cache.tti(tti);
        }
        if let Some(limit) = duration_var(&var, "COMPUTE_CACHE_RUN_TIMEOUT")? {
            cache = cache.run_timeout(limit);
        }

        if let Some(raw) = var("COMPUTE_CACHE_MAX_RUNS") {
            let limit: usize = raw
                .trim()
                .parse()
                .with_context(|| format!("COMPUTE_CACHE_MAX_RUNS is not a number: {raw:?}"))?;
            if limit == 0 {
                bail!("COMPUTE_CACHE_MAX_RUNS must be at least 1");
            }
            cache = cache.max_concurrent_runs(limit);
        }

        let log_filter = var("COMPUTE_CACHE_LOG")
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| "compute_cache=info".to_string());

        Ok(Self { log_filter, cache })
    }
}

fn duration_var<F>(var: &F, key: &str) -> Result<Option<Duration>>
where
    F: Fn(&str) -> Option<String>,
{
    match var(key) {
        None => Ok(None),
        Some(raw) => match parse_duration(&raw) {
            Some(duration) => Ok(Some(duration)),
            None => bail!("{key} must look like 30s, 10m, 1h or 1d, got {raw:?}"),
        },
    }
}
