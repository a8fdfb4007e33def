//! Compute Cache demo.
//!
//! Caches per-author word counts over an in-memory article table and shows
//! a miss, a hit, single-flight callers, and a refresh triggered by a write.

mod demo;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::info;
use tracing_subscriber::EnvFilter;

use compute_cache::{CacheRegistry, ChangeBus, Config, MokaStore, Parameters};
use demo::{Article, ArticleTable, AuthorWordCount};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration (reads .env first)
    let config = Config::from_env()?;

    // If RUST_LOG is not set, fall back to the configured filter
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .init();

    info!("Starting compute-cache demo...");
    info!("Cache config: {:?}", config.cache);

    // Initialize notifier, store and registry
    let bus = ChangeBus::new();
    let store = MokaStore::new(&config.cache);
    let registry = CacheRegistry::new(store, bus.clone(), config.cache.clone());

    let table = Arc::new(ArticleTable::seeded(bus.clone()));
    let word_count = registry.memoize(AuthorWordCount::new(Arc::clone(&table)));
    let ana = Parameters::new().arg("ana").named("min_words", 3);

    // Cold call computes, warm call reads the store
    let started = Instant::now();
    let counts = word_count.get(ana.clone()).await?;
    info!("ana (cold): {:?} in {:?}", counts, started.elapsed());

    let started = Instant::now();
    let counts = word_count.get(ana.clone()).await?;
    info!("ana (warm): {:?} in {:?}", counts, started.elapsed());

    // Concurrent callers share one recomputation
    let bruno = Parameters::new().arg("bruno");
    let callers: Vec<_> = (0..8)
        .map(|_| {
            let word_count = word_count.clone();
            let bruno = bruno.clone();
            tokio::spawn(async move { word_count.get(bruno).await })
        })
        .collect();
    for caller in callers {
        caller.await??;
    }
    let runs = word_count.cache(bruno.clone())?.stats().runs;
    info!("bruno: 8 callers, {} run(s)", runs);

    // A write bumps the revision and refreshes subscribed caches in the background
    table.insert(Article {
        author: "ana".into(),
        body: "refresh ahead means readers rarely wait".into(),
    });
    info!("Inserted article, revision now {}", table.revision());

    while word_count.cache(ana.clone())?.is_recomputing() {
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    let started = Instant::now();
    let counts = word_count.get(ana.clone()).await?;
    info!("ana (after write): {:?} in {:?}", counts, started.elapsed());

    table.delete_by("bruno");
    let counts = word_count.get(bruno).await?;
    info!("bruno (after delete): {:?}", counts);

    let stats = registry.stats();
    info!(
        "Stats: {} hit(s), {} miss(es), {} run(s), hit rate {:.0}%",
        stats.hits,
        stats.misses,
        stats.runs,
        stats.hit_rate() * 100.0
    );

    registry.shutdown();

    Ok(())
}
