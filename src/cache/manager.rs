//! Per-query cache manager.
//!
//! A [`ComputationCache`] owns one (computation, parameters) pair. It answers
//! lookups from the store, runs at most one recomputation at a time, and
//! refreshes itself when a subscribed source changes.
//!
//! ## State
//!
//! The manager is either idle or recomputing. Recomputing means an in-flight
//! [`Flight`] is installed: a shared future over the spawned recomputation
//! task. Late callers clone the same flight instead of starting their own.
//! The recomputation task clears the flight when it ends, whether it stored
//! a result, failed, timed out, or panicked.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use super::computation::{Computation, Mode, Version};
use super::error::{CacheError, CacheResult};
use super::stats::{CacheStats, Counters};
use super::store::VersionedStore;
use super::Identity;
use crate::events::{ChangeNotifier, Source, SubscriptionId};

/// In-flight recomputation shared by every caller waiting on it.
type Flight<T> = Shared<BoxFuture<'static, CacheResult<Arc<T>>>>;

/// Collaborators shared by every manager of one registry.
pub(crate) struct CacheContext {
    pub store: Arc<dyn VersionedStore>,
    pub notifier: Arc<dyn ChangeNotifier>,
    pub runtime: Handle,
    pub permits: Arc<Semaphore>,
    pub run_timeout: Option<Duration>,
}

struct InFlight<T> {
    id: u64,
    version: Version,
    flight: Flight<T>,
}

struct State<T> {
    in_flight: Option<InFlight<T>>,
    next_flight: u64,
    /// Number of flights that have ended.
    settled: u64,
    last_refreshed: Option<DateTime<Utc>>,
}

enum Lookup<T> {
    Hit(T),
    Wait(Version, Flight<T>),
}

/// Cache manager for one computation called with one set of parameters.
pub struct ComputationCache<C: Computation> {
    identity: Identity,
    params: C::Params,
    computation: Arc<C>,
    ctx: Arc<CacheContext>,
    state: Mutex<State<C::Output>>,
    subscriptions: Mutex<Vec<(Source, SubscriptionId)>>,
    counters: Counters,
}

impl<C: Computation> ComputationCache<C> {
    /// Create a manager and subscribe it to the computation's sources.
    pub(crate) fn new(
        identity: Identity,
        computation: Arc<C>,
        params: C::Params,
        ctx: Arc<CacheContext>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let subscriptions = computation
                .invalidation_sources(&params)
                .into_iter()
                .map(|source| {
                    let weak = weak.clone();
                    let id = ctx.notifier.subscribe(
                        &source,
                        Arc::new(move || {
                            if let Some(cache) = weak.upgrade() {
                                cache.on_external_change();
                            }
                        }),
                    );
                    (source, id)
                })
                .collect::<Vec<_>>();

            debug!(
                "Created {} cache {:?} for {:?} ({} source(s))",
                C::KIND,
                identity,
                params,
                subscriptions.len()
            );

            Self {
                identity,
                params,
                computation,
                ctx,
                state: Mutex::new(State {
                    in_flight: None,
                    next_flight: 0,
                    settled: 0,
                    last_refreshed: None,
                }),
                subscriptions: Mutex::new(subscriptions),
                counters: Counters::default(),
            }
        })
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }

    pub fn params(&self) -> &C::Params {
        &self.params
    }

    /// Whether a recomputation is in flight.
    pub fn is_recomputing(&self) -> bool {
        self.state.lock().in_flight.is_some()
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            recomputing: u64::from(state.in_flight.is_some()),
            last_refreshed: state.last_refreshed,
            ..self.counters.snapshot()
        }
    }

    /// Get the stored result for the current version, or recompute it.
    ///
    /// With [`Mode::Blocking`] this waits for the result, joining a
    /// recomputation already in flight instead of starting another.
    /// With [`Mode::Background`] it returns `Ok(None)` whenever no stored
    /// result is available, after making sure a recomputation is running.
    ///
    /// # Errors
    /// Blocking callers receive the failure of the recomputation they waited
    /// on. Store and serialization failures are returned in both modes.
    pub async fn get_or_run(self: &Arc<Self>, mode: Mode) -> CacheResult<Option<C::Output>> {
        match mode {
            Mode::Blocking => self.get().await.map(Some),
            Mode::Background => match self.lookup()? {
                Lookup::Hit(value) => Ok(Some(value)),
                Lookup::Wait(..) => Ok(None),
            },
        }
    }

    /// Blocking lookup: the stored result, or the one produced by the
    /// recomputation this call starts or joins.
    ///
    /// A joined recomputation only answers the call if its version is still
    /// current when it finishes. Otherwise the lookup starts over at the new
    /// version.
    pub async fn get(self: &Arc<Self>) -> CacheResult<C::Output> {
        loop {
            let (version, flight) = match self.lookup()? {
                Lookup::Hit(value) => return Ok(value),
                Lookup::Wait(version, flight) => (version, flight),
            };

            let value = flight.await?;
            let current = self.computation.version(&self.params);
            if version == current {
                return Ok((*value).clone());
            }

            debug!(
                "{} cache {:?} finished at {} but version is now {}, looking up again",
                C::KIND,
                self.identity,
                version,
                current
            );
        }
    }

    /// Invalidation callback: refresh in the background without blocking
    /// the notifying caller.
    pub fn on_external_change(self: &Arc<Self>) {
        debug!("{} cache {:?} notified of change", C::KIND, self.identity);
        if let Err(err) = self.lookup() {
            warn!(
                "Background refresh of {} cache {:?} failed: {}",
                C::KIND,
                self.identity,
                err
            );
        }
    }

    /// Drop every subscription held by this manager.
    pub(crate) fn detach(&self) {
        let subscriptions = std::mem::take(&mut *self.subscriptions.lock());
        for (source, id) in subscriptions {
            self.ctx.notifier.unsubscribe(&source, id);
        }
    }

    /// Decide between a stored hit and waiting on a recomputation.
    ///
    /// The store is read without holding the state lock. A new flight is only
    /// installed if no flight started or ended during that read; otherwise
    /// the decision is taken again.
    fn lookup(self: &Arc<Self>) -> CacheResult<Lookup<C::Output>> {
        let version = self.computation.version(&self.params);

        loop {
            let settled = {
                let state = self.state.lock();
                if let Some(running) = &state.in_flight {
                    debug!(
                        "{} cache {:?} joining in-flight run at {}",
                        C::KIND,
                        self.identity,
                        running.version
                    );
                    return Ok(Lookup::Wait(running.version, running.flight.clone()));
                }
                state.settled
            };

            if let Some(value) = self.read(version)? {
                Counters::bump(&self.counters.hits);
                debug!("{} cache hit {:?} at {}", C::KIND, self.identity, version);
                return Ok(Lookup::Hit(value));
            }

            let mut state = self.state.lock();
            if state.in_flight.is_some() || state.settled != settled {
                continue;
            }

            Counters::bump(&self.counters.misses);
            debug!("{} cache miss {:?} at {}", C::KIND, self.identity, version);

            let flight_id = state.next_flight;
            state.next_flight += 1;
            let flight = self.spawn_flight(flight_id, version);
            state.in_flight = Some(InFlight {
                id: flight_id,
                version,
                flight: flight.clone(),
            });

            return Ok(Lookup::Wait(version, flight));
        }
    }

    fn read(&self, version: Version) -> CacheResult<Option<C::Output>> {
        match self.ctx.store.get(&self.identity, version)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn spawn_flight(self: &Arc<Self>, flight_id: u64, version: Version) -> Flight<C::Output> {
        let cache = Arc::clone(self);
        let task = self.ctx.runtime.spawn(async move {
            let _reset = FlightReset {
                cache: Arc::clone(&cache),
                flight_id,
            };
            cache.recompute(version).await
        });

        async move {
            task.await
                .unwrap_or_else(|err| Err(CacheError::Aborted(err.to_string())))
        }
        .boxed()
        .shared()
    }

    async fn recompute(&self, version: Version) -> CacheResult<Arc<C::Output>> {
        let result = match AssertUnwindSafe(self.execute(version)).catch_unwind().await {
            Ok(result) => result,
            Err(_) => Err(CacheError::Aborted("computation panicked".to_string())),
        };

        match &result {
            Ok(_) => {
                self.state.lock().last_refreshed = Some(Utc::now());
            }
            Err(err) => {
                Counters::bump(&self.counters.failures);
                warn!(
                    "{} recomputation {:?} at {} failed: {}",
                    C::KIND,
                    self.identity,
                    version,
                    err
                );
            }
        }

        result
    }

    async fn execute(&self, version: Version) -> CacheResult<Arc<C::Output>> {
        let _permit = self
            .ctx
            .permits
            .acquire()
            .await
            .map_err(|_| CacheError::Aborted("worker pool closed".to_string()))?;

        Counters::bump(&self.counters.runs);
        let started = Instant::now();

        let run = self.computation.run(&self.params);
        let output = match self.ctx.run_timeout {
            Some(limit) => tokio::time::timeout(limit, run)
                .await
                .map_err(|_| CacheError::Timeout(limit))?,
            None => run.await,
        }
        .map_err(CacheError::computation)?;

        let bytes = serde_json::to_vec(&output)?;
        self.ctx
            .store
            .set(&self.identity, version, Arc::from(bytes))?;

        debug!(
            "{} cache {:?} stored at {} in {:?}",
            C::KIND,
            self.identity,
            version,
            started.elapsed()
        );

        Ok(Arc::new(output))
    }
}

/// Returns the manager to idle when the recomputation task ends, including
/// by cancellation.
struct FlightReset<C: Computation> {
    cache: Arc<ComputationCache<C>>,
    flight_id: u64,
}

impl<C: Computation> Drop for FlightReset<C> {
    fn drop(&mut self) {
        let mut state = self.cache.state.lock();
        if matches!(&state.in_flight, Some(running) if running.id == self.flight_id) {
            state.in_flight = None;
            state.settled += 1;
        }
    }
}

/// Type-erased view of a manager, as held by the registry.
pub(crate) trait ManagedCache: Send + Sync {
    fn kind(&self) -> &'static str;
    fn type_name(&self) -> &'static str;
    fn stats(&self) -> CacheStats;
    fn detach(&self);
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<C: Computation> ManagedCache for ComputationCache<C> {
    fn kind(&self) -> &'static str {
        C::KIND
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<C>()
    }

    fn stats(&self) -> CacheStats {
        ComputationCache::stats(self)
    }

    fn detach(&self) {
        ComputationCache::detach(self);
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl<C: Computation> std::fmt::Debug for ComputationCache<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputationCache")
            .field("kind", &C::KIND)
            .field("identity", &self.identity)
            .field("params", &self.params)
            .field("recomputing", &self.is_recomputing())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::cache::testing::{self, DownStore, NUMBERS, SlowStore};
    use crate::cache::{CacheConfig, CacheRegistry};
    use crate::events::{ChangeBus, ChangeKind};

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_miss_then_hit() {
        let bus = ChangeBus::new();
        let registry = testing::registry(&bus);
        let scaled = testing::scaled(0);
        let cache = registry.resolve_or_create(&scaled, 7).unwrap();

        assert_eq!(cache.get().await.unwrap(), 7000);
        assert_eq!(cache.get().await.unwrap(), 7000);
        assert_eq!(scaled.runs(), 1);

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.runs, 1);
        assert!(stats.last_refreshed.is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_gets_run_once() {
        let bus = ChangeBus::new();
        let registry = testing::registry(&bus);
        let scaled = testing::scaled(100);
        let cache = registry.resolve_or_create(&scaled, 3).unwrap();

        let waiters: Vec<_> = (0..16)
            .map(|_| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move { cache.get().await })
            })
            .collect();

        for waiter in waiters {
            assert_eq!(waiter.await.unwrap().unwrap(), 3000);
        }
        assert_eq!(scaled.runs(), 1);
        assert!(!cache.is_recomputing());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_version_bump_forces_rerun() {
        let bus = ChangeBus::new();
        let registry = testing::registry(&bus);
        let scaled = testing::scaled(0);
        let cache = registry.resolve_or_create(&scaled, 2).unwrap();

        assert_eq!(cache.get().await.unwrap(), 2000);
        scaled.bump_version();
        assert_eq!(cache.get().await.unwrap(), 2001);
        assert_eq!(scaled.runs(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_background_returns_immediately() {
        let bus = ChangeBus::new();
        let registry = testing::registry(&bus);
        let scaled = testing::scaled(300);
        let cache = registry.resolve_or_create(&scaled, 5).unwrap();

        let started = Instant::now();
        assert!(cache.get_or_run(Mode::Background).await.unwrap().is_none());
        assert!(started.elapsed() < Duration::from_millis(200));
        assert!(cache.is_recomputing());

        // A second background call sees the refresh under way.
        assert!(cache.get_or_run(Mode::Background).await.unwrap().is_none());

        // A blocking caller joins the same run.
        assert_eq!(cache.get().await.unwrap(), 5000);
        assert_eq!(scaled.runs(), 1);

        assert_eq!(cache.get_or_run(Mode::Background).await.unwrap(), Some(5000));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_change_notification_refreshes_in_background() {
        let bus = ChangeBus::new();
        let registry = testing::registry(&bus);
        let scaled = testing::scaled(50);
        let cache = registry.resolve_or_create(&scaled, 4).unwrap();
        let source = Source::new(NUMBERS);

        assert_eq!(cache.get().await.unwrap(), 4000);

        scaled.bump_version();
        let started = Instant::now();
        assert_eq!(bus.notify(&source, ChangeKind::Saved), 1);
        assert!(started.elapsed() < Duration::from_millis(50));

        testing::eventually(|| scaled.runs() == 2 && !cache.is_recomputing()).await;

        assert_eq!(cache.get().await.unwrap(), 4001);
        assert_eq!(scaled.runs(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_notification_without_version_change_is_a_hit() {
        let bus = ChangeBus::new();
        let registry = testing::registry(&bus);
        let scaled = testing::scaled(0);
        let cache = registry.resolve_or_create(&scaled, 1).unwrap();

        cache.get().await.unwrap();
        bus.notify(&Source::new(NUMBERS), ChangeKind::Deleted);

        assert!(!cache.is_recomputing());
        assert_eq!(scaled.runs(), 1);
        assert_eq!(cache.stats().hits, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_failure_resets_state_and_retries() {
        let bus = ChangeBus::new();
        let registry = testing::registry(&bus);
        let scaled = testing::scaled(0);
        scaled.fail_next.store(true, std::sync::atomic::Ordering::SeqCst);
        let cache = registry.resolve_or_create(&scaled, 9).unwrap();

        let err = cache.get().await.unwrap_err();
        assert!(matches!(err, CacheError::Computation(_)));
        assert!(err.to_string().contains("numbers table unreachable"));
        assert!(!cache.is_recomputing());

        assert_eq!(cache.get().await.unwrap(), 9000);
        assert_eq!(scaled.runs(), 2);
        assert_eq!(cache.stats().failures, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_panic_resets_state() {
        let bus = ChangeBus::new();
        let registry = testing::registry(&bus);
        let scaled = testing::scaled(0);
        scaled.panic_next.store(true, std::sync::atomic::Ordering::SeqCst);
        let cache = registry.resolve_or_create(&scaled, 6).unwrap();

        assert!(matches!(cache.get().await, Err(CacheError::Aborted(_))));
        assert!(!cache.is_recomputing());
        assert_eq!(cache.get().await.unwrap(), 6000);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_timeout_resets_state() {
        let bus = ChangeBus::new();
        let config = CacheConfig::default().run_timeout(Duration::from_millis(20));
        let registry = testing::registry_with(&bus, config);
        let scaled = testing::scaled(500);
        let cache = registry.resolve_or_create(&scaled, 8).unwrap();

        let err = cache.get().await.unwrap_err();
        assert!(matches!(err, CacheError::Timeout(limit) if limit == Duration::from_millis(20)));
        assert!(!cache.is_recomputing());

        scaled.delay_ms.store(0, std::sync::atomic::Ordering::SeqCst);
        assert_eq!(cache.get().await.unwrap(), 8000);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_store_failure_propagates() {
        let bus = ChangeBus::new();
        let registry = CacheRegistry::new(DownStore, bus.clone(), CacheConfig::default());
        let scaled = testing::scaled(0);
        let cache = registry.resolve_or_create(&scaled, 1).unwrap();

        assert!(matches!(cache.get().await, Err(CacheError::Store(_))));
        assert!(matches!(
            cache.get_or_run(Mode::Background).await,
            Err(CacheError::Store(_))
        ));
        assert_eq!(scaled.runs(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_runs_are_bounded() {
        let bus = ChangeBus::new();
        let config = CacheConfig::default().max_concurrent_runs(1);
        let registry = testing::registry_with(&bus, config);
        let scaled = testing::scaled(30);

        let waiters: Vec<_> = (0..4u64)
            .map(|n| {
                let cache = registry.resolve_or_create(&scaled, n).unwrap();
                tokio::spawn(async move { cache.get().await })
            })
            .collect();

        for waiter in waiters {
            waiter.await.unwrap().unwrap();
        }
        assert_eq!(scaled.runs(), 4);
        assert_eq!(scaled.peak.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_late_caller_gets_current_version() {
        let bus = ChangeBus::new();
        let registry = testing::registry(&bus);
        let scaled = testing::scaled(200);
        let cache = registry.resolve_or_create(&scaled, 1).unwrap();

        let first = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.get().await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cache.is_recomputing());

        // The data moves on while the run at version 0 is still going.
        scaled.bump_version();
        assert_eq!(cache.get().await.unwrap(), 1001);
        assert_eq!(first.await.unwrap().unwrap(), 1001);
        assert_eq!(scaled.runs(), 2);

        assert_eq!(cache.get().await.unwrap(), 1001);
        assert_eq!(scaled.runs(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_slow_store_read_does_not_hold_state() {
        let bus = ChangeBus::new();
        let registry = CacheRegistry::new(SlowStore::new(300), bus.clone(), CacheConfig::default());
        let scaled = testing::scaled(0);
        let cache = registry.resolve_or_create(&scaled, 2).unwrap();

        let reader = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.get().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = Instant::now();
        let stats = cache.stats();
        assert!(started.elapsed() < Duration::from_millis(100));
        assert_eq!(stats.runs, 0);

        assert_eq!(reader.await.unwrap().unwrap(), 2000);
        assert_eq!(scaled.runs(), 1);
    }
}
