//! Cache registry - Central management for all computation caches.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tracing::{debug, info};

use super::manager::{CacheContext, ManagedCache};
use super::{
    CacheConfig, CacheError, CacheResult, CacheStats, Computation, ComputationCache, Identity,
    Mode, VersionedStore,
};
use crate::events::ChangeNotifier;

/// Central registry mapping call identities to their cache managers.
///
/// At most one [`ComputationCache`] exists per identity. The registry is an
/// ordinary value: build one at startup, share it (cloning is cheap), and
/// call [`CacheRegistry::shutdown`] when the application stops.
///
/// ## Example
///
/// ```rust,ignore
/// let registry = CacheRegistry::new(store, bus, CacheConfig::default());
///
/// // Computes on first call, served from the store afterwards.
/// let words = registry.get(&word_count, "ana".to_string()).await?;
/// ```
#[derive(Clone)]
pub struct CacheRegistry {
    caches: Arc<DashMap<Identity, Arc<dyn ManagedCache>>>,
    ctx: Arc<CacheContext>,
}

impl CacheRegistry {
    /// Create a registry that spawns recomputations on the current Tokio
    /// runtime.
    ///
    /// # Panics
    /// Panics if called outside a Tokio runtime. Use
    /// [`CacheRegistry::with_runtime`] to pass a handle explicitly.
    pub fn new<S, N>(store: S, notifier: N, config: CacheConfig) -> Self
    where
        S: VersionedStore,
        N: ChangeNotifier,
    {
        Self::with_runtime(store, notifier, config, Handle::current())
    }

    /// Create a registry that spawns recomputations on `runtime`.
    pub fn with_runtime<S, N>(store: S, notifier: N, config: CacheConfig, runtime: Handle) -> Self
    where
        S: VersionedStore,
        N: ChangeNotifier,
    {
        let permits = config.max_concurrent_runs.max(1);
        info!(
            "Cache registry initialized ({} concurrent run(s), timeout {:?})",
            permits, config.run_timeout
        );

        Self {
            caches: Arc::new(DashMap::new()),
            ctx: Arc::new(CacheContext {
                store: Arc::new(store),
                notifier: Arc::new(notifier),
                runtime,
                permits: Arc::new(Semaphore::new(permits)),
                run_timeout: config.run_timeout,
            }),
        }
    }

    /// Get the manager for `computation` called with `params`, creating and
    /// registering it if it doesn't exist.
    ///
    /// Lookup and creation use the same identity. Concurrent first requests
    /// for one identity are serialized on the map entry, so exactly one
    /// manager is registered.
    ///
    /// # Errors
    /// Returns [`CacheError::Serialization`] if `params` cannot be encoded,
    /// and [`CacheError::KindConflict`] if the identity is already taken by a
    /// different computation type sharing the same kind tag.
    pub fn resolve_or_create<C: Computation>(
        &self,
        computation: &Arc<C>,
        params: C::Params,
    ) -> CacheResult<Arc<ComputationCache<C>>> {
        let identity = Identity::derive(C::KIND, &params)?;

        let entry = match self.caches.entry(identity) {
            Entry::Occupied(entry) => Arc::clone(entry.get()),
            Entry::Vacant(entry) => {
                let cache = ComputationCache::new(
                    identity,
                    Arc::clone(computation),
                    params,
                    Arc::clone(&self.ctx),
                );
                entry.insert(Arc::clone(&cache) as Arc<dyn ManagedCache>);
                return Ok(cache);
            }
        };

        let found = entry.type_name();
        entry
            .into_any()
            .downcast::<ComputationCache<C>>()
            .map_err(|_| CacheError::KindConflict {
                identity,
                expected: std::any::type_name::<C>(),
                found,
            })
    }

    /// Get the result of `computation` for `params`, waiting for a
    /// recomputation if nothing is stored for the current version.
    pub async fn get<C: Computation>(
        &self,
        computation: &Arc<C>,
        params: C::Params,
    ) -> CacheResult<C::Output> {
        self.resolve_or_create(computation, params)?.get().await
    }

    /// Return the stored result if there is one; otherwise make sure a
    /// background recomputation is running and return `None`.
    pub async fn refresh<C: Computation>(
        &self,
        computation: &Arc<C>,
        params: C::Params,
    ) -> CacheResult<Option<C::Output>> {
        let cache = self.resolve_or_create(computation, params)?;
        cache.get_or_run(Mode::Background).await
    }

    /// Bind `computation` to this registry.
    pub fn memoize<C: Computation>(&self, computation: C) -> Memoized<C> {
        Memoized {
            registry: self.clone(),
            computation: Arc::new(computation),
        }
    }

    /// Check if a manager with the given identity exists.
    pub fn contains(&self, identity: &Identity) -> bool {
        self.caches.contains_key(identity)
    }

    /// Get the number of registered managers.
    pub fn len(&self) -> usize {
        self.caches.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.caches.is_empty()
    }

    /// Get a list of all registered identities.
    pub fn identities(&self) -> Vec<Identity> {
        self.caches.iter().map(|entry| *entry.key()).collect()
    }

    /// Statistics merged over every registered manager.
    pub fn stats(&self) -> CacheStats {
        let mut total = CacheStats::default();
        for entry in self.caches.iter() {
            total.merge(&entry.value().stats());
        }
        total
    }

    /// Unsubscribe every manager from change notifications and empty the
    /// registry. In-flight recomputations still run to completion.
    pub fn shutdown(&self) {
        let identities = self.identities();
        for identity in &identities {
            if let Some((_, cache)) = self.caches.remove(identity) {
                debug!("Detaching {} cache {:?}", cache.kind(), identity);
                cache.detach();
            }
        }
        info!("Cache registry shut down ({} cache(s) detached)", identities.len());
    }
}

impl std::fmt::Debug for CacheRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheRegistry")
            .field("cache_count", &self.caches.len())
            .field("run_timeout", &self.ctx.run_timeout)
            .finish()
    }
}

/// A computation bound to a registry: the entry point application code uses.
///
/// ```rust,ignore
/// let word_count = registry.memoize(AuthorWordCount::new(db));
/// let words = word_count.get("ana".to_string()).await?;
/// ```
pub struct Memoized<C: Computation> {
    registry: CacheRegistry,
    computation: Arc<C>,
}

impl<C: Computation> Memoized<C> {
    /// Current or freshly computed result for `params`.
    pub async fn get(&self, params: C::Params) -> CacheResult<C::Output> {
        self.registry.get(&self.computation, params).await
    }

    /// Stored result for `params`, or `None` while a refresh runs.
    pub async fn refresh(&self, params: C::Params) -> CacheResult<Option<C::Output>> {
        self.registry.refresh(&self.computation, params).await
    }

    /// Manager for `params`.
    pub fn cache(&self, params: C::Params) -> CacheResult<Arc<ComputationCache<C>>> {
        self.registry.resolve_or_create(&self.computation, params)
    }

    pub fn computation(&self) -> &C {
        &self.computation
    }
}

impl<C: Computation> Clone for Memoized<C> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            computation: Arc::clone(&self.computation),
        }
    }
}
