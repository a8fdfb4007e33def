//! Versioned key/value store for computed results.

use std::sync::Arc;

use moka::sync::Cache;

use super::error::StoreError;
use super::{CacheConfig, Identity, Version};

/// Serialized result as held by a store.
pub type StoredBytes = Arc<[u8]>;

/// Backend that persists computed results under `(identity, version)`.
///
/// Writes to the same key must be idempotent: concurrent duplicate writes of
/// the same result are harmless. Implementations must be thread-safe.
///
/// Both methods are called from Tokio worker threads. Reads happen outside
/// the manager's state lock, but a slow backend still occupies the worker for
/// the duration of the call, so keep `get` and `set` fast or local.
pub trait VersionedStore: Send + Sync + 'static {
    /// Read the result stored for `identity` at `version`.
    fn get(&self, identity: &Identity, version: Version) -> Result<Option<StoredBytes>, StoreError>;

    /// Store a fully computed result for `identity` at `version`.
    fn set(&self, identity: &Identity, version: Version, value: StoredBytes) -> Result<(), StoreError>;
}

/// In-memory store backed by Moka.
///
/// This store is:
/// - Thread-safe (uses Arc internally)
/// - Capacity bounded, with optional TTL/TTI
/// - Clone-friendly (cloning is cheap, shares the same underlying cache)
///
/// Stale versions are never read again and age out through capacity eviction.
#[derive(Clone)]
pub struct MokaStore {
    inner: Arc<Cache<(Identity, Version), StoredBytes>>,
}

impl MokaStore {
    /// Create a new store sized by `config`.
    pub fn new(config: &CacheConfig) -> Self {
        let mut builder = Cache::builder().max_capacity(config.max_capacity);

        if let Some(ttl) = config.ttl {
            builder = builder.time_to_live(ttl);
        }

        if let Some(tti) = config.tti {
            builder = builder.time_to_idle(tti);
        }

        Self {
            inner: Arc::new(builder.build()),
        }
    }

    /// Remove every stored result.
    pub fn invalidate_all(&self) {
        self.inner.invalidate_all();
    }

    /// Get the number of stored results.
    ///
    /// Note: This may not be perfectly accurate due to concurrent operations.
    pub fn entry_count(&self) -> u64 {
        self.inner.entry_count()
    }
}

impl Default for MokaStore {
    fn default() -> Self {
        Self::new(&CacheConfig::default())
    }
}

impl VersionedStore for MokaStore {
    fn get(&self, identity: &Identity, version: Version) -> Result<Option<StoredBytes>, StoreError> {
        Ok(self.inner.get(&(*identity, version)))
    }

    fn set(&self, identity: &Identity, version: Version, value: StoredBytes) -> Result<(), StoreError> {
        self.inner.insert((*identity, version), value);
        Ok(())
    }
}

impl std::fmt::Debug for MokaStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MokaStore")
            .field("entry_count", &self.inner.entry_count())
            .finish()
    }
}
