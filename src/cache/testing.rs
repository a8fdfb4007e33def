//! Test fixtures shared by the cache tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::bail;

use super::{
    CacheConfig, CacheRegistry, Computation, Identity, MokaStore, StoreError, StoredBytes,
    Version, VersionedStore,
};
use crate::events::{ChangeBus, Source};

pub const NUMBERS: &str = "test.numbers";

/// Returns `n * 1000 + version`, with the version read when `run` starts,
/// so results show which data they were computed from.
#[derive(Default)]
pub struct Scaled {
    pub runs: AtomicUsize,
    pub version: AtomicU64,
    pub delay_ms: AtomicU64,
    pub fail_next: AtomicBool,
    pub panic_next: AtomicBool,
    active: AtomicUsize,
    pub peak: AtomicUsize,
}

impl Scaled {
    pub fn with_delay(ms: u64) -> Self {
        let scaled = Self::default();
        scaled.delay_ms.store(ms, Ordering::SeqCst);
        scaled
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn bump_version(&self) {
        self.version.fetch_add(1, Ordering::SeqCst);
    }
}

impl Computation for Scaled {
    const KIND: &'static str = "scaled";
    type Params = u64;
    type Output = u64;

    async fn run(&self, n: &u64) -> anyhow::Result<u64> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let version = self.version.load(Ordering::SeqCst);
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);

        let delay = self.delay_ms.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(delay)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);

        if self.fail_next.swap(false, Ordering::SeqCst) {
            bail!("numbers table unreachable");
        }
        if self.panic_next.swap(false, Ordering::SeqCst) {
            panic!("corrupt row");
        }

        Ok(n * 1000 + version)
    }

    fn version(&self, _n: &u64) -> Version {
        Version(self.version.load(Ordering::SeqCst))
    }

    fn invalidation_sources(&self, _n: &u64) -> Vec<Source> {
        vec![Source::new(NUMBERS)]
    }
}

/// Shares `Scaled`'s kind tag with a different output type.
pub struct Impostor;

impl Computation for Impostor {
    const KIND: &'static str = "scaled";
    type Params = u64;
    type Output = String;

    async fn run(&self, n: &u64) -> anyhow::Result<String> {
        Ok(n.to_string())
    }

    fn version(&self, _n: &u64) -> Version {
        Version(0)
    }

    fn invalidation_sources(&self, _n: &u64) -> Vec<Source> {
        Vec::new()
    }
}

/// Store whose backend is always down.
pub struct DownStore;

impl VersionedStore for DownStore {
    fn get(&self, _identity: &Identity, _version: Version) -> Result<Option<StoredBytes>, StoreError> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }

    fn set(&self, _identity: &Identity, _version: Version, _value: StoredBytes) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }
}

/// Store whose reads stall the calling thread, like a slow remote backend.
pub struct SlowStore {
    inner: MokaStore,
    delay: Duration,
}

impl SlowStore {
    pub fn new(ms: u64) -> Self {
        Self {
            inner: MokaStore::default(),
            delay: Duration::from_millis(ms),
        }
    }
}

impl VersionedStore for SlowStore {
    fn get(&self, identity: &Identity, version: Version) -> Result<Option<StoredBytes>, StoreError> {
        std::thread::sleep(self.delay);
        self.inner.get(identity, version)
    }

    fn set(&self, identity: &Identity, version: Version, value: StoredBytes) -> Result<(), StoreError> {
        self.inner.set(identity, version, value)
    }
}

pub fn registry(bus: &ChangeBus) -> CacheRegistry {
    registry_with(bus, CacheConfig::default())
}

pub fn registry_with(bus: &ChangeBus, config: CacheConfig) -> CacheRegistry {
    CacheRegistry::new(MokaStore::new(&config), bus.clone(), config)
}

/// Poll `check` until it holds, failing the test after two seconds.
pub async fn eventually<F>(check: F)
where
    F: Fn() -> bool,
{
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

pub fn scaled(ms: u64) -> Arc<Scaled> {
    Arc::new(Scaled::with_delay(ms))
}
