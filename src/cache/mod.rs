//! Cache module - Versioned memoization of expensive computations.
//!
//! ## Architecture
//!
//! - `CacheRegistry` - Maps call identities to their managers, one per identity
//! - `ComputationCache` - Per-call manager: store lookup, single-flight
//!   recomputation and refresh on change notifications
//! - `Computation` - Trait implemented by each cached query
//! - `VersionedStore` - Backend holding results under `(identity, version)`,
//!   with `MokaStore` as the in-memory implementation
//!
//! ## Usage
//!
//! ```rust,ignore
//! let registry = CacheRegistry::new(MokaStore::default(), bus.clone(), CacheConfig::default());
//! let word_count = registry.memoize(AuthorWordCount::new(db));
//!
//! // First call computes, later calls hit the store until the version moves.
//! let words = word_count.get("ana".to_string()).await?;
//! ```

mod computation;
mod config;
mod error;
mod identity;
mod manager;
mod registry;
mod stats;
mod store;

#[cfg(test)]
mod testing;

pub use computation::{Computation, Mode, Version};
pub use config::CacheConfig;
pub use error::{CacheError, CacheResult, StoreError};
pub use identity::{Identity, Parameters};
pub use manager::ComputationCache;
pub use registry::{CacheRegistry, Memoized};
pub use stats::CacheStats;
pub use store::{MokaStore, StoredBytes, VersionedStore};
