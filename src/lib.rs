//! Compute Cache - Versioned memoization for expensive computations.
//!
//! Results of parametrized computations are stored under
//! `(identity, version)`. A call for the same computation and parameters
//! is served from the store until the computation's version moves, at most
//! one recomputation runs per call identity, and change notifications
//! refresh results ahead of the next request.
//!
//! ## Architecture
//!
//! - `cache` - Registry, per-call managers, identities and the versioned store
//! - `events` - Change notification interface and in-process bus
//! - `config` - Environment configuration
//! - `utils` - Utility functions

pub mod cache;
pub mod config;
pub mod events;
pub mod utils;

pub use cache::{
    CacheConfig, CacheError, CacheRegistry, CacheResult, CacheStats, Computation,
    ComputationCache, Identity, Memoized, Mode, MokaStore, Parameters, StoreError, Version,
    VersionedStore,
};
pub use config::Config;
pub use events::{ChangeBus, ChangeKind, ChangeNotifier, Source};
