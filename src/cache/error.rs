//! Error types for the computation cache.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use super::Identity;

/// Errors reported by a [`VersionedStore`](super::VersionedStore) backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The backend could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The backend refused the operation.
    #[error("store rejected operation: {0}")]
    Rejected(String),
}

/// Errors returned by cache lookups and recomputations.
///
/// Cloneable so that every caller waiting on the same in-flight
/// recomputation receives the same failure.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// The computation's `run` returned an error.
    #[error("computation failed: {0}")]
    Computation(Arc<anyhow::Error>),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// A result could not be encoded for, or decoded from, the store.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// `run` exceeded the configured timeout.
    #[error("computation timed out after {0:?}")]
    Timeout(Duration),

    /// The recomputation task panicked or was cancelled.
    #[error("recomputation aborted: {0}")]
    Aborted(String),

    /// An identity is already registered for a different computation type.
    #[error("identity {identity} is registered as {found}, requested as {expected}")]
    KindConflict {
        identity: Identity,
        expected: &'static str,
        found: &'static str,
    },
}

impl CacheError {
    pub(crate) fn computation(err: anyhow::Error) -> Self {
        Self::Computation(Arc::new(err))
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result alias used throughout the cache module.
pub type CacheResult<T> = Result<T, CacheError>;
