//! The computation contract implemented by every cached query.

use std::fmt;
use std::future::Future;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::events::Source;

/// Version of the data a computation reads.
///
/// Results are stored per version; when the version changes, results stored
/// under older versions are simply never read again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Version(pub u64);

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl From<u64> for Version {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// How a lookup behaves when no fresh result is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Wait for the result, recomputing if needed.
    Blocking,
    /// Return immediately; start a recomputation in the background if needed.
    Background,
}

/// An expensive, parametrized computation whose results are cached.
///
/// ## Example
///
/// ```rust,ignore
/// struct AuthorWordCount { db: Arc<Db> }
///
/// impl Computation for AuthorWordCount {
///     const KIND: &'static str = "author_word_count";
///     type Params = String;
///     type Output = u64;
///
///     async fn run(&self, author: &String) -> anyhow::Result<u64> {
///         self.db.count_words(author).await
///     }
///
///     fn version(&self, _author: &String) -> Version {
///         Version(self.db.revision("blog.article"))
///     }
///
///     fn invalidation_sources(&self, _author: &String) -> Vec<Source> {
///         vec![Source::new("blog.article")]
///     }
/// }
/// ```
pub trait Computation: Send + Sync + 'static {
    /// Stable tag naming this kind of computation.
    ///
    /// Part of every identity, so it must not change between releases
    /// unless cached results should be discarded.
    const KIND: &'static str;

    /// Call parameters. Equal parameters (by value) share one cache entry.
    type Params: Serialize + Clone + fmt::Debug + Send + Sync + 'static;

    /// Computed result.
    type Output: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;

    /// Run the computation.
    ///
    /// Must be a pure function of `params` for a given version.
    fn run(
        &self,
        params: &Self::Params,
    ) -> impl Future<Output = anyhow::Result<Self::Output>> + Send;

    /// Current version of the data `run` depends on.
    ///
    /// Called on every lookup, so it must be cheap.
    fn version(&self, params: &Self::Params) -> Version;

    /// Sources whose changes should trigger a refresh.
    fn invalidation_sources(&self, params: &Self::Params) -> Vec<Source>;
}
