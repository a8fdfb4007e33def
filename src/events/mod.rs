//! Change notification.
//!
//! Computations name the [`Source`]s they read from. A [`ChangeNotifier`]
//! delivers "something changed" signals for those sources to subscribed
//! callbacks. [`ChangeBus`] is the in-process implementation: data owners
//! call [`ChangeBus::notify`] after saving or deleting rows.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tracing::{debug, trace};

/// Descriptor of an external data source, e.g. `"blog.article"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Source(Arc<str>);

impl Source {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self(name.into())
    }

    /// Source for a model inside an application, written `app.model`.
    pub fn model(app: &str, model: &str) -> Self {
        Self(format!("{app}.{model}").into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Source {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// What happened to a source. Subscribers only see a merged "changed" signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Saved,
    Deleted,
}

/// Callback invoked when a subscribed source changes.
pub type ChangeCallback = Arc<dyn Fn() + Send + Sync>;

/// Handle returned by [`ChangeNotifier::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Subscription interface consumed by the cache.
pub trait ChangeNotifier: Send + Sync + 'static {
    /// Register `callback` to run whenever `source` changes.
    fn subscribe(&self, source: &Source, callback: ChangeCallback) -> SubscriptionId;

    /// Remove a subscription. Returns `false` if it was not registered.
    fn unsubscribe(&self, source: &Source, id: SubscriptionId) -> bool;
}

/// In-process change notifier.
///
/// Clone-friendly: clones share the same subscriber table.
#[derive(Clone, Default)]
pub struct ChangeBus {
    subscribers: Arc<DashMap<Source, Vec<(SubscriptionId, ChangeCallback)>>>,
    next_id: Arc<AtomicU64>,
}

impl ChangeBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal that `source` changed.
    ///
    /// Callbacks run on the caller's thread, after the subscriber table lock
    /// is released, so a callback may subscribe or unsubscribe.
    /// Returns the number of callbacks invoked.
    pub fn notify(&self, source: &Source, kind: ChangeKind) -> usize {
        let callbacks: Vec<ChangeCallback> = match self.subscribers.get(source) {
            Some(entry) => entry.iter().map(|(_, cb)| Arc::clone(cb)).collect(),
            None => Vec::new(),
        };

        debug!(
            "Source {} {:?}, notifying {} subscriber(s)",
            source,
            kind,
            callbacks.len()
        );

        for callback in &callbacks {
            callback();
        }

        callbacks.len()
    }

    /// Number of live subscriptions for `source`.
    pub fn subscriber_count(&self, source: &Source) -> usize {
        self.subscribers.get(source).map_or(0, |entry| entry.len())
    }
}

impl ChangeNotifier for ChangeBus {
    fn subscribe(&self, source: &Source, callback: ChangeCallback) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .entry(source.clone())
            .or_default()
            .push((id, callback));
        trace!("Subscribed {:?} to {}", id, source);
        id
    }

    fn unsubscribe(&self, source: &Source, id: SubscriptionId) -> bool {
        let Some(mut entry) = self.subscribers.get_mut(source) else {
            return false;
        };

        let before = entry.len();
        entry.retain(|(sub, _)| *sub != id);
        let removed = entry.len() != before;
        let now_empty = entry.is_empty();
        drop(entry);

        if now_empty {
            self.subscribers.remove_if(source, |_, subs| subs.is_empty());
        }

        removed
    }
}

impl fmt::Debug for ChangeBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeBus")
            .field("source_count", &self.subscribers.len())
            .finish()
    }
}
