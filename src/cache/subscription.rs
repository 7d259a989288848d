//! Consumer handle onto one cache key.

use tokio::sync::watch;

use super::entry::{CacheEntry, QueryStatus};
use super::key::{QueryData, QueryKey};
use super::layer::QueryCache;
use crate::error::{RemoteError, StaleDataWarning};

/// A live view of one cache entry.
///
/// Reads never block and never fail: fetch errors show up through
/// [`status`](Self::status) and [`error`](Self::error). Dropping the
/// subscription unsubscribes; the last enabled subscriber leaving stops the
/// key's poll timer.
pub struct Subscription {
  cache: QueryCache,
  key: QueryKey,
  rx: watch::Receiver<CacheEntry>,
  enabled: bool,
}

impl Subscription {
  pub(crate) fn new(
    cache: QueryCache,
    key: QueryKey,
    rx: watch::Receiver<CacheEntry>,
    enabled: bool,
  ) -> Self {
    Self {
      cache,
      key,
      rx,
      enabled,
    }
  }

  pub fn key(&self) -> &QueryKey {
    &self.key
  }

  /// Snapshot of the entry as last published.
  pub fn entry(&self) -> CacheEntry {
    self.rx.borrow().clone()
  }

  pub fn data(&self) -> Option<QueryData> {
    self.rx.borrow().data.clone()
  }

  pub fn status(&self) -> QueryStatus {
    self.rx.borrow().status
  }

  pub fn error(&self) -> Option<RemoteError> {
    self.rx.borrow().last_error.clone()
  }

  pub fn stale_warning(&self) -> Option<StaleDataWarning> {
    self.rx.borrow().stale_warning()
  }

  /// Wait for the next published change. `None` once the cache is gone.
  pub async fn changed(&mut self) -> Option<CacheEntry> {
    self.rx.changed().await.ok()?;
    Some(self.rx.borrow_and_update().clone())
  }

  /// Wait until the entry satisfies `predicate`, checking the current value
  /// first.
  pub async fn wait_for<F>(&mut self, mut predicate: F) -> Option<CacheEntry>
  where
    F: FnMut(&CacheEntry) -> bool,
  {
    let entry = self.rx.wait_for(|e| predicate(e)).await.ok()?;
    Some(entry.clone())
  }

  /// Fetch now, superseding any outstanding fetch for this key.
  pub fn refetch(&self) -> bool {
    self.cache.refetch(&self.key)
  }

  pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
  fn drop(&mut self) {
    self.cache.release(&self.key, self.enabled);
  }
}

impl std::fmt::Debug for Subscription {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Subscription")
      .field("key", &self.key)
      .field("enabled", &self.enabled)
      .finish_non_exhaustive()
  }
}
