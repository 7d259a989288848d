//! Cache entries and their status.

use tokio::time::Instant;

use super::key::{QueryData, QueryKey};
use crate::error::{RemoteError, StaleDataWarning};

/// Lifecycle of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
  /// Nothing fetched yet
  Idle,
  /// A fetch is outstanding; previous data, if any, is still served
  Fetching,
  /// Last fetch succeeded
  Success,
  /// Last fetch failed; `last_good_data` is still served
  Error,
}

/// Stored result plus freshness and status metadata for one key.
#[derive(Debug, Clone)]
pub struct CacheEntry {
  pub key: QueryKey,
  pub data: Option<QueryData>,
  pub fetched_at: Option<Instant>,
  /// `None` once fetched means the entry only goes stale when invalidated
  pub stale_after: Option<Instant>,
  pub status: QueryStatus,
  pub last_error: Option<RemoteError>,
  pub last_good_data: Option<QueryData>,
  pub(crate) invalidated: bool,
}

impl CacheEntry {
  pub(crate) fn new(key: QueryKey) -> Self {
    Self {
      key,
      data: None,
      fetched_at: None,
      stale_after: None,
      status: QueryStatus::Idle,
      last_error: None,
      last_good_data: None,
      invalidated: false,
    }
  }

  pub fn is_stale(&self) -> bool {
    self.is_stale_at(Instant::now())
  }

  pub fn is_stale_at(&self, now: Instant) -> bool {
    match (self.fetched_at, self.stale_after) {
      (None, _) => true,
      (Some(_), None) => self.invalidated,
      (Some(_), Some(stale_after)) => self.invalidated || now > stale_after,
    }
  }

  pub fn is_invalidated(&self) -> bool {
    self.invalidated
  }

  /// Warning to surface when the last refresh failed but older data is
  /// still being shown.
  pub fn stale_warning(&self) -> Option<StaleDataWarning> {
    if self.status != QueryStatus::Error || self.last_good_data.is_none() {
      return None;
    }
    let error = self.last_error.clone()?;
    let age_ms = self
      .fetched_at
      .map(|t| t.elapsed().as_millis())
      .unwrap_or_default();
    Some(StaleDataWarning { error, age_ms })
  }
}
