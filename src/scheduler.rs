//! Periodic refetch timers, one per polled query key.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::debug;

use crate::cache::{PolicyClass, QueryKey};

/// Drives periodic refetches while a key has subscribers.
///
/// Each registered key owns one spawned timer task. The tick callback decides
/// whether a fetch is actually issued; returning `false` ends the timer.
#[derive(Default)]
pub struct PollingScheduler {
  timers: Mutex<HashMap<QueryKey, JoinHandle<()>>>,
}

impl PollingScheduler {
  pub fn new() -> Self {
    Self::default()
  }

  /// Start polling `key` at the interval of `class`.
  ///
  /// The first tick fires one full period after registration and missed
  /// ticks are skipped rather than queued. Returns `false` for classes that
  /// are never polled. Must be called from within a tokio runtime.
  pub fn register_interval<F>(&self, key: QueryKey, class: PolicyClass, on_tick: F) -> bool
  where
    F: Fn() -> bool + Send + 'static,
  {
    let Some(period) = class.refetch_interval() else {
      return false;
    };

    debug!(%key, ?class, period_ms = period.as_millis() as u64, "polling started");
    let handle = tokio::spawn(async move {
      let mut ticker = time::interval_at(Instant::now() + period, period);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
      loop {
        ticker.tick().await;
        if !on_tick() {
          break;
        }
      }
    });

    if let Some(previous) = self.lock().insert(key, handle) {
      previous.abort();
    }
    true
  }

  /// Stop polling `key`. Fetches already issued by earlier ticks are left
  /// to complete.
  pub fn unregister(&self, key: &QueryKey) -> bool {
    match self.lock().remove(key) {
      Some(handle) => {
        handle.abort();
        debug!(%key, "polling stopped");
        true
      }
      None => false,
    }
  }

  pub fn is_registered(&self, key: &QueryKey) -> bool {
    self.lock().contains_key(key)
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<QueryKey, JoinHandle<()>>> {
    self.timers.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

impl Drop for PollingScheduler {
  fn drop(&mut self) {
    for (_, handle) in self.lock().drain() {
      handle.abort();
    }
  }
}
