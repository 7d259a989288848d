//! Query cache that orchestrates fetching, freshness and optimistic overlays.

use futures::future::BoxFuture;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::entry::{CacheEntry, QueryStatus};
use super::key::{QueryData, QueryKey};
use super::policy::{PolicyClass, QueryOptions};
use super::subscription::Subscription;
use crate::aggregate::HealthPolicy;
use crate::error::RemoteError;
use crate::model::{RawRecord, RecordRef};
use crate::scheduler::PollingScheduler;

/// Future returned by a fetcher.
pub type FetchFuture = BoxFuture<'static, Result<Vec<RawRecord>, RemoteError>>;

/// Factory producing one fetch of the rows behind a key.
pub type Fetcher = Arc<dyn Fn() -> FetchFuture + Send + Sync>;

/// Wrap a closure returning a future into a [`Fetcher`].
pub fn fetcher<F, Fut>(f: F) -> Fetcher
where
  F: Fn() -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<Vec<RawRecord>, RemoteError>> + Send + 'static,
{
  Arc::new(move || Box::pin(f()))
}

/// Whether a fetch may supersede one that is already outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FetchMode {
  /// Coalesce into the outstanding fetch, if any
  IfIdle,
  /// Issue a new request; the outstanding one's response will be dropped
  Force,
}

/// Optimistic edit layered over the confirmed rows of a collection.
#[derive(Debug, Clone, PartialEq)]
pub enum Overlay {
  /// Patched copy of an existing record
  Replace(RawRecord),
  /// Provisional record not yet known to the remote store
  Insert(RawRecord),
}

impl Overlay {
  pub fn record(&self) -> &RawRecord {
    match self {
      Overlay::Replace(r) | Overlay::Insert(r) => r,
    }
  }
}

/// Keyed store of query results.
///
/// Cloning is cheap and every clone shares the same entries. Entries hold
/// the confirmed rows returned by the last applied fetch; the data exposed to
/// subscribers is those rows with the pending overlays applied, aggregated
/// for summary keys. Fetches and poll timers are spawned on the current
/// tokio runtime.
#[derive(Clone)]
pub struct QueryCache {
  inner: Arc<Inner>,
}

struct Inner {
  state: Mutex<State>,
  scheduler: PollingScheduler,
  health: HealthPolicy,
}

#[derive(Default)]
struct State {
  slots: HashMap<QueryKey, Slot>,
  overlays: BTreeMap<RecordRef, Overlay>,
  next_request: u64,
}

struct Slot {
  entry: CacheEntry,
  rows: Option<Arc<Vec<RawRecord>>>,
  fetcher: Option<Fetcher>,
  options: QueryOptions,
  subscribers: usize,
  enabled_subscribers: usize,
  latest_request: u64,
  /// Highest request id issued when the entry was last invalidated
  invalidated_at: u64,
  /// Pending overlays that marked this summary stale when installed
  overlay_marks: BTreeSet<RecordRef>,
  in_flight: bool,
  tx: watch::Sender<CacheEntry>,
}

impl Slot {
  fn new(key: QueryKey, options: QueryOptions) -> Self {
    let entry = CacheEntry::new(key);
    let (tx, _) = watch::channel(entry.clone());
    Self {
      entry,
      rows: None,
      fetcher: None,
      options,
      subscribers: 0,
      enabled_subscribers: 0,
      latest_request: 0,
      invalidated_at: 0,
      overlay_marks: BTreeSet::new(),
      in_flight: false,
      tx,
    }
  }

  fn publish(&self) {
    self.tx.send_replace(self.entry.clone());
  }

  /// Store fetched rows. With `still_invalidated` the entry keeps reading
  /// as stale, for rows requested before the last invalidation.
  fn apply_rows(
    &mut self,
    rows: Vec<RawRecord>,
    still_invalidated: bool,
    overlays: &BTreeMap<RecordRef, Overlay>,
    health: &HealthPolicy,
  ) {
    let now = Instant::now();
    self.rows = Some(Arc::new(rows));
    self.entry.fetched_at = Some(now);
    self.entry.stale_after = self.options.class.stale_time().map(|d| now + d);
    self.entry.status = QueryStatus::Success;
    self.entry.last_error = None;
    self.entry.invalidated = still_invalidated;
    self.overlay_marks.clear();
    self.refresh_view(overlays, health);
  }

  fn apply_error(&mut self, error: RemoteError) {
    self.entry.status = QueryStatus::Error;
    self.entry.last_error = Some(error);
    self.publish();
  }

  /// Recompute the exposed data from the confirmed rows and overlays.
  fn refresh_view(&mut self, overlays: &BTreeMap<RecordRef, Overlay>, health: &HealthPolicy) {
    if let Some(rows) = &self.rows {
      let view = overlay_rows(&self.entry.key, rows, overlays);
      let data = QueryData::derive(&self.entry.key, view, health);
      self.entry.data = Some(data.clone());
      self.entry.last_good_data = Some(data);
    }
    self.publish();
  }

  fn reads(&self, record: &RecordRef) -> bool {
    self.entry.key.collection_name() == Some(record.collection)
  }
}

/// Apply the overlays of the key's collection to a confirmed row set.
fn overlay_rows(
  key: &QueryKey,
  rows: &Arc<Vec<RawRecord>>,
  overlays: &BTreeMap<RecordRef, Overlay>,
) -> Arc<Vec<RawRecord>> {
  let Some(collection) = key.collection_name() else {
    return rows.clone();
  };
  let pending: Vec<(&RecordRef, &Overlay)> = overlays
    .iter()
    .filter(|(r, _)| r.collection == collection)
    .collect();
  if pending.is_empty() {
    return rows.clone();
  }

  let mut view = Vec::with_capacity(rows.len() + pending.len());
  if key.is_collection_wide() {
    view.extend(pending.iter().filter_map(|(_, o)| match o {
      Overlay::Insert(r) => Some(r.clone()),
      Overlay::Replace(_) => None,
    }));
  }
  for row in rows.iter() {
    match overlays.get(&row.record_ref()) {
      Some(Overlay::Replace(patched)) => view.push(patched.clone()),
      _ => view.push(row.clone()),
    }
  }
  Arc::new(view)
}

impl Default for QueryCache {
  fn default() -> Self {
    Self::new()
  }
}

impl QueryCache {
  pub fn new() -> Self {
    Self::with_health_policy(HealthPolicy::default())
  }

  /// Create a cache whose system health summaries use the given policy.
  pub fn with_health_policy(health: HealthPolicy) -> Self {
    Self {
      inner: Arc::new(Inner {
        state: Mutex::new(State::default()),
        scheduler: PollingScheduler::new(),
        health,
      }),
    }
  }

  pub fn health_policy(&self) -> &HealthPolicy {
    &self.inner.health
  }

  fn lock(&self) -> MutexGuard<'_, State> {
    self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Current entry for a key, if one exists.
  pub fn get(&self, key: &QueryKey) -> Option<CacheEntry> {
    self.lock().slots.get(key).map(|slot| slot.entry.clone())
  }

  pub fn subscriber_count(&self, key: &QueryKey) -> usize {
    self.lock().slots.get(key).map_or(0, |slot| slot.subscribers)
  }

  pub fn is_polling(&self, key: &QueryKey) -> bool {
    self.inner.scheduler.is_registered(key)
  }

  /// Register a consumer of `key`.
  ///
  /// The returned subscription carries the current entry, possibly stale or
  /// empty. If the entry is missing or stale and no fetch is outstanding,
  /// one fetch is issued; concurrent subscribers share it. The first enabled
  /// subscriber starts polling for the key's policy class.
  pub fn subscribe(&self, key: QueryKey, fetcher: Fetcher, options: QueryOptions) -> Subscription {
    let (rx, should_fetch) = {
      let mut state = self.lock();
      let slot = state
        .slots
        .entry(key.clone())
        .or_insert_with(|| Slot::new(key.clone(), options));

      if slot.fetcher.is_none() {
        slot.fetcher = Some(fetcher);
      }
      if slot.subscribers == 0 {
        slot.options = options;
      }
      slot.subscribers += 1;

      let mut should_fetch = false;
      if options.enabled {
        slot.enabled_subscribers += 1;
        should_fetch = !slot.in_flight && slot.entry.is_stale();
        if slot.enabled_subscribers == 1 {
          self.start_polling(&key, slot.options.class);
        }
      }
      debug!(%key, subscribers = slot.subscribers, should_fetch, "subscribed");
      (slot.tx.subscribe(), should_fetch)
    };

    if should_fetch {
      self.fetch(&key, FetchMode::IfIdle);
    }
    Subscription::new(self.clone(), key, rx, options.enabled)
  }

  /// Drop one consumer of `key`; called when a subscription goes away.
  pub(crate) fn release(&self, key: &QueryKey, enabled: bool) {
    let mut state = self.lock();
    let Some(slot) = state.slots.get_mut(key) else {
      return;
    };
    slot.subscribers = slot.subscribers.saturating_sub(1);
    if enabled {
      slot.enabled_subscribers = slot.enabled_subscribers.saturating_sub(1);
      if slot.enabled_subscribers == 0 {
        self.inner.scheduler.unregister(key);
      }
    }
    debug!(%key, subscribers = slot.subscribers, "unsubscribed");
  }

  // Called with the state lock held so register/unregister cannot interleave.
  fn start_polling(&self, key: &QueryKey, class: PolicyClass) {
    let cache = Arc::downgrade(&self.inner);
    let tick_key = key.clone();
    self
      .inner
      .scheduler
      .register_interval(key.clone(), class, move || match cache.upgrade() {
        Some(inner) => {
          QueryCache { inner }.fetch(&tick_key, FetchMode::IfIdle);
          true
        }
        None => false,
      });
  }

  /// Issue a fetch for `key` using its registered fetcher.
  ///
  /// Returns whether a request was issued. In `IfIdle` mode an outstanding
  /// fetch absorbs the call. In `Force` mode the new request supersedes it.
  pub(crate) fn fetch(&self, key: &QueryKey, mode: FetchMode) -> bool {
    let (request, fetcher) = {
      let mut state = self.lock();
      let State {
        slots,
        next_request,
        ..
      } = &mut *state;
      let Some(slot) = slots.get_mut(key) else {
        return false;
      };
      let Some(fetcher) = slot.fetcher.clone() else {
        return false;
      };
      if slot.in_flight && mode == FetchMode::IfIdle {
        trace!(%key, "fetch already in flight");
        return false;
      }

      *next_request += 1;
      slot.latest_request = *next_request;
      slot.in_flight = true;
      slot.entry.status = QueryStatus::Fetching;
      slot.publish();
      (*next_request, fetcher)
    };

    debug!(%key, request, ?mode, "fetch issued");
    let future = fetcher();
    let cache = self.clone();
    let key = key.clone();
    tokio::spawn(async move {
      let result = future.await;
      cache.complete(&key, request, result);
    });
    true
  }

  /// Force a new fetch of `key`, superseding any outstanding one.
  pub fn refetch(&self, key: &QueryKey) -> bool {
    self.fetch(key, FetchMode::Force)
  }

  fn complete(&self, key: &QueryKey, request: u64, result: Result<Vec<RawRecord>, RemoteError>) {
    let refetch = {
      let mut state = self.lock();
      let State {
        slots, overlays, ..
      } = &mut *state;
      let Some(slot) = slots.get_mut(key) else {
        return;
      };
      if slot.latest_request != request {
        debug!(%key, request, latest = slot.latest_request, "discarding superseded response");
        return;
      }

      // The request went out before the last invalidation, so its rows may
      // predate the write that caused it.
      let predates_invalidation = request <= slot.invalidated_at;
      slot.in_flight = false;
      match result {
        Ok(rows) => {
          debug!(%key, request, rows = rows.len(), predates_invalidation, "fetch succeeded");
          slot.apply_rows(rows, predates_invalidation, overlays, &self.inner.health);
        }
        Err(err) => {
          warn!(%key, request, error = %err, "fetch failed");
          slot.apply_error(err);
        }
      }
      predates_invalidation && slot.enabled_subscribers > 0
    };

    if refetch {
      self.fetch(key, FetchMode::Force);
    }
  }

  /// Store rows for `key` as a successful result.
  ///
  /// Any outstanding fetch for the key is superseded, so its response will
  /// not overwrite these rows.
  pub fn set_data(&self, key: &QueryKey, rows: Vec<RawRecord>) {
    let mut state = self.lock();
    let State {
      slots,
      overlays,
      next_request,
    } = &mut *state;
    let slot = slots
      .entry(key.clone())
      .or_insert_with(|| Slot::new(key.clone(), default_options(key)));
    *next_request += 1;
    slot.latest_request = *next_request;
    slot.in_flight = false;
    slot.apply_rows(rows, false, overlays, &self.inner.health);
  }

  /// Record a failed refresh. Previously stored data stays in place.
  pub fn set_error(&self, key: &QueryKey, error: RemoteError) {
    let mut state = self.lock();
    let slot = state
      .slots
      .entry(key.clone())
      .or_insert_with(|| Slot::new(key.clone(), default_options(key)));
    slot.apply_error(error);
  }

  /// Mark every entry whose key matches as stale.
  ///
  /// Nothing is removed. Entries with enabled subscribers are refetched
  /// right away. A response to a request issued before this call leaves
  /// its entry stale. Returns the number of entries marked.
  pub fn invalidate<F>(&self, matches: F) -> usize
  where
    F: Fn(&QueryKey) -> bool,
  {
    let mut refetch = Vec::new();
    let mut marked = 0;
    {
      let mut state = self.lock();
      let State {
        slots, next_request, ..
      } = &mut *state;
      for slot in slots.values_mut().filter(|s| matches(&s.entry.key)) {
        slot.entry.invalidated = true;
        slot.invalidated_at = *next_request;
        slot.overlay_marks.clear();
        slot.publish();
        marked += 1;
        if slot.enabled_subscribers > 0 {
          refetch.push(slot.entry.key.clone());
        }
      }
    }

    debug!(marked, refetching = refetch.len(), "invalidated");
    for key in refetch {
      self.fetch(&key, FetchMode::Force);
    }
    marked
  }

  pub fn invalidate_prefix(&self, prefix: &QueryKey) -> usize {
    self.invalidate(|key| key.starts_with(prefix))
  }

  /// Current cached value of a record, overlays included.
  ///
  /// When several entries hold the record, the copy from the most recently
  /// fetched one wins, and a collection-wide entry wins a tie.
  pub fn find_record(&self, record: &RecordRef) -> Option<RawRecord> {
    let state = self.lock();
    if let Some(overlay) = state.overlays.get(record) {
      return Some(overlay.record().clone());
    }
    state
      .slots
      .values()
      .filter(|slot| slot.reads(record))
      .filter_map(|slot| {
        let row = slot.rows.as_ref()?.iter().find(|row| row.id() == record.id)?;
        Some(((slot.entry.fetched_at, slot.entry.key.is_collection_wide()), row))
      })
      .max_by_key(|(rank, _)| *rank)
      .map(|(_, row)| row.clone())
  }

  pub fn overlay(&self, record: &RecordRef) -> Option<Overlay> {
    self.lock().overlays.get(record).cloned()
  }

  /// Install (`Some`) or remove (`None`) the overlay for a record and
  /// return the one it replaces.
  ///
  /// Every entry reading the record's collection is recomputed. Installing
  /// an overlay also marks the collection's summary stale; removing it
  /// again puts back the summary's previous flag unless something else
  /// invalidated or refreshed the summary in between.
  pub fn set_overlay(&self, record: RecordRef, overlay: Option<Overlay>) -> Option<Overlay> {
    let mut state = self.lock();
    let State {
      slots, overlays, ..
    } = &mut *state;
    let installing = overlay.is_some();
    let previous = match overlay {
      Some(o) => overlays.insert(record.clone(), o),
      None => overlays.remove(&record),
    };

    for slot in slots.values_mut().filter(|s| s.reads(&record)) {
      if slot.entry.key.is_summary() {
        if installing {
          // An entry invalidated for another reason has nothing to restore.
          if !slot.entry.invalidated || !slot.overlay_marks.is_empty() {
            slot.overlay_marks.insert(record.clone());
            slot.entry.invalidated = true;
          }
        } else if slot.overlay_marks.remove(&record) && slot.overlay_marks.is_empty() {
          slot.entry.invalidated = false;
        }
      }
      slot.refresh_view(overlays, &self.inner.health);
    }
    debug!(%record, installing, "overlay updated");
    previous
  }

  /// Write a record confirmed by the remote store into the cached rows.
  ///
  /// Existing copies are replaced wherever they appear. A record that was
  /// just inserted is also prepended to the collection-wide entries.
  pub fn confirm_record(&self, record: &RawRecord, inserted: bool) {
    self.write_confirmed(None, record, inserted);
  }

  /// Remove the overlay at `overlay` and write the confirmed record in the
  /// same step, so subscribers never observe both or neither.
  pub fn settle(&self, overlay: &RecordRef, record: &RawRecord, inserted: bool) {
    self.write_confirmed(Some(overlay), record, inserted);
  }

  fn write_confirmed(&self, settled: Option<&RecordRef>, record: &RawRecord, inserted: bool) {
    let target = record.record_ref();
    let mut state = self.lock();
    let State {
      slots, overlays, ..
    } = &mut *state;
    let removed = settled.and_then(|r| overlays.remove(r).map(|_| r.collection));

    for slot in slots.values_mut() {
      if let Some(settled) = settled {
        slot.overlay_marks.remove(settled);
      }
      let mut changed = removed.is_some_and(|c| slot.entry.key.collection_name() == Some(c));
      if slot.reads(&target) {
        if let Some(rows) = slot.rows.as_mut() {
          let rows = Arc::make_mut(rows);
          match rows.iter().position(|row| row.id() == target.id) {
            Some(i) => {
              rows[i] = record.clone();
              changed = true;
            }
            None if inserted && slot.entry.key.is_collection_wide() => {
              rows.insert(0, record.clone());
              changed = true;
            }
            None => {}
          }
        }
      }
      if changed {
        slot.refresh_view(overlays, &self.inner.health);
      }
    }
    debug!(record = %target, inserted, "record confirmed");
  }
}

fn default_options(key: &QueryKey) -> QueryOptions {
  let class = key
    .collection_name()
    .map_or(PolicyClass::Static, PolicyClass::for_collection);
  QueryOptions::new(class)
}
