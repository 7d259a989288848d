//! Optimistic mutations with rollback.
//!
//! Every mutation runs the same sequence: validate, patch the cache
//! optimistically, call the remote store, then either settle the server's
//! record into the cache or put the previous overlay back.

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

use crate::cache::{Overlay, QueryCache, QueryKey};
use crate::error::{MutationError, RemoteError, ValidationError};
use crate::model::{
  AlertRecord, AlertStatus, Collection, JobRecord, JobStatus, Preferences, ProfileRecord, RawRecord,
  RecordId, RecordRef, Role,
};
use crate::remote::{MutationOp, RemoteDataSource};

const CANCELLED_MESSAGE: &str = "Job cancelled by user";

/// Lifecycle of one mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationState {
  Idle,
  Applying,
  Confirmed,
  RolledBack,
}

/// Partial update of a user profile. Unset fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProfilePatch {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub avatar_url: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub role: Option<Role>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub preferences: Option<Preferences>,
}

impl ProfilePatch {
  pub fn is_empty(&self) -> bool {
    self.name.is_none() && self.avatar_url.is_none() && self.role.is_none() && self.preferences.is_none()
  }

  fn apply(&self, profile: &mut ProfileRecord) {
    if let Some(name) = &self.name {
      profile.name = name.clone();
    }
    if let Some(avatar_url) = &self.avatar_url {
      profile.avatar_url = Some(avatar_url.clone());
    }
    if let Some(role) = self.role {
      profile.role = role;
    }
    if let Some(preferences) = &self.preferences {
      profile.preferences = preferences.clone();
    }
  }
}

type Patch = Box<dyn FnOnce(&mut RawRecord) -> bool + Send>;

/// Optimistic edit shown while the remote write is pending.
enum Edit {
  /// Patch the cached copy of the target, if one is cached
  Patch(Patch),
  /// Show a provisional record
  Insert(RawRecord),
}

/// One remote write plus the optimistic edit that stands in for it.
struct Plan {
  /// Record the mutation is serialized on and whose overlay it owns
  target: RecordRef,
  op: MutationOp,
  payload: Value,
  edit: Edit,
}

/// Applies mutations optimistically through the cache.
///
/// Cloning is cheap. Mutations on the same record run one after another;
/// mutations on different records run concurrently. Each mutation runs on
/// its own task, so dropping the caller's future does not leave an overlay
/// behind.
#[derive(Clone)]
pub struct MutationCoordinator {
  inner: Arc<Inner>,
}

struct Inner {
  cache: QueryCache,
  remote: Arc<dyn RemoteDataSource>,
  locks: Mutex<HashMap<RecordRef, Arc<tokio::sync::Mutex<()>>>>,
  /// Only records with a mutation running or queued have an entry
  states: Mutex<HashMap<RecordRef, MutationState>>,
  next_provisional_id: AtomicI64,
}

impl MutationCoordinator {
  pub fn new(cache: QueryCache, remote: Arc<dyn RemoteDataSource>) -> Self {
    Self {
      inner: Arc::new(Inner {
        cache,
        remote,
        locks: Mutex::new(HashMap::new()),
        states: Mutex::new(HashMap::new()),
        next_provisional_id: AtomicI64::new(-1),
      }),
    }
  }

  /// State of the mutation currently running on `record`.
  ///
  /// A finished mutation reports its outcome through its result. Its final
  /// state stays visible only while another mutation on the same record is
  /// queued; once the record has no mutation left this is `Idle` again.
  pub fn state(&self, record: &RecordRef) -> MutationState {
    lock(&self.inner.states)
      .get(record)
      .copied()
      .unwrap_or(MutationState::Idle)
  }

  pub async fn acknowledge_alert(&self, id: i64, actor: &str) -> Result<AlertRecord, MutationError> {
    validate_id("alert id", id)?;
    let actor = validate_text("actor", actor)?;
    let now = Utc::now();

    let payload = json!({
      "status": AlertStatus::Acknowledged,
      "acknowledged": true,
      "acknowledged_by": actor,
      "acknowledged_at": now,
    });
    let plan = Plan {
      target: RecordRef::new(Collection::Alerts, id),
      op: MutationOp::Update { id: id.into() },
      payload,
      edit: patch_alert(move |alert| {
        alert.status = AlertStatus::Acknowledged;
        alert.acknowledged = true;
        alert.acknowledged_by = Some(actor);
        alert.acknowledged_at = Some(now);
      }),
    };
    match self.execute(plan).await? {
      RawRecord::Alert(alert) => Ok(alert),
      _ => Err(MutationError::UnexpectedRecord("non-alert")),
    }
  }

  pub async fn resolve_alert(&self, id: i64, actor: &str) -> Result<AlertRecord, MutationError> {
    validate_id("alert id", id)?;
    let actor = validate_text("actor", actor)?;
    let now = Utc::now();

    let payload = json!({
      "status": AlertStatus::Resolved,
      "resolved_by": actor,
      "resolved_at": now,
    });
    let plan = Plan {
      target: RecordRef::new(Collection::Alerts, id),
      op: MutationOp::Update { id: id.into() },
      payload,
      edit: patch_alert(move |alert| {
        alert.status = AlertStatus::Resolved;
        alert.resolved_by = Some(actor);
        alert.resolved_at = Some(now);
      }),
    };
    match self.execute(plan).await? {
      RawRecord::Alert(alert) => Ok(alert),
      _ => Err(MutationError::UnexpectedRecord("non-alert")),
    }
  }

  /// Mark a job as failed by user request.
  pub async fn cancel_job(&self, id: i64) -> Result<JobRecord, MutationError> {
    validate_id("job id", id)?;
    let now = Utc::now();

    let plan = Plan {
      target: RecordRef::new(Collection::Jobs, id),
      op: MutationOp::Update { id: id.into() },
      payload: json!({
        "status": JobStatus::Failed,
        "completed_at": now,
        "error_message": CANCELLED_MESSAGE,
      }),
      edit: Edit::Patch(Box::new(move |record: &mut RawRecord| match record {
        RawRecord::Job(job) => {
          job.status = JobStatus::Failed;
          job.completed_at = Some(now);
          job.error_message = Some(CANCELLED_MESSAGE.to_string());
          true
        }
        _ => false,
      })),
    };
    match self.execute(plan).await? {
      RawRecord::Job(job) => Ok(job),
      _ => Err(MutationError::UnexpectedRecord("non-job")),
    }
  }

  /// Start a new run of the named job.
  ///
  /// Until the store answers, a provisional record with a negative id is
  /// shown at the top of the job lists. Runs of the same name are
  /// serialized.
  pub async fn run_job(&self, name: &str) -> Result<JobRecord, MutationError> {
    let name = validate_text("job name", name)?;
    let now = Utc::now();
    let provisional = JobRecord {
      id: self.inner.next_provisional_id.fetch_sub(1, Ordering::Relaxed),
      name: name.clone(),
      status: JobStatus::Running,
      started_at: now,
      completed_at: None,
      duration: None,
      records_processed: None,
      error_message: None,
    };

    let plan = Plan {
      target: RecordRef::new(Collection::Jobs, RecordId::new(format!("run:{}", name))),
      op: MutationOp::Insert,
      payload: json!({
        "name": name,
        "status": JobStatus::Running,
        "started_at": now,
      }),
      edit: Edit::Insert(RawRecord::Job(provisional)),
    };
    match self.execute(plan).await? {
      RawRecord::Job(job) => Ok(job),
      _ => Err(MutationError::UnexpectedRecord("non-job")),
    }
  }

  pub async fn update_profile(
    &self,
    user_id: &str,
    patch: ProfilePatch,
  ) -> Result<ProfileRecord, MutationError> {
    let user_id = validate_text("user id", user_id)?;
    if patch.is_empty() {
      return Err(ValidationError::EmptyPatch.into());
    }
    let payload = serde_json::to_value(&patch).map_err(RemoteError::from)?;

    let plan = Plan {
      target: RecordRef::new(Collection::Profiles, user_id.as_str()),
      op: MutationOp::Update {
        id: RecordId::new(user_id),
      },
      payload,
      edit: Edit::Patch(Box::new(move |record: &mut RawRecord| match record {
        RawRecord::Profile(profile) => {
          patch.apply(profile);
          true
        }
        _ => false,
      })),
    };
    match self.execute(plan).await? {
      RawRecord::Profile(profile) => Ok(profile),
      _ => Err(MutationError::UnexpectedRecord("non-profile")),
    }
  }

  async fn execute(&self, plan: Plan) -> Result<RawRecord, MutationError> {
    let coordinator = self.clone();
    tokio::spawn(async move { coordinator.run(plan).await })
      .await
      .map_err(|e| MutationError::Remote(RemoteError::Unknown(format!("mutation task failed: {}", e))))?
  }

  async fn run(&self, plan: Plan) -> Result<RawRecord, MutationError> {
    let Plan {
      target,
      op,
      payload,
      edit,
    } = plan;
    let record_lock = self.record_lock(&target);
    let guard = record_lock.clone().lock_owned().await;

    let result = self.apply(&target, op, payload, edit).await;

    drop(guard);
    drop(record_lock);
    self.release_lock(&target);
    result
  }

  async fn apply(
    &self,
    target: &RecordRef,
    op: MutationOp,
    payload: Value,
    edit: Edit,
  ) -> Result<RawRecord, MutationError> {
    let cache = &self.inner.cache;
    let mut mutation = Mutation::new(self, target.clone());

    mutation.advance(MutationState::Applying);
    let snapshot = cache.overlay(target);
    let inserted = matches!(edit, Edit::Insert(_));
    let overlay = match edit {
      Edit::Patch(patch) => cache
        .find_record(target)
        .and_then(|mut record| patch(&mut record).then_some(Overlay::Replace(record))),
      Edit::Insert(record) => Some(Overlay::Insert(record)),
    };
    if let Some(overlay) = overlay {
      cache.set_overlay(target.clone(), Some(overlay));
    }

    let result = self
      .inner
      .remote
      .mutate(target.collection, op, payload)
      .await
      .map_err(MutationError::from)
      .and_then(|record| {
        if record.collection() == target.collection {
          Ok(record)
        } else {
          Err(MutationError::UnexpectedRecord(record.collection().as_str()))
        }
      });

    match result {
      Ok(record) => {
        cache.settle(target, &record, inserted);
        cache.invalidate_prefix(&QueryKey::collection(target.collection));
        mutation.advance(MutationState::Confirmed);
        info!(record = %record.record_ref(), "mutation confirmed");
        Ok(record)
      }
      Err(err) => {
        cache.set_overlay(target.clone(), snapshot);
        mutation.advance(MutationState::RolledBack);
        warn!(record = %target, error = %err, "mutation rolled back");
        Err(err)
      }
    }
  }

  fn record_lock(&self, target: &RecordRef) -> Arc<tokio::sync::Mutex<()>> {
    lock(&self.inner.locks)
      .entry(target.clone())
      .or_default()
      .clone()
  }

  /// Forget the lock and state of a record nobody is waiting on.
  fn release_lock(&self, target: &RecordRef) {
    let mut locks = lock(&self.inner.locks);
    if locks.get(target).is_some_and(|l| Arc::strong_count(l) == 1) {
      locks.remove(target);
      // Still under the locks map guard, so a new mutation on the record
      // cannot have started yet.
      lock(&self.inner.states).remove(target);
    }
  }
}

/// Tracks the state of one running mutation.
struct Mutation<'a> {
  coordinator: &'a MutationCoordinator,
  target: RecordRef,
  state: MutationState,
}

impl<'a> Mutation<'a> {
  fn new(coordinator: &'a MutationCoordinator, target: RecordRef) -> Self {
    Self {
      coordinator,
      target,
      state: MutationState::Idle,
    }
  }

  fn advance(&mut self, next: MutationState) {
    debug!(record = %self.target, from = ?self.state, to = ?next, "mutation state");
    self.state = next;
    lock(&self.coordinator.inner.states).insert(self.target.clone(), next);
  }
}

fn patch_alert<F>(patch: F) -> Edit
where
  F: FnOnce(&mut AlertRecord) + Send + 'static,
{
  Edit::Patch(Box::new(move |record: &mut RawRecord| match record {
    RawRecord::Alert(alert) => {
      patch(alert);
      true
    }
    _ => false,
  }))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn validate_id(field: &'static str, id: i64) -> Result<(), ValidationError> {
  if id > 0 {
    Ok(())
  } else {
    Err(ValidationError::InvalidId { field, value: id })
  }
}

fn validate_text(field: &'static str, value: &str) -> Result<String, ValidationError> {
  let value = value.trim();
  if value.is_empty() {
    Err(ValidationError::Missing(field))
  } else {
    Ok(value.to_string())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::aggregate::fixtures::{alert, job};
  use crate::cache::{fetcher, PolicyClass, QueryStatus};
  use crate::model::Severity;
  use crate::remote::{MemorySource, QueryRequest, WithTimeout};
  use std::time::Duration;
  use tokio::time;

  struct Fixture {
    cache: QueryCache,
    source: Arc<MemorySource>,
    coordinator: MutationCoordinator,
  }

  fn fixture(source: MemorySource) -> Fixture {
    let source = Arc::new(source);
    let cache = QueryCache::new();
    let coordinator = MutationCoordinator::new(cache.clone(), source.clone());
    Fixture {
      cache,
      source,
      coordinator,
    }
  }

  fn seeded(latency: Duration) -> MemorySource {
    let source = MemorySource::new().with_latency(latency);
    for (id, status, severity) in [
      (1, AlertStatus::Active, Severity::High),
      (2, AlertStatus::Active, Severity::Low),
      (3, AlertStatus::Resolved, Severity::Medium),
    ] {
      source.push_record(&RawRecord::Alert(alert(id, status, severity))).unwrap();
    }
    source
      .push_record(&RawRecord::Job(job(1, JobStatus::Running, None, None)))
      .unwrap();
    source
  }

  async fn load(f: &Fixture, key: QueryKey, collection: Collection) -> crate::cache::Subscription {
    let source = f.source.clone();
    let fetch = fetcher(move || {
      let source = source.clone();
      async move { source.query(QueryRequest::new(collection)).await }
    });
    let mut sub = f.cache.subscribe(key, fetch, PolicyClass::Static.into());
    sub.wait_for(|e| e.status == QueryStatus::Success).await.unwrap();
    sub
  }

  fn active_alerts(f: &Fixture) -> usize {
    f.cache
      .get(&QueryKey::summary(Collection::Alerts))
      .and_then(|e| e.data)
      .and_then(|d| d.alert_summary().map(|s| s.active_alerts))
      .unwrap()
  }

  #[tokio::test]
  async fn test_validation_rejects_before_remote_call() {
    let f = fixture(seeded(Duration::ZERO));

    let err = f.coordinator.acknowledge_alert(0, "ana").await.unwrap_err();
    assert_eq!(
      err,
      MutationError::Validation(ValidationError::InvalidId { field: "alert id", value: 0 })
    );
    let err = f.coordinator.resolve_alert(3, "  ").await.unwrap_err();
    assert_eq!(err, MutationError::Validation(ValidationError::Missing("actor")));
    let err = f.coordinator.run_job("").await.unwrap_err();
    assert_eq!(err, MutationError::Validation(ValidationError::Missing("job name")));
    let err = f
      .coordinator
      .update_profile("u1", ProfilePatch::default())
      .await
      .unwrap_err();
    assert_eq!(err, MutationError::Validation(ValidationError::EmptyPatch));

    assert_eq!(f.source.mutation_count(), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_acknowledge_is_visible_before_confirmation() {
    let f = fixture(seeded(Duration::from_millis(500)));
    let _list = load(&f, QueryKey::collection(Collection::Alerts), Collection::Alerts).await;
    let _summary = load(&f, QueryKey::summary(Collection::Alerts), Collection::Alerts).await;
    assert_eq!(active_alerts(&f), 2);

    let coordinator = f.coordinator.clone();
    let pending = tokio::spawn(async move { coordinator.acknowledge_alert(1, "ana").await });
    time::sleep(Duration::from_millis(10)).await;

    let target = RecordRef::new(Collection::Alerts, 1);
    let shown = f.cache.find_record(&target).unwrap();
    assert!(shown.as_alert().unwrap().acknowledged);
    assert_eq!(active_alerts(&f), 1);
    assert_eq!(f.coordinator.state(&target), MutationState::Applying);

    let confirmed = pending.await.unwrap().unwrap();
    assert_eq!(confirmed.status, AlertStatus::Acknowledged);
    assert_eq!(confirmed.acknowledged_by.as_deref(), Some("ana"));
    assert_eq!(f.coordinator.state(&target), MutationState::Idle);
    assert!(f.cache.overlay(&target).is_none());
    assert_eq!(active_alerts(&f), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_failed_acknowledge_restores_previous_view() {
    let f = fixture(seeded(Duration::from_millis(100)));
    let list = load(&f, QueryKey::collection(Collection::Alerts), Collection::Alerts).await;
    let _summary = load(&f, QueryKey::summary(Collection::Alerts), Collection::Alerts).await;
    let before = list.data();
    let summary = QueryKey::summary(Collection::Alerts);
    assert!(!f.cache.get(&summary).unwrap().is_invalidated());

    f.source.fail_next_mutation(RemoteError::Auth("token expired".into()));
    let err = f.coordinator.acknowledge_alert(2, "ana").await.unwrap_err();

    assert_eq!(err, MutationError::Remote(RemoteError::Auth("token expired".into())));
    let target = RecordRef::new(Collection::Alerts, 2);
    assert!(f.cache.overlay(&target).is_none());
    assert_eq!(list.data(), before);
    assert_eq!(active_alerts(&f), 2);
    assert!(!f.cache.get(&summary).unwrap().is_invalidated());
    assert!(!f.cache.get(&summary).unwrap().is_stale());
  }

  #[tokio::test(start_paused = true)]
  async fn test_timeout_rolls_back() {
    let slow = seeded(Duration::from_secs(60));
    let cache = QueryCache::new();
    cache.set_data(
      &QueryKey::collection(Collection::Jobs),
      vec![RawRecord::Job(job(1, JobStatus::Running, None, None))],
    );
    let remote = Arc::new(WithTimeout::new(slow, Duration::from_secs(10)));
    let coordinator = MutationCoordinator::new(cache.clone(), remote);

    let err = coordinator.cancel_job(1).await.unwrap_err();
    assert!(matches!(err, MutationError::Remote(RemoteError::Network(_))));

    let job = cache.find_record(&RecordRef::new(Collection::Jobs, 1)).unwrap();
    assert_eq!(job.as_job().unwrap().status, JobStatus::Running);
  }

  #[tokio::test(start_paused = true)]
  async fn test_same_record_mutations_are_serialized() {
    let f = fixture(seeded(Duration::from_millis(100)));
    let start = time::Instant::now();

    let (a, b) = tokio::join!(
      f.coordinator.acknowledge_alert(1, "ana"),
      f.coordinator.resolve_alert(1, "bo"),
    );
    a.unwrap();
    b.unwrap();
    assert!(start.elapsed() >= Duration::from_millis(200));

    let row = &f.source.rows(Collection::Alerts)[0];
    assert_eq!(row["status"], "resolved");
    assert_eq!(row["acknowledged_by"], "ana");
  }

  #[tokio::test(start_paused = true)]
  async fn test_different_records_run_concurrently() {
    let f = fixture(seeded(Duration::from_millis(100)));
    let start = time::Instant::now();

    let (a, b) = tokio::join!(
      f.coordinator.acknowledge_alert(1, "ana"),
      f.coordinator.acknowledge_alert(2, "ana"),
    );
    a.unwrap();
    b.unwrap();
    assert!(start.elapsed() < Duration::from_millis(200));
  }

  #[tokio::test(start_paused = true)]
  async fn test_run_job_shows_provisional_then_confirmed_row() {
    let f = fixture(seeded(Duration::from_millis(100)));
    let list = load(&f, QueryKey::collection(Collection::Jobs), Collection::Jobs).await;

    let coordinator = f.coordinator.clone();
    let pending = tokio::spawn(async move { coordinator.run_job("teams_sync").await });
    time::sleep(Duration::from_millis(10)).await;

    let rows = list.data().unwrap();
    let first = rows.rows().unwrap()[0].as_job().unwrap().clone();
    assert!(first.id < 0);
    assert_eq!(first.name, "teams_sync");

    let confirmed = pending.await.unwrap().unwrap();
    assert_eq!(confirmed.id, 2);
    let rows = list.data().unwrap();
    let mut ids: Vec<i64> = rows.rows().unwrap().iter().map(|r| r.as_job().unwrap().id).collect();
    ids.sort();
    assert_eq!(ids, vec![1, 2]);
  }

  #[tokio::test]
  async fn test_update_profile_patches_only_given_fields() {
    let source = MemorySource::demo(Utc::now());
    let f = fixture(source);
    let _profile = load(&f, QueryKey::collection(Collection::Profiles), Collection::Profiles).await;

    let patch = ProfilePatch {
      name: Some("Ops Lead".to_string()),
      ..ProfilePatch::default()
    };
    let profile = f.coordinator.update_profile("demo-user", patch).await.unwrap();

    assert_eq!(profile.name, "Ops Lead");
    assert_eq!(profile.role, Role::Admin);
    assert_eq!(profile.email, "ops@example.com");
  }

  #[tokio::test]
  async fn test_missing_record_is_not_found() {
    let f = fixture(seeded(Duration::ZERO));
    let err = f.coordinator.cancel_job(42).await.unwrap_err();
    assert!(matches!(err, MutationError::Remote(RemoteError::NotFound(_))));
    assert_eq!(
      f.coordinator.state(&RecordRef::new(Collection::Jobs, 42)),
      MutationState::Idle
    );
  }

  #[tokio::test(start_paused = true)]
  async fn test_state_follows_queued_mutations_then_clears() {
    let f = fixture(seeded(Duration::from_millis(100)));
    let target = RecordRef::new(Collection::Alerts, 1);
    f.source.fail_next_mutation(RemoteError::Network("reset".into()));

    let first = f.coordinator.clone();
    let first = tokio::spawn(async move { first.acknowledge_alert(1, "ana").await });
    time::sleep(Duration::from_millis(10)).await;
    let second = f.coordinator.clone();
    let second = tokio::spawn(async move { second.resolve_alert(1, "bo").await });

    time::sleep(Duration::from_millis(50)).await;
    assert_eq!(f.coordinator.state(&target), MutationState::Applying);
    assert!(first.await.unwrap().is_err());

    // The second call now holds the lock and its write is in flight.
    time::sleep(Duration::from_millis(10)).await;
    assert_eq!(f.coordinator.state(&target), MutationState::Applying);

    second.await.unwrap().unwrap();
    assert_eq!(f.coordinator.state(&target), MutationState::Idle);
  }

  #[tokio::test]
  async fn test_finished_mutations_leave_no_bookkeeping() {
    let f = fixture(seeded(Duration::ZERO));
    for id in 1..=3 {
      f.coordinator.acknowledge_alert(id, "ana").await.unwrap();
    }
    assert!(f.coordinator.cancel_job(42).await.is_err());
    f.coordinator.run_job("teams_sync").await.unwrap();

    assert!(lock(&f.coordinator.inner.states).is_empty());
    assert!(lock(&f.coordinator.inner.locks).is_empty());
  }
}
