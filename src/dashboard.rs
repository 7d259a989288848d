//! The dashboard's queries and mutations over one cache and one remote store.

use futures::future::try_join_all;
use std::sync::Arc;

use crate::cache::{fetcher, PolicyClass, QueryCache, QueryKey, QueryOptions, Subscription};
use crate::error::{MutationError, RemoteError};
use crate::model::{AlertRecord, AlertStatus, Collection, JobRecord, ProfileRecord, RawRecord};
use crate::mutation::{MutationCoordinator, ProfilePatch};
use crate::remote::{QueryRequest, RemoteDataSource};

const JOB_LIST_LIMIT: usize = 50;
const ALERT_LIST_LIMIT: usize = 100;
const METRIC_LIST_LIMIT: usize = 100;
const ACTIVITY_LIMIT: usize = 50;
const REFERENCE_COLLECTIONS: [Collection; 4] = [
  Collection::Countries,
  Collection::Leagues,
  Collection::Seasons,
  Collection::Fixtures,
];

/// Entry point for consumers: every dashboard view is a subscription
/// obtained here, every edit goes through the mutation coordinator.
///
/// Cloning is cheap; clones share the cache and the coordinator.
#[derive(Clone)]
pub struct Dashboard {
  cache: QueryCache,
  remote: Arc<dyn RemoteDataSource>,
  mutations: MutationCoordinator,
}

impl Dashboard {
  pub fn new(cache: QueryCache, remote: Arc<dyn RemoteDataSource>) -> Self {
    let mutations = MutationCoordinator::new(cache.clone(), remote.clone());
    Self {
      cache,
      remote,
      mutations,
    }
  }

  pub fn cache(&self) -> &QueryCache {
    &self.cache
  }

  pub fn mutations(&self) -> &MutationCoordinator {
    &self.mutations
  }

  fn watch(&self, key: QueryKey, request: QueryRequest, options: QueryOptions) -> Subscription {
    let remote = self.remote.clone();
    let fetch = fetcher(move || {
      let remote = remote.clone();
      let request = request.clone();
      async move { remote.query(request).await }
    });
    self.cache.subscribe(key, fetch, options)
  }

  fn watch_collection(&self, key: QueryKey, request: QueryRequest) -> Subscription {
    let class = PolicyClass::for_collection(request.collection);
    self.watch(key, request, class.into())
  }

  // Jobs

  /// Latest job runs, newest first.
  pub fn jobs(&self) -> Subscription {
    self.watch_collection(
      QueryKey::collection(Collection::Jobs),
      QueryRequest::new(Collection::Jobs)
        .order("started_at", false)
        .limit(JOB_LIST_LIMIT),
    )
  }

  pub fn job(&self, id: i64) -> Subscription {
    self.watch(
      QueryKey::collection(Collection::Jobs).with("detail").with(id.to_string()),
      QueryRequest::new(Collection::Jobs).eq("id", id),
      QueryOptions::new(PolicyClass::Etl).enabled(id > 0),
    )
  }

  pub fn job_stats(&self) -> Subscription {
    self.watch_collection(QueryKey::summary(Collection::Jobs), QueryRequest::new(Collection::Jobs))
  }

  // Data quality

  pub fn quality_metrics(&self) -> Subscription {
    self.watch_collection(
      QueryKey::collection(Collection::QualityMetrics),
      QueryRequest::new(Collection::QualityMetrics).order("table_name", true),
    )
  }

  /// Metrics of one table. Disabled while `table` is blank.
  pub fn quality_by_table(&self, table: &str) -> Subscription {
    self.watch(
      QueryKey::collection(Collection::QualityMetrics).with("table").with(table),
      QueryRequest::new(Collection::QualityMetrics)
        .eq("table_name", table)
        .order("metric_name", true),
      QueryOptions::new(PolicyClass::Realtime).enabled(!table.trim().is_empty()),
    )
  }

  pub fn quality_summary(&self) -> Subscription {
    self.watch_collection(
      QueryKey::summary(Collection::QualityMetrics),
      QueryRequest::new(Collection::QualityMetrics),
    )
  }

  // Alerts

  pub fn alerts(&self) -> Subscription {
    self.watch_collection(
      QueryKey::collection(Collection::Alerts),
      QueryRequest::new(Collection::Alerts)
        .order("created_at", false)
        .limit(ALERT_LIST_LIMIT),
    )
  }

  pub fn alerts_with_status(&self, status: AlertStatus) -> Subscription {
    let name = alert_status_name(status);
    self.watch_collection(
      QueryKey::collection(Collection::Alerts).with("status").with(name),
      QueryRequest::new(Collection::Alerts)
        .eq("status", name)
        .order("created_at", false)
        .limit(ALERT_LIST_LIMIT),
    )
  }

  pub fn alert_summary(&self) -> Subscription {
    self.watch_collection(QueryKey::summary(Collection::Alerts), QueryRequest::new(Collection::Alerts))
  }

  // System metrics

  pub fn system_metrics(&self) -> Subscription {
    self.watch_collection(
      QueryKey::collection(Collection::SystemMetrics),
      QueryRequest::new(Collection::SystemMetrics)
        .order("timestamp", false)
        .limit(METRIC_LIST_LIMIT),
    )
  }

  /// Samples of one metric, newest first.
  pub fn system_metric(&self, name: &str) -> Subscription {
    self.watch(
      QueryKey::collection(Collection::SystemMetrics).with("metric").with(name),
      QueryRequest::new(Collection::SystemMetrics)
        .eq("metric_name", name)
        .order("timestamp", false)
        .limit(METRIC_LIST_LIMIT),
      QueryOptions::new(PolicyClass::Realtime).enabled(!name.trim().is_empty()),
    )
  }

  /// Health derived from the most recent samples; the window comes from
  /// the cache's health policy.
  pub fn system_health(&self) -> Subscription {
    let window = self.cache.health_policy().window;
    self.watch_collection(
      QueryKey::summary(Collection::SystemMetrics),
      QueryRequest::new(Collection::SystemMetrics)
        .order("timestamp", false)
        .limit(window),
    )
  }

  // Users

  /// Profile of one user. Disabled while `user_id` is blank.
  pub fn profile(&self, user_id: &str) -> Subscription {
    self.watch(
      QueryKey::collection(Collection::Profiles).with("detail").with(user_id),
      QueryRequest::new(Collection::Profiles).eq("id", user_id),
      QueryOptions::new(PolicyClass::User).enabled(!user_id.trim().is_empty()),
    )
  }

  pub fn activities(&self, user_id: &str) -> Subscription {
    self.watch(
      QueryKey::collection(Collection::Activities).with("user").with(user_id),
      QueryRequest::new(Collection::Activities)
        .eq("user_id", user_id)
        .order("timestamp", false)
        .limit(ACTIVITY_LIMIT),
      QueryOptions::new(PolicyClass::User).enabled(!user_id.trim().is_empty()),
    )
  }

  /// Directory of every user, newest first. Read once and kept until
  /// invalidated.
  pub fn all_users(&self) -> Subscription {
    self.watch(
      QueryKey::collection(Collection::Profiles),
      QueryRequest::new(Collection::Profiles).order("created_at", false),
      PolicyClass::Static.into(),
    )
  }

  // Reference data

  pub fn countries(&self) -> Subscription {
    self.reference(Collection::Countries)
  }

  pub fn leagues(&self) -> Subscription {
    self.reference(Collection::Leagues)
  }

  pub fn seasons(&self) -> Subscription {
    self.reference(Collection::Seasons)
  }

  fn reference(&self, collection: Collection) -> Subscription {
    self.watch_collection(
      QueryKey::collection(collection),
      QueryRequest::new(collection).order("name", true),
    )
  }

  /// How many countries, leagues, seasons and fixtures the store holds.
  /// The four collections are read concurrently and the entry keeps the
  /// counts until invalidated.
  pub fn reference_counts(&self) -> Subscription {
    let remote = self.remote.clone();
    let fetch = fetcher(move || {
      let remote = remote.clone();
      async move {
        let reads = REFERENCE_COLLECTIONS
          .into_iter()
          .map(|collection| remote.query(QueryRequest::new(collection)));
        let rows: Vec<RawRecord> = try_join_all(reads).await?.into_iter().flatten().collect();
        Ok::<_, RemoteError>(rows)
      }
    });
    self
      .cache
      .subscribe(QueryKey::reference_counts(), fetch, PolicyClass::Static.into())
  }

  pub fn recent_fixtures(&self, limit: usize) -> Subscription {
    self.watch_collection(
      QueryKey::collection(Collection::Fixtures).with("recent").with(limit.to_string()),
      QueryRequest::new(Collection::Fixtures)
        .order("starting_at", false)
        .limit(limit),
    )
  }

  // Mutations

  pub async fn acknowledge_alert(&self, id: i64, actor: &str) -> Result<AlertRecord, MutationError> {
    self.mutations.acknowledge_alert(id, actor).await
  }

  pub async fn resolve_alert(&self, id: i64, actor: &str) -> Result<AlertRecord, MutationError> {
    self.mutations.resolve_alert(id, actor).await
  }

  pub async fn cancel_job(&self, id: i64) -> Result<JobRecord, MutationError> {
    self.mutations.cancel_job(id).await
  }

  pub async fn run_job(&self, name: &str) -> Result<JobRecord, MutationError> {
    self.mutations.run_job(name).await
  }

  pub async fn update_profile(
    &self,
    user_id: &str,
    patch: ProfilePatch,
  ) -> Result<ProfileRecord, MutationError> {
    self.mutations.update_profile(user_id, patch).await
  }
}

fn alert_status_name(status: AlertStatus) -> &'static str {
  match status {
    AlertStatus::Active => "active",
    AlertStatus::Acknowledged => "acknowledged",
    AlertStatus::Resolved => "resolved",
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::aggregate::HealthStatus;
  use crate::cache::QueryStatus;
  use crate::remote::MemorySource;
  use chrono::Utc;
  use serde_json::json;
  use std::time::Duration;
  use tokio::time;

  fn dashboard() -> (Dashboard, Arc<MemorySource>) {
    let source = Arc::new(MemorySource::demo(Utc::now()).with_latency(Duration::from_millis(50)));
    (Dashboard::new(QueryCache::new(), source.clone()), source)
  }

  async fn settled(sub: &mut Subscription) {
    sub
      .wait_for(|e| e.status == QueryStatus::Success)
      .await
      .unwrap();
  }

  #[tokio::test(start_paused = true)]
  async fn test_two_views_share_one_query() {
    let (dashboard, source) = dashboard();
    let mut first = dashboard.alerts();
    let mut second = dashboard.alerts();
    settled(&mut first).await;
    settled(&mut second).await;

    assert_eq!(source.query_count(Collection::Alerts), 1);
    assert_eq!(first.data(), second.data());
    assert_eq!(first.data().unwrap().rows().unwrap().len(), 4);
  }

  #[tokio::test(start_paused = true)]
  async fn test_polling_stops_after_last_view_leaves() {
    let (dashboard, source) = dashboard();
    let mut view = dashboard.system_metrics();
    settled(&mut view).await;

    time::sleep(Duration::from_millis(5_100)).await;
    assert_eq!(source.query_count(Collection::SystemMetrics), 2);

    drop(view);
    assert!(!dashboard.cache().is_polling(&QueryKey::collection(Collection::SystemMetrics)));
    time::sleep(Duration::from_secs(30)).await;
    assert_eq!(source.query_count(Collection::SystemMetrics), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_summaries_are_derived() {
    let (dashboard, _source) = dashboard();
    let mut jobs = dashboard.job_stats();
    let mut alerts = dashboard.alert_summary();
    let mut health = dashboard.system_health();
    settled(&mut jobs).await;
    settled(&mut alerts).await;
    settled(&mut health).await;

    let stats = jobs.data().unwrap();
    let stats = stats.job_stats().unwrap();
    assert_eq!(stats.total_jobs, 4);
    assert_eq!(stats.failed_jobs, 1);
    assert_eq!(stats.running_jobs, 1);

    let summary = alerts.data().unwrap();
    assert_eq!(summary.alert_summary().unwrap().active_alerts, 2);

    let health = health.data().unwrap();
    assert_eq!(health.system_health().unwrap().overall_status, HealthStatus::Warning);
  }

  #[tokio::test(start_paused = true)]
  async fn test_blank_identifiers_disable_queries() {
    let (dashboard, source) = dashboard();
    let profile = dashboard.profile("");
    let table = dashboard.quality_by_table("  ");
    time::sleep(Duration::from_secs(120)).await;

    assert_eq!(profile.status(), QueryStatus::Idle);
    assert_eq!(table.status(), QueryStatus::Idle);
    assert_eq!(source.query_count(Collection::Profiles), 0);
    assert_eq!(source.query_count(Collection::QualityMetrics), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_filtered_and_reference_queries() {
    let (dashboard, _source) = dashboard();
    let mut fixtures_table = dashboard.quality_by_table("fixtures");
    let mut countries = dashboard.countries();
    let mut active = dashboard.alerts_with_status(AlertStatus::Active);
    settled(&mut fixtures_table).await;
    settled(&mut countries).await;
    settled(&mut active).await;

    let metrics = fixtures_table.data().unwrap();
    let names: Vec<_> = metrics
      .rows()
      .unwrap()
      .iter()
      .map(|r| r.as_quality_metric().unwrap().metric_name.clone())
      .collect();
    assert_eq!(names, vec!["completeness", "freshness"]);

    let countries = countries.data().unwrap();
    assert_eq!(countries.rows().unwrap().len(), 3);
    assert_eq!(active.data().unwrap().rows().unwrap().len(), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_reference_counts_cover_all_reference_collections() {
    let (dashboard, source) = dashboard();
    let mut counts = dashboard.reference_counts();
    settled(&mut counts).await;

    let data = counts.data().unwrap();
    let counts = data.reference_counts().unwrap();
    assert_eq!((counts.countries, counts.leagues, counts.seasons, counts.fixtures), (3, 2, 1, 2));
    assert_eq!(source.query_count(Collection::Fixtures), 1);

    // Reference data is read once.
    time::sleep(Duration::from_secs(600)).await;
    let again = dashboard.reference_counts();
    assert_eq!(again.status(), QueryStatus::Success);
    assert_eq!(source.query_count(Collection::Countries), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_reference_counts_failure_is_reported() {
    let (dashboard, source) = dashboard();
    source.fail_queries(Collection::Seasons, RemoteError::Auth("rls".into()));
    let mut counts = dashboard.reference_counts();
    let entry = counts.wait_for(|e| e.status == QueryStatus::Error).await.unwrap();
    assert_eq!(entry.last_error, Some(RemoteError::Auth("rls".into())));
  }

  #[tokio::test(start_paused = true)]
  async fn test_acknowledge_reconciles_list_and_summary() {
    let (dashboard, source) = dashboard();
    let mut list = dashboard.alerts();
    let mut summary = dashboard.alert_summary();
    settled(&mut list).await;
    settled(&mut summary).await;

    let alert = dashboard.acknowledge_alert(1, "ops").await.unwrap();
    assert_eq!(alert.status, AlertStatus::Acknowledged);

    summary
      .wait_for(|e| e.status == QueryStatus::Success && !e.is_invalidated())
      .await
      .unwrap();
    let counts = summary.data().unwrap();
    assert_eq!(counts.alert_summary().unwrap().active_alerts, 1);
    assert_eq!(counts.alert_summary().unwrap().acknowledged_alerts, 2);
    assert_eq!(source.rows(Collection::Alerts)[0]["acknowledged_by"], json!("ops"));
  }
}
