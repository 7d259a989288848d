//! In-process remote store used by the demo command and by tests.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::BoxFuture;
use serde_json::{json, Map, Value};
use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::{MutationOp, QueryRequest, RemoteDataSource};
use crate::error::RemoteError;
use crate::model::{Collection, RawRecord};

/// Remote store backed by JSON rows held in memory.
///
/// Supports equality filters, ordering and limits like the real backend,
/// plus artificial latency, failure injection and call counters.
#[derive(Default)]
pub struct MemorySource {
  state: Mutex<MemoryState>,
  latency: Duration,
}

#[derive(Default)]
struct MemoryState {
  rows: HashMap<Collection, Vec<Value>>,
  query_failures: HashMap<Collection, RemoteError>,
  mutation_failures: VecDeque<RemoteError>,
  query_counts: HashMap<Collection, usize>,
  mutation_count: usize,
}

impl MemorySource {
  pub fn new() -> Self {
    Self::default()
  }

  /// Delay every call by `latency` before answering.
  pub fn with_latency(mut self, latency: Duration) -> Self {
    self.latency = latency;
    self
  }

  fn lock(&self) -> MutexGuard<'_, MemoryState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Append a raw row to a collection.
  pub fn push_row(&self, collection: Collection, row: Value) {
    self.lock().rows.entry(collection).or_default().push(row);
  }

  /// Append a typed record to its collection.
  pub fn push_record(&self, record: &RawRecord) -> Result<(), RemoteError> {
    let row = record.to_row()?;
    self.push_row(record.collection(), row);
    Ok(())
  }

  pub fn rows(&self, collection: Collection) -> Vec<Value> {
    self.lock().rows.get(&collection).cloned().unwrap_or_default()
  }

  /// Make every query on `collection` fail until cleared.
  pub fn fail_queries(&self, collection: Collection, error: RemoteError) {
    self.lock().query_failures.insert(collection, error);
  }

  pub fn clear_query_failure(&self, collection: Collection) {
    self.lock().query_failures.remove(&collection);
  }

  /// Make the next mutation fail with `error`.
  pub fn fail_next_mutation(&self, error: RemoteError) {
    self.lock().mutation_failures.push_back(error);
  }

  pub fn query_count(&self, collection: Collection) -> usize {
    self.lock().query_counts.get(&collection).copied().unwrap_or(0)
  }

  pub fn mutation_count(&self) -> usize {
    self.lock().mutation_count
  }

  fn run_query(&self, request: &QueryRequest) -> Result<Vec<RawRecord>, RemoteError> {
    let state = self.lock();
    if let Some(err) = state.query_failures.get(&request.collection) {
      return Err(err.clone());
    }

    let mut rows: Vec<&Value> = state
      .rows
      .get(&request.collection)
      .map(|rows| {
        rows
          .iter()
          .filter(|row| {
            request
              .filters
              .iter()
              .all(|f| column_matches(row, &f.column, &f.value))
          })
          .collect()
      })
      .unwrap_or_default();

    if let Some(order) = &request.order_by {
      rows.sort_by(|a, b| {
        let ordering = compare_values(&a[&order.column], &b[&order.column]);
        if order.ascending {
          ordering
        } else {
          ordering.reverse()
        }
      });
    }
    if let Some(limit) = request.limit {
      rows.truncate(limit);
    }

    rows
      .into_iter()
      .map(|row| RawRecord::from_row(request.collection, row.clone()).map_err(RemoteError::from))
      .collect()
  }

  fn run_mutation(
    &self,
    collection: Collection,
    op: MutationOp,
    payload: Value,
  ) -> Result<RawRecord, RemoteError> {
    let mut state = self.lock();
    if let Some(err) = state.mutation_failures.pop_front() {
      return Err(err);
    }
    let Value::Object(fields) = payload else {
      return Err(RemoteError::Unknown("payload must be a JSON object".to_string()));
    };

    let rows = state.rows.entry(collection).or_default();
    let row = match op {
      MutationOp::Insert => {
        let next_id = rows.iter().filter_map(|r| r["id"].as_i64()).max().unwrap_or(0) + 1;
        let mut row = Map::new();
        row.insert("id".to_string(), json!(next_id));
        row.extend(fields);
        rows.push(Value::Object(row));
        rows.last_mut()
      }
      MutationOp::Update { id } => {
        let row = rows
          .iter_mut()
          .find(|r| column_matches(r, "id", id.as_str()))
          .ok_or_else(|| RemoteError::NotFound(format!("{} {}", collection, id)))?;
        if let Value::Object(existing) = &mut *row {
          existing.extend(fields);
        }
        Some(row)
      }
    };

    let row = row.cloned().unwrap_or(Value::Null);
    RawRecord::from_row(collection, row).map_err(RemoteError::from)
  }

  /// A store seeded with a small, plausible dashboard dataset.
  pub fn demo(now: DateTime<Utc>) -> Self {
    let source = Self::new();
    let ago = |minutes: i64| now - ChronoDuration::minutes(minutes);

    let jobs = [
      (1, "fixtures_enrichment", "completed", 42.5, 15_320),
      (2, "teams_sync", "completed", 12.0, 2_410),
      (3, "events_backfill_2024", "failed", 95.2, 780),
      (4, "stages_collect", "running", 0.0, 0),
    ];
    for (id, name, status, duration, records) in jobs {
      source.push_row(
        Collection::Jobs,
        json!({
          "id": id,
          "name": name,
          "status": status,
          "started_at": ago(60 - id * 10),
          "duration": if status == "running" { Value::Null } else { json!(duration) },
          "records_processed": records,
          "error_message": if status == "failed" { json!("API rate limit exceeded") } else { Value::Null },
        }),
      );
    }

    let quality = [
      (1, "fixtures", "completeness", 98.2, 95.0, "pass"),
      (2, "fixtures", "freshness", 91.0, 95.0, "warning"),
      (3, "teams", "uniqueness", 100.0, 99.0, "pass"),
      (4, "events", "completeness", 71.4, 90.0, "fail"),
    ];
    for (id, table, metric, value, threshold, status) in quality {
      source.push_row(
        Collection::QualityMetrics,
        json!({
          "id": id,
          "table_name": table,
          "metric_name": metric,
          "value": value,
          "threshold": threshold,
          "status": status,
          "last_checked": ago(5),
        }),
      );
    }

    let alerts = [
      (1, "High memory usage", "Memory usage above 85%", "medium", "active"),
      (2, "ETL job failed", "events_backfill_2024 stopped after 780 records", "high", "active"),
      (3, "Slow API responses", "p95 latency above 800ms", "low", "acknowledged"),
      (4, "Disk cleanup done", "Old exports removed", "low", "resolved"),
    ];
    for (id, title, message, severity, status) in alerts {
      source.push_row(
        Collection::Alerts,
        json!({
          "id": id,
          "title": title,
          "message": message,
          "severity": severity,
          "status": status,
          "acknowledged": status != "active",
          "source": "monitor",
          "created_at": ago(30 - id * 5),
        }),
      );
    }

    let samples = [
      ("cpu_usage", 45.2, "%"),
      ("memory_usage", 86.1, "%"),
      ("disk_usage", 62.0, "%"),
      ("network_latency", 23.0, "ms"),
      ("database_connections", 18.0, "count"),
    ];
    for (i, (name, value, unit)) in samples.into_iter().enumerate() {
      source.push_row(
        Collection::SystemMetrics,
        json!({
          "id": i + 1,
          "metric_name": name,
          "value": value,
          "unit": unit,
          "timestamp": ago(1),
        }),
      );
    }

    source.push_row(
      Collection::Profiles,
      json!({
        "id": "demo-user",
        "email": "ops@example.com",
        "name": "Ops Demo",
        "role": "admin",
        "created_at": ago(60 * 24 * 30),
        "preferences": { "theme": "dark", "notifications": true, "language": "en" },
      }),
    );

    for (id, name) in [(1, "Brazil"), (2, "England"), (3, "Spain")] {
      source.push_row(Collection::Countries, json!({ "id": id, "name": name }));
    }
    for (id, name, country_id) in [(10, "Serie A", 1), (11, "Premier League", 2)] {
      source.push_row(
        Collection::Leagues,
        json!({ "id": id, "name": name, "country_id": country_id }),
      );
    }
    source.push_row(
      Collection::Seasons,
      json!({ "id": 100, "name": "2024/2025", "league_id": 11, "is_current": true }),
    );
    for (id, name, hours) in [(1000, "Arsenal vs Chelsea", 26), (1001, "Liverpool vs Everton", 2)] {
      source.push_row(
        Collection::Fixtures,
        json!({ "id": id, "name": name, "season_id": 100, "starting_at": ago(60 * hours) }),
      );
    }
    source
  }
}

impl RemoteDataSource for MemorySource {
  fn query(&self, request: QueryRequest) -> BoxFuture<'_, Result<Vec<RawRecord>, RemoteError>> {
    Box::pin(async move {
      *self.lock().query_counts.entry(request.collection).or_default() += 1;
      if !self.latency.is_zero() {
        tokio::time::sleep(self.latency).await;
      }
      self.run_query(&request)
    })
  }

  fn mutate(
    &self,
    collection: Collection,
    op: MutationOp,
    payload: Value,
  ) -> BoxFuture<'_, Result<RawRecord, RemoteError>> {
    Box::pin(async move {
      self.lock().mutation_count += 1;
      if !self.latency.is_zero() {
        tokio::time::sleep(self.latency).await;
      }
      self.run_mutation(collection, op, payload)
    })
  }
}

fn column_matches(row: &Value, column: &str, expected: &str) -> bool {
  match &row[column] {
    Value::String(s) => s == expected,
    Value::Null => false,
    other => other.to_string() == expected,
  }
}

/// Order JSON values the way a SQL backend would: numbers numerically,
/// strings lexically, nulls last.
fn compare_values(a: &Value, b: &Value) -> Ordering {
  match (a, b) {
    (Value::Number(x), Value::Number(y)) => {
      let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
      x.partial_cmp(&y).unwrap_or(Ordering::Equal)
    }
    (Value::String(x), Value::String(y)) => x.cmp(y),
    (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
    (Value::Null, Value::Null) => Ordering::Equal,
    (Value::Null, _) => Ordering::Greater,
    (_, Value::Null) => Ordering::Less,
    _ => Ordering::Equal,
  }
}
