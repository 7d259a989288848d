//! Query keys and the data views stored under them.

use std::fmt;
use std::sync::Arc;

use crate::aggregate::{
  self, AlertSummary, HealthPolicy, JobStats, QualitySummary, ReferenceCounts, SystemHealth,
};
use crate::model::{Collection, RawRecord};

const SUMMARY_SEGMENT: &str = "summary";
const STATS_SEGMENT: &str = "stats";

/// Ordered tuple of strings addressing one cacheable query.
///
/// The first segment names the collection the query reads from. A
/// two-segment key ending in `summary` addresses the derived summary of that
/// collection. The single segment `stats` addresses the reference data
/// counts, which read several collections. Any other key addresses a row
/// set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryKey(Vec<String>);

impl QueryKey {
  pub fn new<I, S>(segments: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self(segments.into_iter().map(Into::into).collect())
  }

  /// Key of the unfiltered row set of a collection, also the prefix of every
  /// key reading that collection.
  pub fn collection(collection: Collection) -> Self {
    Self(vec![collection.as_str().to_string()])
  }

  /// Key of the derived summary of a collection.
  pub fn summary(collection: Collection) -> Self {
    Self::collection(collection).with(SUMMARY_SEGMENT)
  }

  /// Key of the reference data counts.
  pub fn reference_counts() -> Self {
    Self(vec![STATS_SEGMENT.to_string()])
  }

  pub fn with(mut self, segment: impl Into<String>) -> Self {
    self.0.push(segment.into());
    self
  }

  pub fn segments(&self) -> &[String] {
    &self.0
  }

  pub fn collection_name(&self) -> Option<Collection> {
    self.0.first().and_then(|s| Collection::parse(s))
  }

  pub fn is_reference_counts(&self) -> bool {
    self.0.len() == 1 && self.0[0] == STATS_SEGMENT
  }

  pub fn is_summary(&self) -> bool {
    self.0.len() == 2 && self.0[1] == SUMMARY_SEGMENT
  }

  /// Whether the key covers every row of its collection (the plain list or
  /// the summary), as opposed to a filtered or single-record query.
  pub fn is_collection_wide(&self) -> bool {
    self.0.len() == 1 || self.is_summary()
  }

  pub fn starts_with(&self, prefix: &QueryKey) -> bool {
    self.0.starts_with(&prefix.0)
  }
}

impl fmt::Display for QueryKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "[{}]", self.0.join(", "))
  }
}

/// Data held by a cache entry: a row set, or a summary derived from one.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryData {
  Rows(Arc<Vec<RawRecord>>),
  JobStats(JobStats),
  Quality(QualitySummary),
  Health(SystemHealth),
  Alerts(AlertSummary),
  ReferenceCounts(ReferenceCounts),
}

impl QueryData {
  /// Build the view a key exposes over a row set.
  pub fn derive(key: &QueryKey, rows: Arc<Vec<RawRecord>>, health: &HealthPolicy) -> Self {
    if key.is_reference_counts() {
      return QueryData::ReferenceCounts(aggregate::reference_counts(rows.iter()));
    }
    if !key.is_summary() {
      return QueryData::Rows(rows);
    }

    match key.collection_name() {
      Some(Collection::Jobs) => {
        QueryData::JobStats(aggregate::job_stats(rows.iter().filter_map(RawRecord::as_job)))
      }
      Some(Collection::QualityMetrics) => QueryData::Quality(aggregate::quality_summary(
        rows.iter().filter_map(RawRecord::as_quality_metric),
      )),
      Some(Collection::SystemMetrics) => QueryData::Health(aggregate::system_health(
        rows.iter().filter_map(RawRecord::as_system_metric),
        health,
      )),
      Some(Collection::Alerts) => {
        QueryData::Alerts(aggregate::alert_summary(rows.iter().filter_map(RawRecord::as_alert)))
      }
      _ => QueryData::Rows(rows),
    }
  }

  pub fn rows(&self) -> Option<&[RawRecord]> {
    match self {
      QueryData::Rows(rows) => Some(rows),
      _ => None,
    }
  }

  pub fn job_stats(&self) -> Option<&JobStats> {
    match self {
      QueryData::JobStats(s) => Some(s),
      _ => None,
    }
  }

  pub fn quality_summary(&self) -> Option<&QualitySummary> {
    match self {
      QueryData::Quality(s) => Some(s),
      _ => None,
    }
  }

  pub fn system_health(&self) -> Option<&SystemHealth> {
    match self {
      QueryData::Health(s) => Some(s),
      _ => None,
    }
  }

  pub fn alert_summary(&self) -> Option<&AlertSummary> {
    match self {
      QueryData::Alerts(s) => Some(s),
      _ => None,
    }
  }

  pub fn reference_counts(&self) -> Option<&ReferenceCounts> {
    match self {
      QueryData::ReferenceCounts(c) => Some(c),
      _ => None,
    }
  }
}
