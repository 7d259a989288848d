//! Raw record types as stored by the remote data source.
//!
//! Records are immutable snapshots. The cache never edits them in place;
//! optimistic edits produce patched copies that are layered on top.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// A remote collection the dashboard reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
  Jobs,
  QualityMetrics,
  Alerts,
  SystemMetrics,
  Profiles,
  Activities,
  Countries,
  Leagues,
  Seasons,
  Fixtures,
}

impl Collection {
  pub const ALL: [Collection; 10] = [
    Collection::Jobs,
    Collection::QualityMetrics,
    Collection::Alerts,
    Collection::SystemMetrics,
    Collection::Profiles,
    Collection::Activities,
    Collection::Countries,
    Collection::Leagues,
    Collection::Seasons,
    Collection::Fixtures,
  ];

  pub fn as_str(self) -> &'static str {
    match self {
      Collection::Jobs => "jobs",
      Collection::QualityMetrics => "quality_metrics",
      Collection::Alerts => "alerts",
      Collection::SystemMetrics => "system_metrics",
      Collection::Profiles => "profiles",
      Collection::Activities => "activities",
      Collection::Countries => "countries",
      Collection::Leagues => "leagues",
      Collection::Seasons => "seasons",
      Collection::Fixtures => "fixtures",
    }
  }

  /// Table backing the collection in the remote database.
  pub fn table_name(self) -> &'static str {
    match self {
      Collection::Jobs => "etl_jobs",
      Collection::QualityMetrics => "data_quality_metrics",
      Collection::Profiles => "user_profiles",
      Collection::Activities => "user_activities",
      other => other.as_str(),
    }
  }

  pub fn parse(name: &str) -> Option<Self> {
    Self::ALL.into_iter().find(|c| c.as_str() == name)
  }

  /// Reference collections are read as-is, without a typed record or summary.
  pub fn is_reference(self) -> bool {
    matches!(
      self,
      Collection::Countries | Collection::Leagues | Collection::Seasons | Collection::Fixtures
    )
  }
}

impl fmt::Display for Collection {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Identifier of a record within its collection.
///
/// Numeric and textual ids are both carried as strings so that every
/// collection shares one key type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId(String);

impl RecordId {
  pub fn new(id: impl Into<String>) -> Self {
    Self(id.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl From<i64> for RecordId {
  fn from(id: i64) -> Self {
    Self(id.to_string())
  }
}

impl From<&str> for RecordId {
  fn from(id: &str) -> Self {
    Self(id.to_string())
  }
}

impl fmt::Display for RecordId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// A record addressed by collection and id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordRef {
  pub collection: Collection,
  pub id: RecordId,
}

impl RecordRef {
  pub fn new(collection: Collection, id: impl Into<RecordId>) -> Self {
    Self {
      collection,
      id: id.into(),
    }
  }
}

impl fmt::Display for RecordRef {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}", self.collection, self.id)
  }
}

// ============================================================================
// Jobs
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
  Running,
  Completed,
  Failed,
  Pending,
}

/// One ETL job run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
  pub id: i64,
  pub name: String,
  pub status: JobStatus,
  pub started_at: DateTime<Utc>,
  #[serde(default)]
  pub completed_at: Option<DateTime<Utc>>,
  /// Seconds
  #[serde(default)]
  pub duration: Option<f64>,
  #[serde(default)]
  pub records_processed: Option<u64>,
  #[serde(default)]
  pub error_message: Option<String>,
}

// ============================================================================
// Data quality
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityStatus {
  Pass,
  Fail,
  Warning,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityMetricRecord {
  pub id: i64,
  pub table_name: String,
  pub metric_name: String,
  pub value: f64,
  pub threshold: f64,
  pub status: QualityStatus,
  pub last_checked: DateTime<Utc>,
  #[serde(default)]
  pub description: Option<String>,
}

// ============================================================================
// Alerts
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
  Critical,
  High,
  Medium,
  Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
  Active,
  Acknowledged,
  Resolved,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
  pub id: i64,
  pub title: String,
  #[serde(default)]
  pub message: String,
  pub severity: Severity,
  pub status: AlertStatus,
  #[serde(default)]
  pub acknowledged: bool,
  #[serde(default)]
  pub acknowledged_by: Option<String>,
  #[serde(default)]
  pub acknowledged_at: Option<DateTime<Utc>>,
  #[serde(default)]
  pub resolved_by: Option<String>,
  #[serde(default)]
  pub resolved_at: Option<DateTime<Utc>>,
  #[serde(default)]
  pub source: Option<String>,
  pub created_at: DateTime<Utc>,
}

// ============================================================================
// System metrics
// ============================================================================

/// One sample of a named system metric (cpu_usage, memory_usage, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemMetricRecord {
  pub id: i64,
  pub metric_name: String,
  pub value: f64,
  #[serde(default)]
  pub unit: Option<String>,
  pub timestamp: DateTime<Utc>,
}

// ============================================================================
// Users
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
  Admin,
  User,
  Viewer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
  Light,
  Dark,
  #[default]
  Auto,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preferences {
  #[serde(default)]
  pub theme: Theme,
  #[serde(default = "default_notifications")]
  pub notifications: bool,
  #[serde(default = "default_language")]
  pub language: String,
}

fn default_notifications() -> bool {
  true
}

fn default_language() -> String {
  "en".to_string()
}

impl Default for Preferences {
  fn default() -> Self {
    Self {
      theme: Theme::default(),
      notifications: default_notifications(),
      language: default_language(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileRecord {
  pub id: String,
  pub email: String,
  pub name: String,
  #[serde(default)]
  pub avatar_url: Option<String>,
  pub role: Role,
  pub created_at: DateTime<Utc>,
  #[serde(default)]
  pub last_login: Option<DateTime<Utc>>,
  #[serde(default)]
  pub preferences: Preferences,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRecord {
  pub id: i64,
  pub user_id: String,
  pub action: String,
  pub resource: String,
  pub timestamp: DateTime<Utc>,
  #[serde(default)]
  pub ip_address: Option<String>,
  #[serde(default)]
  pub user_agent: Option<String>,
}

/// Row of a reference collection (countries, leagues, ...), kept untyped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceRecord {
  pub collection: Collection,
  pub fields: serde_json::Map<String, Value>,
}

impl ReferenceRecord {
  pub fn id(&self) -> RecordId {
    match self.fields.get("id") {
      Some(Value::String(s)) => RecordId::new(s.clone()),
      Some(other) => RecordId::new(other.to_string()),
      None => RecordId::new(""),
    }
  }
}

// ============================================================================
// RawRecord
// ============================================================================

/// Any record the remote data source can return.
#[derive(Debug, Clone, PartialEq)]
pub enum RawRecord {
  Job(JobRecord),
  QualityMetric(QualityMetricRecord),
  Alert(AlertRecord),
  SystemMetric(SystemMetricRecord),
  Profile(ProfileRecord),
  Activity(ActivityRecord),
  Reference(ReferenceRecord),
}

impl RawRecord {
  /// Decode a JSON row of the given collection.
  pub fn from_row(collection: Collection, row: Value) -> Result<Self, serde_json::Error> {
    Ok(match collection {
      Collection::Jobs => RawRecord::Job(serde_json::from_value(row)?),
      Collection::QualityMetrics => RawRecord::QualityMetric(serde_json::from_value(row)?),
      Collection::Alerts => RawRecord::Alert(serde_json::from_value(row)?),
      Collection::SystemMetrics => RawRecord::SystemMetric(serde_json::from_value(row)?),
      Collection::Profiles => RawRecord::Profile(serde_json::from_value(row)?),
      Collection::Activities => RawRecord::Activity(serde_json::from_value(row)?),
      Collection::Countries | Collection::Leagues | Collection::Seasons | Collection::Fixtures => {
        RawRecord::Reference(ReferenceRecord {
          collection,
          fields: serde_json::from_value(row)?,
        })
      }
    })
  }

  /// Encode back into the JSON row shape used by the remote store.
  pub fn to_row(&self) -> Result<Value, serde_json::Error> {
    match self {
      RawRecord::Job(r) => serde_json::to_value(r),
      RawRecord::QualityMetric(r) => serde_json::to_value(r),
      RawRecord::Alert(r) => serde_json::to_value(r),
      RawRecord::SystemMetric(r) => serde_json::to_value(r),
      RawRecord::Profile(r) => serde_json::to_value(r),
      RawRecord::Activity(r) => serde_json::to_value(r),
      RawRecord::Reference(r) => Ok(Value::Object(r.fields.clone())),
    }
  }

  pub fn collection(&self) -> Collection {
    match self {
      RawRecord::Job(_) => Collection::Jobs,
      RawRecord::QualityMetric(_) => Collection::QualityMetrics,
      RawRecord::Alert(_) => Collection::Alerts,
      RawRecord::SystemMetric(_) => Collection::SystemMetrics,
      RawRecord::Profile(_) => Collection::Profiles,
      RawRecord::Activity(_) => Collection::Activities,
      RawRecord::Reference(r) => r.collection,
    }
  }

  pub fn id(&self) -> RecordId {
    match self {
      RawRecord::Job(r) => r.id.into(),
      RawRecord::QualityMetric(r) => r.id.into(),
      RawRecord::Alert(r) => r.id.into(),
      RawRecord::SystemMetric(r) => r.id.into(),
      RawRecord::Profile(r) => RecordId::new(r.id.clone()),
      RawRecord::Activity(r) => r.id.into(),
      RawRecord::Reference(r) => r.id(),
    }
  }

  pub fn record_ref(&self) -> RecordRef {
    RecordRef {
      collection: self.collection(),
      id: self.id(),
    }
  }

  pub fn as_job(&self) -> Option<&JobRecord> {
    match self {
      RawRecord::Job(r) => Some(r),
      _ => None,
    }
  }

  pub fn as_alert(&self) -> Option<&AlertRecord> {
    match self {
      RawRecord::Alert(r) => Some(r),
      _ => None,
    }
  }

  pub fn as_quality_metric(&self) -> Option<&QualityMetricRecord> {
    match self {
      RawRecord::QualityMetric(r) => Some(r),
      _ => None,
    }
  }

  pub fn as_system_metric(&self) -> Option<&SystemMetricRecord> {
    match self {
      RawRecord::SystemMetric(r) => Some(r),
      _ => None,
    }
  }

  pub fn as_profile(&self) -> Option<&ProfileRecord> {
    match self {
      RawRecord::Profile(r) => Some(r),
      _ => None,
    }
  }
}
