//! Summary views derived from raw record sets.
//!
//! Everything here is pure: the same input slice always yields the same
//! summary, and summaries are only ever rebuilt from scratch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{
  AlertRecord, AlertStatus, Collection, JobRecord, JobStatus, QualityMetricRecord, QualityStatus,
  RawRecord, Severity, SystemMetricRecord,
};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JobStats {
  pub total_jobs: usize,
  pub successful_jobs: usize,
  pub failed_jobs: usize,
  pub running_jobs: usize,
  /// Mean duration in seconds, 0 when there are no jobs
  pub avg_duration: f64,
  pub total_records: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QualitySummary {
  pub total_metrics: usize,
  pub passing_metrics: usize,
  pub failing_metrics: usize,
  pub warning_metrics: usize,
  /// Percentage of passing metrics, 0 when there are none
  pub overall_score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
  #[default]
  Healthy,
  Warning,
  Critical,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SystemHealth {
  pub cpu_usage: f64,
  pub memory_usage: f64,
  pub disk_usage: f64,
  pub network_latency: f64,
  pub database_connections: f64,
  pub overall_status: HealthStatus,
  /// Timestamp of the newest sample considered
  pub sampled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AlertSummary {
  pub total_alerts: usize,
  pub active_alerts: usize,
  pub acknowledged_alerts: usize,
  pub resolved_alerts: usize,
  pub critical_alerts: usize,
  pub high_alerts: usize,
  pub medium_alerts: usize,
  pub low_alerts: usize,
}

/// Row counts of the reference collections.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReferenceCounts {
  pub countries: usize,
  pub leagues: usize,
  pub seasons: usize,
  pub fixtures: usize,
}

/// Thresholds and sample window used to classify system health.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct HealthPolicy {
  /// cpu/memory/disk strictly above this is a warning
  pub warning_threshold: f64,
  /// cpu/memory/disk strictly above this is critical
  pub critical_threshold: f64,
  /// Number of most recent samples considered
  pub window: usize,
}

impl Default for HealthPolicy {
  fn default() -> Self {
    Self {
      warning_threshold: 80.0,
      critical_threshold: 90.0,
      window: 10,
    }
  }
}

pub fn job_stats<'a>(jobs: impl IntoIterator<Item = &'a JobRecord>) -> JobStats {
  let mut stats = JobStats::default();
  let mut durations = Vec::new();

  for job in jobs {
    stats.total_jobs += 1;
    match job.status {
      JobStatus::Completed => stats.successful_jobs += 1,
      JobStatus::Failed => stats.failed_jobs += 1,
      JobStatus::Running => stats.running_jobs += 1,
      JobStatus::Pending => {}
    }
    durations.push(job.duration.filter(|d| d.is_finite()).unwrap_or(0.0));
    stats.total_records = stats
      .total_records
      .saturating_add(job.records_processed.unwrap_or(0));
  }

  // Dividing before summing keeps the mean finite for huge durations.
  stats.avg_duration = if stats.total_jobs > 0 {
    let total = stats.total_jobs as f64;
    durations.iter().map(|d| d / total).sum()
  } else {
    0.0
  };
  stats
}

pub fn quality_summary<'a>(
  metrics: impl IntoIterator<Item = &'a QualityMetricRecord>,
) -> QualitySummary {
  let mut summary = QualitySummary::default();

  for metric in metrics {
    summary.total_metrics += 1;
    match metric.status {
      QualityStatus::Pass => summary.passing_metrics += 1,
      QualityStatus::Fail => summary.failing_metrics += 1,
      QualityStatus::Warning => summary.warning_metrics += 1,
    }
  }

  summary.overall_score = if summary.total_metrics > 0 {
    summary.passing_metrics as f64 / summary.total_metrics as f64 * 100.0
  } else {
    0.0
  };
  summary
}

pub fn system_health<'a>(
  samples: impl IntoIterator<Item = &'a SystemMetricRecord>,
  policy: &HealthPolicy,
) -> SystemHealth {
  // Newest first; among equal timestamps the later input comes first.
  let mut ordered: Vec<(usize, &SystemMetricRecord)> = samples.into_iter().enumerate().collect();
  ordered.sort_by(|(ia, a), (ib, b)| b.timestamp.cmp(&a.timestamp).then(ib.cmp(ia)));
  ordered.truncate(policy.window);

  let latest = |name: &str| {
    ordered
      .iter()
      .find(|(_, s)| s.metric_name == name)
      .map(|(_, s)| s.value)
      .unwrap_or(0.0)
  };

  let mut health = SystemHealth {
    cpu_usage: latest("cpu_usage"),
    memory_usage: latest("memory_usage"),
    disk_usage: latest("disk_usage"),
    network_latency: latest("network_latency"),
    database_connections: latest("database_connections"),
    overall_status: HealthStatus::Healthy,
    sampled_at: ordered.first().map(|(_, s)| s.timestamp),
  };

  let watched = [health.cpu_usage, health.memory_usage, health.disk_usage];
  health.overall_status = if watched.iter().any(|v| *v > policy.critical_threshold) {
    HealthStatus::Critical
  } else if watched.iter().any(|v| *v > policy.warning_threshold) {
    HealthStatus::Warning
  } else {
    HealthStatus::Healthy
  };
  health
}

pub fn alert_summary<'a>(alerts: impl IntoIterator<Item = &'a AlertRecord>) -> AlertSummary {
  let mut summary = AlertSummary::default();

  for alert in alerts {
    summary.total_alerts += 1;
    match alert.status {
      AlertStatus::Active => summary.active_alerts += 1,
      AlertStatus::Acknowledged => summary.acknowledged_alerts += 1,
      AlertStatus::Resolved => summary.resolved_alerts += 1,
    }
    match alert.severity {
      Severity::Critical => summary.critical_alerts += 1,
      Severity::High => summary.high_alerts += 1,
      Severity::Medium => summary.medium_alerts += 1,
      Severity::Low => summary.low_alerts += 1,
    }
  }
  summary
}

/// Count records per reference collection. Other records are ignored.
pub fn reference_counts<'a>(records: impl IntoIterator<Item = &'a RawRecord>) -> ReferenceCounts {
  let mut counts = ReferenceCounts::default();
  for record in records {
    match record.collection() {
      Collection::Countries => counts.countries += 1,
      Collection::Leagues => counts.leagues += 1,
      Collection::Seasons => counts.seasons += 1,
      Collection::Fixtures => counts.fixtures += 1,
      _ => {}
    }
  }
  counts
}

#[cfg(test)]
pub(crate) mod fixtures {
  use super::*;
  use chrono::TimeZone;

  pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
  }

  pub fn job(id: i64, status: JobStatus, duration: Option<f64>, records: Option<u64>) -> JobRecord {
    JobRecord {
      id,
      name: format!("job_{}", id),
      status,
      started_at: at(id),
      completed_at: None,
      duration,
      records_processed: records,
      error_message: None,
    }
  }

  pub fn alert(id: i64, status: AlertStatus, severity: Severity) -> AlertRecord {
    AlertRecord {
      id,
      title: format!("alert {}", id),
      message: String::new(),
      severity,
      status,
      acknowledged: status != AlertStatus::Active,
      acknowledged_by: None,
      acknowledged_at: None,
      resolved_by: None,
      resolved_at: None,
      source: None,
      created_at: at(id),
    }
  }

  pub fn sample(id: i64, name: &str, value: f64, secs: i64) -> SystemMetricRecord {
    SystemMetricRecord {
      id,
      metric_name: name.to_string(),
      value,
      unit: None,
      timestamp: at(secs),
    }
  }

  pub fn quality(id: i64, status: QualityStatus) -> QualityMetricRecord {
    QualityMetricRecord {
      id,
      table_name: "fixtures".to_string(),
      metric_name: format!("metric_{}", id),
      value: 1.0,
      threshold: 1.0,
      status,
      last_checked: at(id),
      description: None,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::fixtures::*;
  use super::*;
  use proptest::prelude::*;

  #[test]
  fn test_job_stats_empty_is_zero() {
    let stats = job_stats(&Vec::<JobRecord>::new());
    assert_eq!(stats, JobStats::default());
    assert_eq!(stats.avg_duration, 0.0);
  }

  #[test]
  fn test_job_stats_counts_and_average() {
    let jobs = vec![
      job(1, JobStatus::Completed, Some(10.0), Some(100)),
      job(2, JobStatus::Failed, None, Some(5)),
      job(3, JobStatus::Running, Some(20.0), None),
      job(4, JobStatus::Pending, None, None),
    ];

    let stats = job_stats(&jobs);
    assert_eq!(stats.total_jobs, 4);
    assert_eq!(stats.successful_jobs, 1);
    assert_eq!(stats.failed_jobs, 1);
    assert_eq!(stats.running_jobs, 1);
    assert_eq!(stats.avg_duration, 7.5);
    assert_eq!(stats.total_records, 105);
  }

  #[test]
  fn test_job_stats_record_total_saturates() {
    let jobs = vec![
      job(1, JobStatus::Completed, None, Some(u64::MAX)),
      job(2, JobStatus::Completed, None, Some(1)),
      job(3, JobStatus::Completed, None, Some(u64::MAX - 5)),
    ];
    assert_eq!(job_stats(&jobs).total_records, u64::MAX);
  }

  #[test]
  fn test_quality_summary_score() {
    let metrics = vec![
      quality(1, QualityStatus::Pass),
      quality(2, QualityStatus::Pass),
      quality(3, QualityStatus::Fail),
      quality(4, QualityStatus::Warning),
    ];

    let summary = quality_summary(&metrics);
    assert_eq!(summary.passing_metrics, 2);
    assert_eq!(summary.failing_metrics, 1);
    assert_eq!(summary.warning_metrics, 1);
    assert_eq!(summary.overall_score, 50.0);
    assert_eq!(quality_summary(&Vec::<QualityMetricRecord>::new()).overall_score, 0.0);
  }

  #[test]
  fn test_system_health_thresholds_are_exclusive() {
    let policy = HealthPolicy::default();
    let status_for = |cpu: f64| system_health(&[sample(1, "cpu_usage", cpu, 0)], &policy).overall_status;

    assert_eq!(status_for(95.0), HealthStatus::Critical);
    assert_eq!(status_for(90.0), HealthStatus::Warning);
    assert_eq!(status_for(85.0), HealthStatus::Warning);
    assert_eq!(status_for(80.0), HealthStatus::Healthy);
    assert_eq!(status_for(12.0), HealthStatus::Healthy);
  }

  #[test]
  fn test_system_health_network_latency_does_not_escalate() {
    let samples = vec![
      sample(1, "network_latency", 250.0, 0),
      sample(2, "database_connections", 140.0, 0),
    ];
    let health = system_health(&samples, &HealthPolicy::default());
    assert_eq!(health.overall_status, HealthStatus::Healthy);
    assert_eq!(health.network_latency, 250.0);
    assert_eq!(health.cpu_usage, 0.0);
  }

  #[test]
  fn test_system_health_uses_latest_sample_in_window() {
    let mut samples = vec![
      sample(1, "cpu_usage", 99.0, 0),
      sample(2, "cpu_usage", 40.0, 5),
    ];
    // Ten newer memory samples push both cpu samples out of the window.
    for i in 0..10 {
      samples.push(sample(10 + i, "memory_usage", 50.0, 100 + i));
    }

    let health = system_health(&samples, &HealthPolicy::default());
    assert_eq!(health.cpu_usage, 0.0);
    assert_eq!(health.memory_usage, 50.0);
    assert_eq!(health.sampled_at, Some(at(109)));

    let health = system_health(&samples[..2], &HealthPolicy::default());
    assert_eq!(health.cpu_usage, 40.0);
  }

  #[test]
  fn test_system_health_ties_prefer_later_input() {
    let samples = vec![
      sample(1, "disk_usage", 95.0, 10),
      sample(2, "disk_usage", 30.0, 10),
    ];
    let health = system_health(&samples, &HealthPolicy::default());
    assert_eq!(health.disk_usage, 30.0);
    assert_eq!(health.overall_status, HealthStatus::Healthy);
  }

  #[test]
  fn test_system_health_custom_policy() {
    let policy = HealthPolicy {
      warning_threshold: 50.0,
      critical_threshold: 70.0,
      window: 3,
    };
    let health = system_health(&[sample(1, "memory_usage", 60.0, 0)], &policy);
    assert_eq!(health.overall_status, HealthStatus::Warning);
  }

  #[test]
  fn test_alert_summary_buckets() {
    let alerts = vec![
      alert(1, AlertStatus::Active, Severity::Critical),
      alert(2, AlertStatus::Active, Severity::Low),
      alert(3, AlertStatus::Acknowledged, Severity::High),
      alert(4, AlertStatus::Resolved, Severity::Medium),
    ];

    let summary = alert_summary(&alerts);
    assert_eq!(summary.total_alerts, 4);
    assert_eq!(summary.active_alerts, 2);
    assert_eq!(summary.acknowledged_alerts, 1);
    assert_eq!(summary.resolved_alerts, 1);
    assert_eq!(summary.critical_alerts, 1);
    assert_eq!(summary.low_alerts, 1);
  }

  fn job_status_strategy() -> impl Strategy<Value = JobStatus> {
    prop_oneof![
      Just(JobStatus::Running),
      Just(JobStatus::Completed),
      Just(JobStatus::Failed),
      Just(JobStatus::Pending),
    ]
  }

  fn alert_strategy() -> impl Strategy<Value = AlertRecord> {
    let status = prop_oneof![
      Just(AlertStatus::Active),
      Just(AlertStatus::Acknowledged),
      Just(AlertStatus::Resolved),
    ];
    let severity = prop_oneof![
      Just(Severity::Critical),
      Just(Severity::High),
      Just(Severity::Medium),
      Just(Severity::Low),
    ];
    (1i64..10_000, status, severity).prop_map(|(id, status, severity)| alert(id, status, severity))
  }

  #[test]
  fn test_reference_counts_per_collection() {
    let row = |collection, id: i64| {
      RawRecord::from_row(collection, serde_json::json!({ "id": id, "name": "x" })).unwrap()
    };
    let records = vec![
      row(Collection::Countries, 1),
      row(Collection::Countries, 2),
      row(Collection::Fixtures, 9),
      row(Collection::Seasons, 4),
      RawRecord::Job(job(1, JobStatus::Running, None, None)),
    ];

    let counts = reference_counts(&records);
    assert_eq!(
      counts,
      ReferenceCounts {
        countries: 2,
        leagues: 0,
        seasons: 1,
        fixtures: 1,
      }
    );
  }

  proptest! {
    #[test]
    fn prop_job_stats_bounded_and_finite(
      jobs in prop::collection::vec(
        (job_status_strategy(), prop::option::of(any::<f64>()), prop::option::of(any::<u64>())),
        0..64,
      )
    ) {
      let jobs: Vec<JobRecord> = jobs
        .into_iter()
        .enumerate()
        .map(|(i, (status, duration, records))| job(i as i64 + 1, status, duration, records))
        .collect();

      let stats = job_stats(&jobs);
      prop_assert!(stats.successful_jobs + stats.failed_jobs + stats.running_jobs <= stats.total_jobs);
      prop_assert!(stats.avg_duration.is_finite());
      let largest = jobs.iter().filter_map(|j| j.records_processed).max().unwrap_or(0);
      prop_assert!(stats.total_records >= largest);
      if stats.total_jobs == 0 {
        prop_assert_eq!(stats.avg_duration, 0.0);
      }
    }

    #[test]
    fn prop_alert_buckets_sum_to_total(alerts in prop::collection::vec(alert_strategy(), 0..64)) {
      let s = alert_summary(&alerts);
      prop_assert_eq!(s.total_alerts, alerts.len());
      prop_assert_eq!(s.active_alerts + s.acknowledged_alerts + s.resolved_alerts, s.total_alerts);
      prop_assert_eq!(s.critical_alerts + s.high_alerts + s.medium_alerts + s.low_alerts, s.total_alerts);
    }
  }
}
