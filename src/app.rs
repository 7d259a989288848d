use crate::event::{Event, EventHandler, Panel};
use chrono::Utc;
use color_eyre::Result;
use dashsync::aggregate::{AlertSummary, JobStats, QualitySummary, SystemHealth};
use dashsync::cache::{CacheEntry, QueryData};
use dashsync::model::Collection;
use dashsync::{Dashboard, MemorySource, QueryStatus};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Latest state of one summary panel
#[derive(Debug, Default)]
struct PanelState {
  status: Option<QueryStatus>,
  data: Option<QueryData>,
  warning: Option<String>,
}

impl PanelState {
  fn update(&mut self, entry: &CacheEntry) {
    self.status = Some(entry.status);
    if let Some(data) = entry.data.clone().or_else(|| entry.last_good_data.clone()) {
      self.data = Some(data);
    }
    self.warning = entry.stale_warning().map(|w| w.to_string());
  }
}

/// Terminal status view over the dashboard summaries
pub struct App {
  dashboard: Dashboard,
  jobs: PanelState,
  quality: PanelState,
  alerts: PanelState,
  health: PanelState,
  /// Stop after this long; runs until Ctrl-C otherwise
  run_for: Option<Duration>,
}

impl App {
  pub fn new(dashboard: Dashboard, run_for: Option<Duration>) -> Self {
    Self {
      dashboard,
      jobs: PanelState::default(),
      quality: PanelState::default(),
      alerts: PanelState::default(),
      health: PanelState::default(),
      run_for,
    }
  }

  pub async fn run(&mut self) -> Result<()> {
    let mut events = EventHandler::new(Duration::from_secs(1));
    events.watch(Panel::Jobs, self.dashboard.job_stats());
    events.watch(Panel::Quality, self.dashboard.quality_summary());
    events.watch(Panel::Alerts, self.dashboard.alert_summary());
    events.watch(Panel::Health, self.dashboard.system_health());

    let deadline = self.run_for.map(|d| tokio::time::Instant::now() + d);
    let mut dirty = false;

    while let Some(event) = events.next().await {
      match event {
        Event::Updated(panel, entry) => {
          self.panel_mut(panel).update(&entry);
          dirty = true;
        }
        Event::Tick => {
          if dirty {
            println!("{}", self.status_line());
            dirty = false;
          }
          if deadline.is_some_and(|d| tokio::time::Instant::now() >= d) {
            break;
          }
        }
        Event::Quit => break,
      }
    }

    info!("watch stopped");
    Ok(())
  }

  fn panel_mut(&mut self, panel: Panel) -> &mut PanelState {
    match panel {
      Panel::Jobs => &mut self.jobs,
      Panel::Quality => &mut self.quality,
      Panel::Alerts => &mut self.alerts,
      Panel::Health => &mut self.health,
    }
  }

  fn status_line(&self) -> String {
    let mut parts = vec![
      format!("[{}]", Utc::now().format("%H:%M:%S")),
      render(&self.jobs, |d| d.job_stats().map(jobs_text)),
      render(&self.quality, |d| d.quality_summary().map(quality_text)),
      render(&self.alerts, |d| d.alert_summary().map(alerts_text)),
      render(&self.health, |d| d.system_health().map(health_text)),
    ];
    for panel in [&self.jobs, &self.quality, &self.alerts, &self.health] {
      if let Some(warning) = &panel.warning {
        parts.push(format!("(stale: {})", warning));
      }
    }
    parts.join("  ")
  }
}

fn render(panel: &PanelState, text: impl Fn(&QueryData) -> Option<String>) -> String {
  match (&panel.data, panel.status) {
    (Some(data), _) => text(data).unwrap_or_else(|| "?".to_string()),
    (None, Some(QueryStatus::Error)) => "unavailable".to_string(),
    _ => "loading".to_string(),
  }
}

fn jobs_text(s: &JobStats) -> String {
  format!(
    "jobs {} ok/{} failed/{} running avg {:.1}s",
    s.successful_jobs, s.failed_jobs, s.running_jobs, s.avg_duration
  )
}

fn quality_text(s: &QualitySummary) -> String {
  format!(
    "quality {:.0}% ({} failing, {} warning)",
    s.overall_score, s.failing_metrics, s.warning_metrics
  )
}

fn alerts_text(s: &AlertSummary) -> String {
  format!(
    "alerts {} active ({} critical, {} high)",
    s.active_alerts, s.critical_alerts, s.high_alerts
  )
}

fn health_text(s: &SystemHealth) -> String {
  format!(
    "health {:?} cpu {:.0}% mem {:.0}% disk {:.0}%",
    s.overall_status, s.cpu_usage, s.memory_usage, s.disk_usage
  )
}

/// Keep feeding the in-memory store with fresh metric samples and the odd
/// alert so the demo has something to show.
pub fn spawn_simulator(source: Arc<MemorySource>, period: Duration) {
  tokio::spawn(async move {
    let mut interval = tokio::time::interval(period);
    let mut next_id = 100i64;
    for step in 0u64.. {
      interval.tick().await;
      let now = Utc::now();
      // Sawtooth load that crosses the warning and critical thresholds.
      let cpu = 40.0 + (step % 12) as f64 * 5.0;
      for (name, value, unit) in [
        ("cpu_usage", cpu, "%"),
        ("memory_usage", 70.0 + (step % 5) as f64 * 4.0, "%"),
        ("disk_usage", 62.0 + (step / 10) as f64 * 0.1, "%"),
      ] {
        next_id += 1;
        source.push_row(
          Collection::SystemMetrics,
          json!({ "id": next_id, "metric_name": name, "value": value, "unit": unit, "timestamp": now }),
        );
      }

      if cpu > 90.0 {
        next_id += 1;
        source.push_row(
          Collection::Alerts,
          json!({
            "id": next_id,
            "title": "CPU usage critical",
            "message": format!("cpu_usage at {:.0}%", cpu),
            "severity": "critical",
            "status": "active",
            "source": "simulator",
            "created_at": now,
          }),
        );
        warn!(cpu, "simulated critical alert");
      }
    }
  });
}
