mod app;
mod config;
mod event;
mod logging;

use chrono::Utc;
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use dashsync::{
  Dashboard, MemorySource, PostgrestSource, QueryCache, RemoteDataSource, WithTimeout,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "dashsync")]
#[command(about = "Live view and actions for the pipeline monitoring dashboard")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/dashsync/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Log at debug level unless RUST_LOG says otherwise
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Print live summaries from the remote store
  Watch {
    /// Stop after this many seconds
    #[arg(long)]
    seconds: Option<u64>,
  },
  /// Watch summaries over a simulated in-memory store
  Demo {
    #[arg(long)]
    seconds: Option<u64>,
  },
  /// Acknowledge an alert
  Ack {
    id: i64,
    #[arg(long, default_value = "cli")]
    actor: String,
  },
  /// Resolve an alert
  Resolve {
    id: i64,
    #[arg(long, default_value = "cli")]
    actor: String,
  },
  /// Cancel a running job
  CancelJob { id: i64 },
  /// Start a job run
  RunJob { name: String },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = config::Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config.log, args.verbose)?;

  let cache = QueryCache::with_health_policy(config.health);
  let run_for = |seconds: Option<u64>| seconds.map(Duration::from_secs);

  match args.command {
    Command::Demo { seconds } => {
      let source = Arc::new(MemorySource::demo(Utc::now()).with_latency(Duration::from_millis(150)));
      app::spawn_simulator(source.clone(), Duration::from_secs(3));
      let dashboard = Dashboard::new(cache, source);
      app::App::new(dashboard, run_for(seconds)).run().await?;
    }
    Command::Watch { seconds } => {
      let dashboard = connect(&config, cache)?;
      app::App::new(dashboard, run_for(seconds)).run().await?;
    }
    Command::Ack { id, actor } => {
      let alert = connect(&config, cache)?.acknowledge_alert(id, &actor).await?;
      println!("alert {} acknowledged by {}", alert.id, actor);
    }
    Command::Resolve { id, actor } => {
      let alert = connect(&config, cache)?.resolve_alert(id, &actor).await?;
      println!("alert {} resolved by {}", alert.id, actor);
    }
    Command::CancelJob { id } => {
      let job = connect(&config, cache)?.cancel_job(id).await?;
      println!("job {} ({}) cancelled", job.id, job.name);
    }
    Command::RunJob { name } => {
      let job = connect(&config, cache)?.run_job(&name).await?;
      println!("job {} ({}) started", job.id, job.name);
    }
  }

  info!("done");
  Ok(())
}

/// Dashboard over the configured remote store.
fn connect(config: &config::Config, cache: QueryCache) -> Result<Dashboard> {
  let remote = PostgrestSource::new(
    config.remote_url()?,
    config.remote.timeout(),
    config::Config::get_api_key()?,
  )
  .map_err(|e| eyre!("Failed to set up remote store: {}", e))?;
  let remote: Arc<dyn RemoteDataSource> = Arc::new(WithTimeout::new(remote, config.remote.timeout()));
  Ok(Dashboard::new(cache, remote))
}
