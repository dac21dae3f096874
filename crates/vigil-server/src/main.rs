//! vigil-server binary.
//!
//! Reads `config.toml` (or the path given with `--config`) layered with
//! `VIGIL__*` environment variables, opens the SQLite store, starts the sweep
//! scheduler and serves the JSON API over HTTP.
//!
//! # One-off sweeps
//!
//! To run a single sweep and exit, e.g. from cron:
//!
//! ```text
//! vigil-server --run-once missed-check-ins
//! ```

use std::{
  path::{Path, PathBuf},
  sync::Arc,
};

use anyhow::Context as _;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use vigil_core::clock::SystemClock;
use vigil_engine::{Engine, Scheduler, scheduler::RunOutcome};
use vigil_server::{LogGateway, ServerConfig};
use vigil_store_sqlite::SqliteStore;

#[derive(Parser)]
#[command(author, version, about = "Vigil dead man's switch server")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, default_value = "config.toml")]
  config: PathBuf,

  /// Run one named sweep immediately and exit instead of serving.
  #[arg(long, value_name = "TASK")]
  run_once: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  // Initialise tracing.
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .init();

  let cli = Cli::parse();

  // Load configuration.
  let settings = config::Config::builder()
    .add_source(config::File::from(cli.config).required(false))
    .add_source(
      config::Environment::with_prefix("VIGIL")
        .separator("__")
        .try_parsing(true),
    )
    .build()
    .context("failed to read config file")?;

  let server_cfg: ServerConfig = settings
    .try_deserialize()
    .context("failed to deserialise ServerConfig")?;
  server_cfg.validate().context("invalid configuration")?;

  // Open SQLite store; notices queue in its outbox table.
  let store_path = expand_tilde(&server_cfg.store_path);
  let store = Arc::new(
    SqliteStore::open(&store_path)
      .await
      .with_context(|| format!("failed to open store at {store_path:?}"))?,
  );

  let engine = Arc::new(Engine::new(
    store,
    Arc::new(LogGateway),
    Arc::new(SystemClock),
    server_cfg.engine.clone(),
  ));
  let mut scheduler = Scheduler::for_engine(Arc::clone(&engine), &server_cfg.scheduler);

  if let Some(task) = cli.run_once {
    return match scheduler.run_now(&task).await {
      RunOutcome::Completed(report) => {
        tracing::info!(task = %task, ?report, "sweep complete");
        Ok(())
      }
      RunOutcome::Failed(error) => Err(anyhow::anyhow!("sweep {task} failed: {error}")),
      RunOutcome::AlreadyRunning => Err(anyhow::anyhow!("sweep {task} is already running")),
      RunOutcome::UnknownTask => Err(anyhow::anyhow!(
        "unknown task {task:?}; expected one of {:?}",
        scheduler.task_names()
      )),
    };
  }

  scheduler.start();

  let app = vigil_server::router(engine);
  let address = format!("{}:{}", server_cfg.host, server_cfg.port);

  tracing::info!("Listening on http://{address}");
  let listener = TcpListener::bind(&address)
    .await
    .with_context(|| format!("failed to bind {address}"))?;

  axum::serve(listener, app)
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server error")?;

  tracing::info!("stopping scheduler");
  scheduler.stop().await;
  Ok(())
}

async fn shutdown_signal() {
  if let Err(e) = tokio::signal::ctrl_c().await {
    tracing::error!(error = %e, "failed to listen for ctrl-c");
    std::future::pending::<()>().await;
  }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
  let s = path.to_string_lossy();
  if let Some(rest) = s.strip_prefix("~/")
    && let Ok(home) = std::env::var("HOME")
  {
    return PathBuf::from(home).join(rest);
  }
  path.to_path_buf()
}
