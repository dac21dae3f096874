//! Vigil server: configuration and the top-level HTTP router.
//!
//! The binary in `main.rs` wires these to a SQLite store, the engine and the
//! sweep scheduler. Queued notices leave the outbox through [`LogGateway`].

use std::{convert::Infallible, path::PathBuf, sync::Arc};

use anyhow::ensure;
use axum::{Router, routing::get};
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use vigil_core::{
  notification::{Enqueued, NotificationGateway, NotificationIntent},
  store::VaultStore,
};
use vigil_engine::{Engine, EngineConfig, SchedulerConfig};

// ─── Configuration ────────────────────────────────────────────────────────────

/// Runtime server configuration, deserialised from `config.toml` and
/// `VIGIL__*` environment variables.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
  pub host:       String,
  pub port:       u16,
  pub store_path: PathBuf,
  pub engine:     EngineConfig,
  pub scheduler:  SchedulerConfig,
}

impl Default for ServerConfig {
  fn default() -> Self {
    Self {
      host:       "127.0.0.1".to_string(),
      port:       8080,
      store_path: PathBuf::from("vigil.db"),
      engine:     EngineConfig::default(),
      scheduler:  SchedulerConfig::default(),
    }
  }
}

impl ServerConfig {
  /// Reject settings the engine cannot run with.
  pub fn validate(&self) -> anyhow::Result<()> {
    let policy = &self.engine.policy;
    ensure!(
      0 < policy.missed_one_after_days
        && policy.missed_one_after_days < policy.missed_two_after_days
        && policy.missed_two_after_days < policy.escalate_after_days,
      "escalation thresholds must be positive and strictly increasing, got {}/{}/{}",
      policy.missed_one_after_days,
      policy.missed_two_after_days,
      policy.escalate_after_days,
    );
    ensure!(policy.grace_period_days > 0, "grace_period_days must be positive");
    ensure!(
      self.engine.confirmation_threshold > 0,
      "confirmation_threshold must be at least 1"
    );
    ensure!(self.engine.call_timeout_secs > 0, "call_timeout_secs must be positive");
    let scheduler = &self.scheduler;
    ensure!(
      scheduler.missed_check_in_every_secs > 0
        && scheduler.unlock_resolution_every_secs > 0
        && scheduler.reminder_every_secs > 0
        && scheduler.notification_delivery_every_secs > 0,
      "sweep periods must be positive"
    );
    ensure!(
      self.engine.notification_batch_size > 0,
      "notification_batch_size must be at least 1"
    );
    Ok(())
  }
}

// ─── Notification delivery ───────────────────────────────────────────────────

/// Writes each relayed notice to the log instead of sending mail.
///
/// The payload is never logged; it can hold a recipient's access token.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogGateway;

impl NotificationGateway for LogGateway {
  type Error = Infallible;

  async fn enqueue(&self, intent: NotificationIntent) -> Result<Enqueued, Infallible> {
    tracing::info!(
      subject_id = %intent.subject_id,
      kind = %intent.kind,
      priority = ?intent.priority,
      dedupe_key = %intent.dedupe_key,
      "notification handed off"
    );
    Ok(Enqueued::Accepted)
  }
}

// ─── Router ───────────────────────────────────────────────────────────────────

/// The API under `/api`, a liveness check at `/healthz`, and request tracing.
pub fn router<S, N>(engine: Arc<Engine<S, N>>) -> Router
where
  S: VaultStore + 'static,
  N: NotificationGateway + 'static,
{
  Router::new()
    .route("/healthz", get(|| async { "ok" }))
    .nest("/api", vigil_api::api_router(engine))
    .layer(TraceLayer::new_for_http())
}
