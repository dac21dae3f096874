//! The Vigil engine: check-ins, death confirmations, unlock resolution and
//! the scheduled sweeps that drive escalation.
//!
//! [`Engine`] owns the store, the notification gateway, the clock and the
//! tunables. Each component is a short-lived view over it:
//!
//! ```rust,ignore
//! let engine = Arc::new(Engine::new(store, notifier, clock, config));
//! engine.tracker().check_in(subject_id, CheckInMethod::App).await?;
//! engine.sweeps().missed_check_ins(&Shutdown::never()).await?;
//! ```

pub mod config;
pub mod confirmation;
pub mod error;
pub mod retry;
pub mod scheduler;
pub mod sweep;
pub mod token;
pub mod tracker;
pub mod unlock;

use std::{future::Future, sync::Arc};

use chrono::{DateTime, Utc};
use tracing::error;
use uuid::Uuid;
use vigil_core::{
  audit::{Actor, AuditAction, NewAuditEntry},
  clock::Clock,
  notification::{Enqueued, NotificationGateway, NotificationIntent},
  store::VaultStore,
};

pub use config::EngineConfig;
pub use error::{Error, ErrorKind, Result};
pub use scheduler::{Scheduler, SchedulerConfig};
pub use sweep::{Shutdown, SweepReport};

use confirmation::ConfirmationEngine;
use sweep::Sweeps;
use tracker::CheckInTracker;
use unlock::UnlockWorkflow;

/// Shared state behind every engine component.
pub struct Engine<S, N> {
  store:    Arc<S>,
  notifier: Arc<N>,
  clock:    Arc<dyn Clock>,
  config:   EngineConfig,
}

impl<S, N> Engine<S, N>
where
  S: VaultStore,
  N: NotificationGateway,
{
  pub fn new(
    store: Arc<S>,
    notifier: Arc<N>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
  ) -> Self {
    Self { store, notifier, clock, config }
  }

  pub fn config(&self) -> &EngineConfig { &self.config }

  pub fn clock(&self) -> Arc<dyn Clock> { Arc::clone(&self.clock) }

  pub fn now(&self) -> DateTime<Utc> { self.clock.now() }

  pub fn tracker(&self) -> CheckInTracker<'_, S, N> { CheckInTracker::new(self) }

  pub fn confirmations(&self) -> ConfirmationEngine<'_, S, N> {
    ConfirmationEngine::new(self)
  }

  pub fn unlocks(&self) -> UnlockWorkflow<'_, S, N> { UnlockWorkflow::new(self) }

  pub fn sweeps(&self) -> Sweeps<'_, S, N> { Sweeps::new(self) }

  /// Await a store call under the configured timeout.
  pub(crate) async fn store_call<T>(
    &self,
    op: &'static str,
    fut: impl Future<Output = Result<T, S::Error>>,
  ) -> Result<T> {
    match tokio::time::timeout(self.config.call_timeout(), fut).await {
      Ok(Ok(value)) => Ok(value),
      Ok(Err(e)) => Err(Error::transient(op, e)),
      Err(_) => Err(Error::Timeout(op)),
    }
  }

  /// Hand a queued intent to the notification gateway under the configured
  /// timeout.
  pub(crate) async fn notify(&self, intent: NotificationIntent) -> Result<Enqueued> {
    match tokio::time::timeout(self.config.call_timeout(), self.notifier.enqueue(intent))
      .await
    {
      Ok(Ok(outcome)) => Ok(outcome),
      Ok(Err(e)) => Err(Error::transient("deliver notification", e)),
      Err(_) => Err(Error::Timeout("deliver notification")),
    }
  }

  /// Log and audit a broken invariant, then return it as an error.
  pub(crate) async fn consistency_violation(
    &self,
    subject_id: Uuid,
    actor: Actor,
    detail: String,
    details: serde_json::Value,
  ) -> Error {
    error!(%subject_id, %detail, "consistency violation");
    let entry = NewAuditEntry {
      subject_id: Some(subject_id),
      action: AuditAction::ConsistencyViolation,
      actor,
      details,
      recorded_at: self.now(),
    };
    if let Err(e) = self
      .store_call("append audit entry", self.store.append_audit(entry))
      .await
    {
      error!(%subject_id, error = %e, "failed to audit consistency violation");
    }
    Error::ConsistencyViolation { subject_id, detail }
  }
}

#[cfg(test)]
mod tests;
