//! Engine tunables.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use vigil_core::escalation::EscalationPolicy;

/// Everything the engine decides with, other than the clock.
///
/// Every field has a default, so a config file only names what it changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
  pub policy:                     EscalationPolicy,
  /// Confirmations needed before an unlock request opens.
  pub confirmation_threshold:     u32,
  /// Floor on the window between a request opening and its resolution.
  pub minimum_request_grace_days: u32,
  /// Lifetime of a recipient access token issued on unlock.
  pub recipient_token_ttl_days:   u32,
  /// How far ahead of the due date a reminder goes out.
  pub reminder_lead_days:         u32,
  /// Upper bound on any single store or notification call.
  pub call_timeout_secs:          u64,
  /// Cancel an in-flight unlock request when its subject checks in.
  pub cancel_pending_on_check_in: bool,
  /// Queued notices handed to the gateway per delivery run.
  pub notification_batch_size:    usize,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      policy:                     EscalationPolicy::default(),
      confirmation_threshold:     2,
      minimum_request_grace_days: 7,
      recipient_token_ttl_days:   3650,
      reminder_lead_days:         7,
      call_timeout_secs:          10,
      cancel_pending_on_check_in: true,
      notification_batch_size:    100,
    }
  }
}

impl EngineConfig {
  pub fn call_timeout(&self) -> Duration { Duration::from_secs(self.call_timeout_secs) }
}
