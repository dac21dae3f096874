//! Append-only audit trail.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};
use uuid::Uuid;

#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
  Display,
  EnumString,
  IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AuditAction {
  UnlockRequestInitiated,
  UnlockRequestCancelled,
  UnlockRequestExpired,
  VaultUnlocked,
  /// An invariant was found broken; the entity needs manual review.
  ConsistencyViolation,
}

/// Who caused an audited change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Actor {
  Subject(Uuid),
  TrustedContact(Uuid),
  /// An operator or other authorized party acting through the API.
  Operator(String),
  /// A scheduled sweep.
  Scheduler,
}

impl fmt::Display for Actor {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Subject(id) => write!(f, "subject-{id}"),
      Self::TrustedContact(id) => write!(f, "trusted-contact-{id}"),
      Self::Operator(name) => write!(f, "operator-{name}"),
      Self::Scheduler => f.write_str("scheduler"),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
  pub audit_id:    Uuid,
  pub subject_id:  Option<Uuid>,
  pub action:      AuditAction,
  pub actor:       String,
  pub details:     serde_json::Value,
  pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewAuditEntry {
  pub subject_id:  Option<Uuid>,
  pub action:      AuditAction,
  pub actor:       Actor,
  pub details:     serde_json::Value,
  pub recorded_at: DateTime<Utc>,
}
