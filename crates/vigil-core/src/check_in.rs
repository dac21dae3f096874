//! Check-in records: the append-only trail of reminders and liveness proofs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};
use uuid::Uuid;

/// Whether a record is an outbound reminder or an inbound proof of life.
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
pub enum RecordKind {
  Reminder,
  CheckIn,
}

/// How the subject proved they are alive.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Default,
  Serialize,
  Deserialize,
  Display,
  EnumString,
  IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CheckInMethod {
  #[default]
  App,
  EmailLink,
  Push,
  Sms,
  /// The subject cancelled an in-flight unlock request.
  UnlockCancellation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckInRecord {
  pub record_id:    Uuid,
  pub subject_id:   Uuid,
  pub kind:         RecordKind,
  pub method:       Option<CheckInMethod>,
  pub sent_at:      DateTime<Utc>,
  pub responded_at: Option<DateTime<Utc>>,
  /// Set by the sweep when the record was still unanswered at an escalation
  /// boundary.
  pub missed:       bool,
}

/// A proof of life, applied atomically by
/// [`crate::store::VaultStore::record_check_in`].
///
/// Applying it also clears every death confirmation recorded against the
/// subject: a confirmation made before a later check-in is known to be wrong.
#[derive(Debug, Clone, Copy)]
pub struct CheckIn {
  pub method: CheckInMethod,
  pub at:     DateTime<Utc>,
}
