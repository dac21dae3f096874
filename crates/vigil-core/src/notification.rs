//! Notification intents and the gateway that accepts them.
//!
//! The core only decides *that* someone should be told something. Intents are
//! written to the store's outbox in the same transaction as the state change
//! that caused them; a relay later hands each one to a [`NotificationGateway`]
//! for delivery (email, push) and keeps it queued until the gateway accepts
//! it. Every intent carries a dedupe key unique per subject, event kind and
//! calendar day, so a sweep that runs four times a day still notifies once.

use std::future::Future;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};
use uuid::Uuid;

use crate::subject::SubjectStatus;

#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Hash,
  Serialize,
  Deserialize,
  Display,
  EnumString,
  IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NotificationKind {
  CheckInReminder,
  MissedOne,
  MissedTwo,
  /// Sent to the subject and fanned out to every trusted contact.
  Escalation,
  UnlockRequested,
  UnlockCancelled,
  /// Per-recipient notice carrying a fresh vault access token.
  VaultUnlocked,
}

impl NotificationKind {
  /// The notice that accompanies a subject entering `status`, if any.
  pub fn for_status(status: SubjectStatus) -> Option<Self> {
    match status {
      SubjectStatus::MissedOne => Some(Self::MissedOne),
      SubjectStatus::MissedTwo => Some(Self::MissedTwo),
      SubjectStatus::Escalation => Some(Self::Escalation),
      _ => None,
    }
  }

  pub fn default_priority(self) -> Priority {
    match self {
      Self::CheckInReminder => Priority::Normal,
      Self::MissedOne | Self::UnlockCancelled => Priority::High,
      Self::MissedTwo
      | Self::Escalation
      | Self::UnlockRequested
      | Self::VaultUnlocked => Priority::Urgent,
    }
  }
}

#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  PartialOrd,
  Ord,
  Serialize,
  Deserialize,
  Display,
  EnumString,
  IntoStaticStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Priority {
  Low,
  Normal,
  High,
  Urgent,
}

/// Build the dedupe key for an event on a given calendar day.
///
/// `scope` narrows the key below the subject, e.g. to one recipient.
pub fn dedupe_key(
  subject_id: Uuid,
  kind: NotificationKind,
  scope: Option<Uuid>,
  day: NaiveDate,
) -> String {
  match scope {
    Some(scope) => format!("{subject_id}:{kind}:{scope}:{day}"),
    None => format!("{subject_id}:{kind}:{day}"),
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationIntent {
  pub subject_id: Uuid,
  pub kind:       NotificationKind,
  pub dedupe_key: String,
  pub priority:   Priority,
  /// Template context for the delivery layer.
  pub payload:    serde_json::Value,
  pub created_at: DateTime<Utc>,
}

impl NotificationIntent {
  /// An intent deduplicated per subject, kind and UTC calendar day of `now`.
  pub fn daily(
    subject_id: Uuid,
    kind: NotificationKind,
    now: DateTime<Utc>,
    payload: serde_json::Value,
  ) -> Self {
    Self {
      subject_id,
      kind,
      dedupe_key: dedupe_key(subject_id, kind, None, now.date_naive()),
      priority: kind.default_priority(),
      payload,
      created_at: now,
    }
  }

  /// Like [`Self::daily`], scoped to one addressee.
  pub fn daily_for(
    subject_id: Uuid,
    kind: NotificationKind,
    scope: Uuid,
    now: DateTime<Utc>,
    payload: serde_json::Value,
  ) -> Self {
    Self {
      dedupe_key: dedupe_key(subject_id, kind, Some(scope), now.date_naive()),
      ..Self::daily(subject_id, kind, now, payload)
    }
  }
}

/// An undelivered intent as the outbox holds it.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxEntry {
  pub intent:     NotificationIntent,
  /// Failed delivery attempts so far.
  pub attempts:   u32,
  pub last_error: Option<String>,
}

/// Whether the gateway took the intent or had already seen its dedupe key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
  Accepted,
  Duplicate,
}

/// Accepts notification intents. Implementations must treat a repeated
/// `dedupe_key` as a no-op and report [`Enqueued::Duplicate`].
pub trait NotificationGateway: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  fn enqueue(
    &self,
    intent: NotificationIntent,
  ) -> impl Future<Output = Result<Enqueued, Self::Error>> + Send + '_;
}
