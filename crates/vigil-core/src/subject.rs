//! Subject: the monitored person whose vault may eventually unlock.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};
use uuid::Uuid;

// ─── Status ──────────────────────────────────────────────────────────────────

/// Where a subject sits on the escalation ladder.
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
pub enum SubjectStatus {
  Alive,
  MissedOne,
  MissedTwo,
  Escalation,
  UnlockPending,
  Unlocked,
}

impl SubjectStatus {
  /// Statuses the missed-check-in sweep re-evaluates.
  pub const SWEEPABLE: [Self; 3] = [Self::Alive, Self::MissedOne, Self::MissedTwo];

  /// Whether a subject in this status must carry a grace-period deadline.
  pub fn holds_grace_period(self) -> bool {
    matches!(self, Self::Escalation | Self::UnlockPending)
  }

  pub fn as_str(self) -> &'static str { self.into() }
}

// ─── Subject ─────────────────────────────────────────────────────────────────

/// A registered subject.
///
/// `grace_period_ends_at` is `Some` exactly when [`SubjectStatus::holds_grace_period`]
/// holds for `status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
  pub subject_id:             Uuid,
  pub status:                 SubjectStatus,
  pub last_check_in_at:       Option<DateTime<Utc>>,
  pub next_check_in_due_at:   DateTime<Utc>,
  pub check_in_interval_days: u32,
  pub grace_period_ends_at:   Option<DateTime<Utc>>,
  pub created_at:             DateTime<Utc>,
  /// Bumped on every write; conditional updates compare against it.
  pub revision:               u64,
}

impl Subject {
  /// The instant liveness was last proven: the latest check-in, or
  /// registration if the subject never checked in.
  pub fn last_seen_at(&self) -> DateTime<Utc> {
    self.last_check_in_at.unwrap_or(self.created_at)
  }

  pub fn interval(&self) -> Duration {
    Duration::days(i64::from(self.check_in_interval_days))
  }

  /// Whether the grace-period field agrees with the status.
  pub fn grace_invariant_holds(&self) -> bool {
    self.grace_period_ends_at.is_some() == self.status.holds_grace_period()
  }
}

/// Input to [`crate::store::VaultStore::register_subject`].
#[derive(Debug, Clone)]
pub struct NewSubject {
  pub check_in_interval_days: u32,
  pub registered_at:          DateTime<Utc>,
}

impl NewSubject {
  pub fn first_due_at(&self) -> DateTime<Utc> {
    self.registered_at + Duration::days(i64::from(self.check_in_interval_days))
  }
}

#[cfg(test)]
mod tests {
  use std::str::FromStr;

  use super::*;

  #[test]
  fn status_strings_round_trip_through_strum() {
    assert_eq!(SubjectStatus::UnlockPending.as_str(), "unlock_pending");
    assert_eq!(
      SubjectStatus::from_str("missed_two").unwrap(),
      SubjectStatus::MissedTwo
    );
    assert!(SubjectStatus::from_str("deceased").is_err());
  }

  #[test]
  fn only_escalated_statuses_hold_grace() {
    assert!(SubjectStatus::Escalation.holds_grace_period());
    assert!(SubjectStatus::UnlockPending.holds_grace_period());
    assert!(!SubjectStatus::Alive.holds_grace_period());
    assert!(!SubjectStatus::Unlocked.holds_grace_period());
  }
}
