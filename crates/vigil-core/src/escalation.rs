//! The escalation state machine.
//!
//! [`EscalationPolicy::next_transition`] is a pure function of a subject and
//! an instant. It moves a silent subject one rung per evaluation:
//!
//! ```text
//! alive ──(>90d, overdue)──▶ missed_one ──(>120d)──▶ missed_two ──(>150d)──▶ escalation
//! ```
//!
//! Elapsed time is measured from the last check-in, or from registration for
//! a subject who never checked in. Thresholds are strict: a subject silent
//! for exactly 90 days stays `alive`; one second later it does not.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::subject::{Subject, SubjectStatus};

/// Thresholds of the escalation ladder, in days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationPolicy {
  pub missed_one_after_days: u32,
  pub missed_two_after_days: u32,
  pub escalate_after_days:   u32,
  /// Length of the window trusted contacts get once escalation starts.
  pub grace_period_days:     u32,
}

impl Default for EscalationPolicy {
  fn default() -> Self {
    Self {
      missed_one_after_days: 90,
      missed_two_after_days: 120,
      escalate_after_days:   150,
      grace_period_days:     30,
    }
  }
}

/// A decided, not yet applied, status change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
  pub subject_id:           Uuid,
  pub from:                 SubjectStatus,
  pub to:                   SubjectStatus,
  /// The subject revision the decision was made against.
  pub expected_revision:    u64,
  /// `Some` only when entering `escalation`.
  pub grace_period_ends_at: Option<DateTime<Utc>>,
  /// Whole days of silence at decision time, for messages.
  pub elapsed_days:         i64,
}

fn days(n: u32) -> Duration { Duration::days(i64::from(n)) }

impl EscalationPolicy {
  /// Decide the next status for `subject` at `now`, or `None` for no change.
  pub fn next_transition(
    &self,
    subject: &Subject,
    now: DateTime<Utc>,
  ) -> Option<Transition> {
    let elapsed = now - subject.last_seen_at();

    let (to, grace) = match subject.status {
      SubjectStatus::Alive
        if subject.next_check_in_due_at < now
          && elapsed > days(self.missed_one_after_days) =>
      {
        (SubjectStatus::MissedOne, None)
      }
      SubjectStatus::MissedOne if elapsed > days(self.missed_two_after_days) => {
        (SubjectStatus::MissedTwo, None)
      }
      SubjectStatus::MissedTwo if elapsed > days(self.escalate_after_days) => (
        SubjectStatus::Escalation,
        Some(now + days(self.grace_period_days)),
      ),
      _ => return None,
    };

    Some(Transition {
      subject_id: subject.subject_id,
      from: subject.status,
      to,
      expected_revision: subject.revision,
      grace_period_ends_at: grace,
      elapsed_days: elapsed.num_days(),
    })
  }
}
