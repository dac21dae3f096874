//! Proof-of-life bookkeeping for subjects.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;
use vigil_core::{
  check_in::{CheckIn, CheckInMethod, CheckInRecord},
  error::validate_interval,
  notification::NotificationGateway,
  store::{Guarded, VaultStore},
  subject::{NewSubject, Subject, SubjectStatus},
};

use crate::{Engine, Error, Result};

/// Concurrent interval changes are retried this many times.
const INTERVAL_ATTEMPTS: usize = 3;

/// The answer to a successful check-in.
#[derive(Debug, Clone, Serialize)]
pub struct CheckInReceipt {
  pub next_check_in_due_at: DateTime<Utc>,
  pub subject:              Subject,
  pub record:               CheckInRecord,
}

/// A subject's check-in standing as of now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckInStatus {
  pub subject_id:             Uuid,
  pub status:                 SubjectStatus,
  pub last_check_in_at:       Option<DateTime<Utc>>,
  pub next_check_in_due_at:   DateTime<Utc>,
  /// Whole days until the due date; negative once overdue.
  pub days_until_due:         i64,
  pub is_overdue:             bool,
  pub grace_period_ends_at:   Option<DateTime<Utc>>,
  pub check_in_interval_days: u32,
}

pub struct CheckInTracker<'a, S, N> {
  engine: &'a Engine<S, N>,
}

impl<'a, S, N> CheckInTracker<'a, S, N>
where
  S: VaultStore,
  N: NotificationGateway,
{
  pub(crate) fn new(engine: &'a Engine<S, N>) -> Self { Self { engine } }

  /// Register a new subject, due one interval from now.
  pub async fn register(&self, check_in_interval_days: u32) -> Result<Subject> {
    let check_in_interval_days = validate_interval(check_in_interval_days)?;
    let subject = self
      .engine
      .store_call(
        "register subject",
        self.engine.store.register_subject(NewSubject {
          check_in_interval_days,
          registered_at: self.engine.now(),
        }),
      )
      .await?;
    info!(
      subject_id = %subject.subject_id,
      interval_days = check_in_interval_days,
      "subject registered"
    );
    Ok(subject)
  }

  /// Record a proof of life. Valid from any status; the subject returns to
  /// `alive` and is due again one interval from now.
  ///
  /// An in-flight unlock request is left alone; see
  /// [`cancel_pending_on_check_in`].
  ///
  /// [`cancel_pending_on_check_in`]: crate::unlock::UnlockWorkflow::cancel_pending_on_check_in
  pub async fn check_in(
    &self,
    subject_id: Uuid,
    method: CheckInMethod,
  ) -> Result<CheckInReceipt> {
    let at = self.engine.now();
    let (subject, record) = self
      .engine
      .store_call(
        "record check-in",
        self
          .engine
          .store
          .record_check_in(subject_id, CheckIn { method, at }),
      )
      .await?
      .ok_or(Error::SubjectNotFound(subject_id))?;

    info!(
      %subject_id,
      %method,
      next_due = %subject.next_check_in_due_at,
      "check-in recorded"
    );
    Ok(CheckInReceipt {
      next_check_in_due_at: subject.next_check_in_due_at,
      subject,
      record,
    })
  }

  pub async fn status(&self, subject_id: Uuid) -> Result<CheckInStatus> {
    let subject = self.subject(subject_id).await?;
    let now = self.engine.now();
    Ok(CheckInStatus {
      subject_id,
      status: subject.status,
      last_check_in_at: subject.last_check_in_at,
      next_check_in_due_at: subject.next_check_in_due_at,
      days_until_due: (subject.next_check_in_due_at - now).num_days(),
      is_overdue: subject.next_check_in_due_at < now,
      grace_period_ends_at: subject.grace_period_ends_at,
      check_in_interval_days: subject.check_in_interval_days,
    })
  }

  /// The most recent reminders and check-ins, newest first.
  pub async fn history(&self, subject_id: Uuid, limit: usize) -> Result<Vec<CheckInRecord>> {
    self.subject(subject_id).await?;
    self
      .engine
      .store_call(
        "list check-in records",
        self.engine.store.list_check_in_records(subject_id, limit),
      )
      .await
  }

  /// Change the check-in interval. The due date is recomputed from the last
  /// proof of life.
  pub async fn set_interval(&self, subject_id: Uuid, days: u32) -> Result<Subject> {
    let days = validate_interval(days)?;

    for _ in 0..INTERVAL_ATTEMPTS {
      let subject = self.subject(subject_id).await?;
      let next_due_at = subject.last_seen_at() + chrono::Duration::days(i64::from(days));

      let outcome = self
        .engine
        .store_call(
          "set check-in interval",
          self.engine.store.set_check_in_interval(
            subject_id,
            subject.revision,
            days,
            next_due_at,
          ),
        )
        .await?;

      match outcome {
        Guarded::Applied(updated) => {
          info!(
            %subject_id,
            interval_days = days,
            next_due = %next_due_at,
            "check-in interval changed"
          );
          return Ok(updated);
        }
        Guarded::Rejected => {
          debug!(%subject_id, "subject changed while setting interval; retrying");
        }
        Guarded::Missing => return Err(Error::SubjectNotFound(subject_id)),
      }
    }
    Err(Error::ConcurrentUpdate(subject_id))
  }

  async fn subject(&self, subject_id: Uuid) -> Result<Subject> {
    self
      .engine
      .store_call("get subject", self.engine.store.get_subject(subject_id))
      .await?
      .ok_or(Error::SubjectNotFound(subject_id))
  }
}
