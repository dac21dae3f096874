//! The periodic sweeps.
//!
//! Each sweep reads its candidates once, then handles them one at a time with
//! a fresh read and a conditional write. A failing candidate is logged and
//! counted; it never aborts the rest of the batch. Only a failure to read the
//! candidate list fails the sweep as a whole.
//!
//! Notices are queued by the write that owes them. The delivery sweep relays
//! the outbox to the notification gateway and leaves anything the gateway
//! refuses queued for the next run.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;
use vigil_core::{
  escalation::Transition,
  notification::{
    Enqueued, NotificationGateway, NotificationIntent, NotificationKind, OutboxEntry,
  },
  store::{Guarded, VaultStore},
  subject::{Subject, SubjectStatus},
};

use crate::{unlock::Resolution, Engine, Result};

// ─── Shutdown signal ─────────────────────────────────────────────────────────

/// Cooperative stop signal checked between candidates.
#[derive(Debug, Clone)]
pub struct Shutdown(watch::Receiver<bool>);

impl Shutdown {
  pub fn new(rx: watch::Receiver<bool>) -> Self { Self(rx) }

  /// A signal that never fires, for one-off runs.
  pub fn never() -> Self {
    let (_tx, rx) = watch::channel(false);
    Self(rx)
  }

  pub fn is_requested(&self) -> bool { *self.0.borrow() }

  /// Resolves once a stop has been requested.
  pub async fn requested(&mut self) {
    if self.0.wait_for(|stop| *stop).await.is_err() {
      // Sender gone without ever signalling.
      std::future::pending::<()>().await;
    }
  }
}

// ─── Report ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
  pub examined:    usize,
  pub changed:     usize,
  pub skipped:     usize,
  pub failed:      usize,
  /// Stopped early on shutdown.
  pub interrupted: bool,
}

impl SweepReport {
  fn record(&mut self, outcome: Result<bool>, what: &'static str, id: impl fmt::Display) {
    self.examined += 1;
    match outcome {
      Ok(true) => self.changed += 1,
      Ok(false) => self.skipped += 1,
      Err(e) => {
        self.failed += 1;
        warn!(%id, error = %e, "{what} failed; will retry next run");
      }
    }
  }
}

// ─── Sweeps ──────────────────────────────────────────────────────────────────

pub struct Sweeps<'a, S, N> {
  engine: &'a Engine<S, N>,
}

impl<'a, S, N> Sweeps<'a, S, N>
where
  S: VaultStore,
  N: NotificationGateway,
{
  pub(crate) fn new(engine: &'a Engine<S, N>) -> Self { Self { engine } }

  /// Move every overdue subject at most one rung up the escalation ladder,
  /// then open the unlock request owed to any `escalation` subject whose
  /// contacts already reached quorum.
  pub async fn missed_check_ins(&self, shutdown: &Shutdown) -> Result<SweepReport> {
    let now = self.engine.now();
    let due = self
      .engine
      .store_call("find subjects due", self.engine.store.find_subjects_due(now))
      .await?;

    let mut report = SweepReport::default();
    for subject in due {
      if shutdown.is_requested() {
        report.interrupted = true;
        return Ok(report);
      }
      let outcome = self.escalate(subject.subject_id, now).await;
      report.record(outcome, "escalation check", subject.subject_id);
    }

    let awaiting = self
      .engine
      .store_call(
        "find escalated subjects awaiting a request",
        self
          .engine
          .store
          .find_escalated_awaiting_request(self.engine.config.confirmation_threshold),
      )
      .await?;
    let confirmations = self.engine.confirmations();
    for subject in awaiting {
      if shutdown.is_requested() {
        report.interrupted = true;
        break;
      }
      let outcome = confirmations.reconcile(subject.subject_id).await;
      report.record(outcome, "unlock request reconciliation", subject.subject_id);
    }
    Ok(report)
  }

  async fn escalate(&self, subject_id: Uuid, now: DateTime<Utc>) -> Result<bool> {
    let Some(subject) = self
      .engine
      .store_call("get subject", self.engine.store.get_subject(subject_id))
      .await?
    else {
      return Ok(false);
    };
    let Some(transition) = self.engine.config.policy.next_transition(&subject, now)
    else {
      return Ok(false);
    };
    let elapsed_days = transition.elapsed_days;
    let notices = self.transition_notices(&subject, &transition, now).await?;

    let updated = match self
      .engine
      .store_call(
        "apply transition",
        self.engine.store.apply_transition(transition, notices),
      )
      .await?
    {
      Guarded::Applied(updated) => updated,
      Guarded::Rejected | Guarded::Missing => {
        debug!(%subject_id, "subject changed since it was read; skipping");
        return Ok(false);
      }
    };

    info!(
      %subject_id,
      from = %subject.status,
      to = %updated.status,
      elapsed_days,
      "subject escalated"
    );
    Ok(true)
  }

  /// The notices owed for `transition`: the subject's own, plus one per
  /// trusted contact on entering `escalation`.
  async fn transition_notices(
    &self,
    subject: &Subject,
    transition: &Transition,
    now: DateTime<Utc>,
  ) -> Result<Vec<NotificationIntent>> {
    let Some(kind) = NotificationKind::for_status(transition.to) else {
      return Ok(Vec::new());
    };
    let subject_id = subject.subject_id;
    let payload = json!({
      "status":               transition.to,
      "days_since_check_in":  transition.elapsed_days,
      "last_check_in_at":     subject.last_check_in_at,
      "grace_period_ends_at": transition.grace_period_ends_at,
    });
    let mut notices = vec![NotificationIntent::daily(subject_id, kind, now, payload.clone())];

    if transition.to == SubjectStatus::Escalation {
      let contacts = self
        .engine
        .store_call(
          "list trusted contacts",
          self.engine.store.list_trusted_contacts(subject_id),
        )
        .await?;
      notices.extend(contacts.into_iter().map(|contact| {
        let mut payload = payload.clone();
        payload["contact_id"] = json!(contact.contact_id);
        payload["contact_email"] = json!(contact.email);
        NotificationIntent::daily_for(subject_id, kind, contact.contact_id, now, payload)
      }));
    }
    Ok(notices)
  }

  /// Resolve every pending request whose grace period has ended.
  pub async fn unlock_resolutions(&self, shutdown: &Shutdown) -> Result<SweepReport> {
    let now = self.engine.now();
    let expired = self
      .engine
      .store_call(
        "find expired pending requests",
        self.engine.store.find_expired_pending_requests(now),
      )
      .await?;

    let mut report = SweepReport::default();
    let unlocks = self.engine.unlocks();
    for request in expired {
      if shutdown.is_requested() {
        report.interrupted = true;
        break;
      }
      let outcome = unlocks
        .resolve_expired(request.request_id)
        .await
        .map(|resolution| !matches!(resolution, Resolution::Skipped));
      report.record(outcome, "unlock resolution", request.request_id);
    }
    Ok(report)
  }

  /// Remind every `alive` subject nearing its due date, once per interval.
  pub async fn reminders(&self, shutdown: &Shutdown) -> Result<SweepReport> {
    let now = self.engine.now();
    let horizon = now + Duration::days(i64::from(self.engine.config.reminder_lead_days));
    let candidates = self
      .engine
      .store_call(
        "find subjects awaiting reminder",
        self.engine.store.find_subjects_awaiting_reminder(horizon),
      )
      .await?;

    let mut report = SweepReport::default();
    for subject in candidates {
      if shutdown.is_requested() {
        report.interrupted = true;
        break;
      }
      let outcome = self.remind(&subject, now).await;
      report.record(outcome, "check-in reminder", subject.subject_id);
    }
    Ok(report)
  }

  async fn remind(&self, subject: &Subject, now: DateTime<Utc>) -> Result<bool> {
    let subject_id = subject.subject_id;
    let notice = NotificationIntent::daily(
      subject_id,
      NotificationKind::CheckInReminder,
      now,
      json!({
        "next_check_in_due_at": subject.next_check_in_due_at,
        "days_until_due":       (subject.next_check_in_due_at - now).num_days(),
      }),
    );
    let created = self
      .engine
      .store_call(
        "create reminder",
        self
          .engine
          .store
          .create_reminder(subject_id, subject.revision, now, notice),
      )
      .await?;
    if !created.is_applied() {
      return Ok(false);
    }
    debug!(%subject_id, "check-in reminder queued");
    Ok(true)
  }

  /// Hand every queued notice to the gateway, oldest first. A refused notice
  /// stays queued with its failure recorded.
  pub async fn deliver_notifications(&self, shutdown: &Shutdown) -> Result<SweepReport> {
    let queued = self
      .engine
      .store_call(
        "find pending notifications",
        self
          .engine
          .store
          .pending_notifications(self.engine.config.notification_batch_size),
      )
      .await?;

    let mut report = SweepReport::default();
    for entry in queued {
      if shutdown.is_requested() {
        report.interrupted = true;
        break;
      }
      let key = entry.intent.dedupe_key.clone();
      let outcome = self.deliver(entry).await;
      report.record(outcome, "notification delivery", key);
    }
    Ok(report)
  }

  async fn deliver(&self, entry: OutboxEntry) -> Result<bool> {
    let key = entry.intent.dedupe_key.clone();
    let kind = entry.intent.kind;
    match self.engine.notify(entry.intent).await {
      Ok(enqueued) => {
        self
          .engine
          .store_call(
            "mark notification delivered",
            self
              .engine
              .store
              .mark_notification_delivered(key.clone(), self.engine.now()),
          )
          .await?;
        debug!(
          dedupe_key = %key,
          %kind,
          duplicate = enqueued == Enqueued::Duplicate,
          "notification delivered"
        );
        Ok(true)
      }
      Err(e) => {
        let recorded = self
          .engine
          .store_call(
            "record notification failure",
            self
              .engine
              .store
              .record_notification_failure(key.clone(), e.to_string()),
          )
          .await;
        if let Err(record_err) = recorded {
          warn!(dedupe_key = %key, error = %record_err, "failed to record delivery failure");
        }
        Err(e)
      }
    }
  }

  /// Zero every weekly usage counter.
  pub async fn weekly_reset(&self) -> Result<SweepReport> {
    let reset = self
      .engine
      .store_call(
        "reset usage counters",
        self.engine.store.reset_usage_counters(self.engine.now()),
      )
      .await?;
    let reset = usize::try_from(reset).unwrap_or(usize::MAX);
    Ok(SweepReport {
      examined: reset,
      changed: reset,
      ..SweepReport::default()
    })
  }
}
