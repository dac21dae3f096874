//! The `VaultStore` trait, the persistence gateway.
//!
//! The trait is implemented by storage backends (e.g. `vigil-store-sqlite`).
//! Higher layers (`vigil-engine`, `vigil-api`) depend on this abstraction, not
//! on any concrete backend.
//!
//! Every method that changes state is conditional: it re-checks the state the
//! caller decided against inside a single transaction and reports a
//! [`Guarded`] outcome instead of overwriting a concurrent change. Writes
//! that owe someone a notice take the intents along and queue them in the
//! outbox within the same transaction, so a notice exists exactly when its
//! state change does.

use std::future::Future;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
  audit::{AuditEntry, NewAuditEntry},
  check_in::{CheckIn, CheckInRecord},
  contact::{NewRecipient, NewTrustedContact, Recipient, TrustedContact},
  escalation::Transition,
  notification::{NotificationIntent, OutboxEntry},
  subject::{NewSubject, Subject},
  unlock::{NewUnlockRequest, UnlockApproval, UnlockCancellation, UnlockRequest},
};

// ─── Conditional write outcome ───────────────────────────────────────────────

/// The result of a conditional write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Guarded<T> {
  /// The expected state held and the write was applied.
  Applied(T),
  /// The row exists but is no longer in the expected state; nothing changed.
  Rejected,
  /// The row does not exist.
  Missing,
}

impl<T> Guarded<T> {
  pub fn applied(self) -> Option<T> {
    match self {
      Self::Applied(v) => Some(v),
      Self::Rejected | Self::Missing => None,
    }
  }

  pub fn is_applied(&self) -> bool { matches!(self, Self::Applied(_)) }

  pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Guarded<U> {
    match self {
      Self::Applied(v) => Guarded::Applied(f(v)),
      Self::Rejected => Guarded::Rejected,
      Self::Missing => Guarded::Missing,
    }
  }
}

// ─── Trait ───────────────────────────────────────────────────────────────────

/// Abstraction over a Vigil store backend.
///
/// All methods return `Send` futures so the trait can be used in multi-threaded
/// async runtimes (e.g. tokio with `axum`). No method reads the wall clock;
/// every instant is supplied by the caller.
pub trait VaultStore: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  // ── Subjects ──────────────────────────────────────────────────────────

  /// Create an `alive` subject due one interval after registration.
  fn register_subject(
    &self,
    input: NewSubject,
  ) -> impl Future<Output = Result<Subject, Self::Error>> + Send + '_;

  fn get_subject(
    &self,
    id: Uuid,
  ) -> impl Future<Output = Result<Option<Subject>, Self::Error>> + Send + '_;

  /// Change the check-in interval and due date, if the subject is still at
  /// `expected_revision`.
  fn set_check_in_interval(
    &self,
    id: Uuid,
    expected_revision: u64,
    days: u32,
    next_due_at: DateTime<Utc>,
  ) -> impl Future<Output = Result<Guarded<Subject>, Self::Error>> + Send + '_;

  /// Subjects with `next_check_in_due_at < now` whose status is one of
  /// `alive`, `missed_one`, `missed_two`.
  fn find_subjects_due(
    &self,
    now: DateTime<Utc>,
  ) -> impl Future<Output = Result<Vec<Subject>, Self::Error>> + Send + '_;

  /// `alive` subjects due at or before `horizon` with no unanswered reminder
  /// sent since their last proof of life.
  fn find_subjects_awaiting_reminder(
    &self,
    horizon: DateTime<Utc>,
  ) -> impl Future<Output = Result<Vec<Subject>, Self::Error>> + Send + '_;

  /// Atomically: set the subject `alive`, stamp `last_check_in_at`, push the
  /// due date one interval out, clear the grace deadline, answer outstanding
  /// reminders, clear death confirmations, and append a check-in record.
  /// Returns `None` if the subject does not exist.
  fn record_check_in(
    &self,
    subject_id: Uuid,
    check_in: CheckIn,
  ) -> impl Future<Output = Result<Option<(Subject, CheckInRecord)>, Self::Error>>
  + Send
  + '_;

  /// Atomically apply an escalation transition if the subject is still at
  /// `transition.expected_revision`, mark every unanswered record missed and
  /// queue `notifications`.
  fn apply_transition(
    &self,
    transition: Transition,
    notifications: Vec<NotificationIntent>,
  ) -> impl Future<Output = Result<Guarded<Subject>, Self::Error>> + Send + '_;

  // ── Check-in records ──────────────────────────────────────────────────

  /// Append an unanswered reminder record and queue its notice, provided the
  /// subject is still at `expected_revision` and has no outstanding reminder.
  fn create_reminder(
    &self,
    subject_id: Uuid,
    expected_revision: u64,
    sent_at: DateTime<Utc>,
    notification: NotificationIntent,
  ) -> impl Future<Output = Result<Guarded<CheckInRecord>, Self::Error>> + Send + '_;

  /// Most recent records first.
  fn list_check_in_records(
    &self,
    subject_id: Uuid,
    limit: usize,
  ) -> impl Future<Output = Result<Vec<CheckInRecord>, Self::Error>> + Send + '_;

  // ── Trusted contacts ──────────────────────────────────────────────────

  fn add_trusted_contact(
    &self,
    input: NewTrustedContact,
  ) -> impl Future<Output = Result<TrustedContact, Self::Error>> + Send + '_;

  fn get_trusted_contact(
    &self,
    id: Uuid,
  ) -> impl Future<Output = Result<Option<TrustedContact>, Self::Error>> + Send + '_;

  fn find_trusted_contact_by_token(
    &self,
    token_hash: String,
  ) -> impl Future<Output = Result<Option<TrustedContact>, Self::Error>> + Send + '_;

  fn list_trusted_contacts(
    &self,
    subject_id: Uuid,
  ) -> impl Future<Output = Result<Vec<TrustedContact>, Self::Error>> + Send + '_;

  /// Mark a contact verified. Returns `None` if it does not exist.
  fn verify_trusted_contact(
    &self,
    id: Uuid,
  ) -> impl Future<Output = Result<Option<TrustedContact>, Self::Error>> + Send + '_;

  /// Record a death confirmation, only if the contact has not confirmed yet.
  fn confirm_death(
    &self,
    contact_id: Uuid,
    at: DateTime<Utc>,
  ) -> impl Future<Output = Result<Guarded<TrustedContact>, Self::Error>> + Send + '_;

  fn count_confirmed_contacts(
    &self,
    subject_id: Uuid,
  ) -> impl Future<Output = Result<u32, Self::Error>> + Send + '_;

  // ── Recipients ────────────────────────────────────────────────────────

  fn add_recipient(
    &self,
    input: NewRecipient,
  ) -> impl Future<Output = Result<Recipient, Self::Error>> + Send + '_;

  fn list_recipients(
    &self,
    subject_id: Uuid,
  ) -> impl Future<Output = Result<Vec<Recipient>, Self::Error>> + Send + '_;

  // ── Unlock requests ───────────────────────────────────────────────────

  /// All pending requests for a subject. More than one is a consistency
  /// violation the caller must flag.
  fn find_pending_unlock_requests(
    &self,
    subject_id: Uuid,
  ) -> impl Future<Output = Result<Vec<UnlockRequest>, Self::Error>> + Send + '_;

  fn get_unlock_request(
    &self,
    id: Uuid,
  ) -> impl Future<Output = Result<Option<UnlockRequest>, Self::Error>> + Send + '_;

  /// Newest first.
  fn list_unlock_requests(
    &self,
    subject_id: Uuid,
  ) -> impl Future<Output = Result<Vec<UnlockRequest>, Self::Error>> + Send + '_;

  /// `escalation` subjects with no pending request and at least
  /// `min_confirmations` death confirmations.
  fn find_escalated_awaiting_request(
    &self,
    min_confirmations: u32,
  ) -> impl Future<Output = Result<Vec<Subject>, Self::Error>> + Send + '_;

  /// Create a pending request if the subject is in `escalation` and has none;
  /// move the subject to `unlock_pending` and audit the initiation, all in one
  /// transaction. `Missing` if the subject does not exist.
  fn open_unlock_request(
    &self,
    input: NewUnlockRequest,
  ) -> impl Future<Output = Result<Guarded<UnlockRequest>, Self::Error>> + Send + '_;

  /// Update the live confirmation tally of a pending request.
  fn sync_confirmations(
    &self,
    request_id: Uuid,
    count: u32,
  ) -> impl Future<Output = Result<Guarded<UnlockRequest>, Self::Error>> + Send + '_;

  /// Pending requests with `grace_period_ends_at < now`.
  fn find_expired_pending_requests(
    &self,
    now: DateTime<Utc>,
  ) -> impl Future<Output = Result<Vec<UnlockRequest>, Self::Error>> + Send + '_;

  /// Approve a request that is still pending for a subject still in
  /// `unlock_pending`: mark the subject `unlocked`, store recipient grants,
  /// audit the unlock.
  fn approve_unlock_request(
    &self,
    request_id: Uuid,
    approval: UnlockApproval,
  ) -> impl Future<Output = Result<Guarded<UnlockRequest>, Self::Error>> + Send + '_;

  /// Cancel a request that is still pending, apply the cancellation's subject
  /// effect, audit the reason.
  fn cancel_unlock_request(
    &self,
    request_id: Uuid,
    cancellation: UnlockCancellation,
  ) -> impl Future<Output = Result<Guarded<UnlockRequest>, Self::Error>> + Send + '_;

  // ── Audit ─────────────────────────────────────────────────────────────

  fn append_audit(
    &self,
    entry: NewAuditEntry,
  ) -> impl Future<Output = Result<AuditEntry, Self::Error>> + Send + '_;

  /// Oldest first.
  fn list_audit(
    &self,
    subject_id: Uuid,
  ) -> impl Future<Output = Result<Vec<AuditEntry>, Self::Error>> + Send + '_;

  // ── Notification outbox ───────────────────────────────────────────────

  /// Undelivered intents, oldest first.
  fn pending_notifications(
    &self,
    limit: usize,
  ) -> impl Future<Output = Result<Vec<OutboxEntry>, Self::Error>> + Send + '_;

  /// Mark an intent delivered and drop its payload. `false` if it was unknown
  /// or already delivered.
  fn mark_notification_delivered(
    &self,
    dedupe_key: String,
    at: DateTime<Utc>,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send + '_;

  /// Count a failed delivery attempt; the intent stays queued.
  fn record_notification_failure(
    &self,
    dedupe_key: String,
    error: String,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send + '_;

  // ── Usage counters ────────────────────────────────────────────────────

  /// Zero every non-zero weekly usage counter; returns how many changed.
  fn reset_usage_counters(
    &self,
    at: DateTime<Utc>,
  ) -> impl Future<Output = Result<u64, Self::Error>> + Send + '_;
}
