//! Unlock requests and the inputs that resolve them.
//!
//! A request moves `pending → approved` or `pending → cancelled`; both
//! outcomes are terminal. Every store write that resolves a request is
//! conditional on it still being `pending`, which is what makes repeated
//! sweeps harmless.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};
use uuid::Uuid;

use crate::{
  audit::Actor,
  check_in::CheckInMethod,
  contact::RecipientGrant,
  notification::NotificationIntent,
};

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
pub enum UnlockStatus {
  Pending,
  Approved,
  Cancelled,
}

impl UnlockStatus {
  pub fn is_terminal(self) -> bool { !matches!(self, Self::Pending) }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlockRequest {
  pub request_id:           Uuid,
  pub subject_id:           Uuid,
  pub status:               UnlockStatus,
  pub confirmations_count:  u32,
  pub initiated_by:         String,
  pub grace_period_ends_at: DateTime<Utc>,
  pub created_at:           DateTime<Utc>,
  pub completed_at:         Option<DateTime<Utc>>,
}

impl UnlockRequest {
  /// Whether the sweep may resolve this request at `now`.
  pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
    self.status == UnlockStatus::Pending && self.grace_period_ends_at < now
  }
}

/// Input to [`crate::store::VaultStore::open_unlock_request`].
///
/// The store creates the request only if the subject is still in
/// `escalation` and has no pending request, and in the same transaction moves
/// the subject to `unlock_pending` with the request's grace deadline.
/// `notifications` are queued in that transaction too, and only if the request
/// is created.
#[derive(Debug, Clone)]
pub struct NewUnlockRequest {
  pub request_id:           Uuid,
  pub subject_id:           Uuid,
  pub initiated_by:         String,
  pub confirmations_count:  u32,
  pub grace_period_ends_at: DateTime<Utc>,
  pub created_at:           DateTime<Utc>,
  pub notifications:        Vec<NotificationIntent>,
}

/// Everything the approval transaction writes besides the status flip.
#[derive(Debug, Clone)]
pub struct UnlockApproval {
  pub at:            DateTime<Utc>,
  pub grants:        Vec<RecipientGrant>,
  /// One notice per recipient, carrying the plaintext of its grant.
  pub notifications: Vec<NotificationIntent>,
}

/// What a cancellation does to the subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubjectEffect {
  /// Treat the cancellation as an emergency check-in: the subject returns to
  /// `alive` with a fresh due date and a check-in record.
  ResetToAlive { method: CheckInMethod },
  /// The grace window closed without quorum: an `unlock_pending` subject
  /// falls back to `escalation`, keeping its deadline.
  ReturnToEscalation,
  /// Leave the subject untouched (it already left `unlock_pending`).
  None,
}

#[derive(Debug, Clone)]
pub struct UnlockCancellation {
  pub at:            DateTime<Utc>,
  pub reason:        String,
  pub actor:         Actor,
  pub effect:        SubjectEffect,
  pub notifications: Vec<NotificationIntent>,
}
