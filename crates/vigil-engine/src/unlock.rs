//! Unlock requests: `pending → approved` or `pending → cancelled`.
//!
//! Every write is conditional on the request still being `pending`, so a
//! resolution or cancellation that is repeated or races another one is a
//! no-op rather than a second unlock.

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;
use vigil_core::{
  audit::Actor,
  check_in::CheckInMethod,
  contact::{NewRecipient, Recipient, RecipientGrant},
  notification::{NotificationGateway, NotificationIntent, NotificationKind},
  store::{Guarded, VaultStore},
  unlock::{SubjectEffect, UnlockApproval, UnlockCancellation, UnlockRequest},
};

use crate::{token, Engine, Error, Result};

/// What [`UnlockWorkflow::resolve_expired`] did with a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
  Approved(UnlockRequest),
  Cancelled(UnlockRequest),
  /// Not pending or not yet expired when re-read.
  Skipped,
}

pub struct UnlockWorkflow<'a, S, N> {
  engine: &'a Engine<S, N>,
}

impl<'a, S, N> UnlockWorkflow<'a, S, N>
where
  S: VaultStore,
  N: NotificationGateway,
{
  pub(crate) fn new(engine: &'a Engine<S, N>) -> Self { Self { engine } }

  pub async fn get(&self, request_id: Uuid) -> Result<UnlockRequest> {
    self.request(request_id).await
  }

  /// Designate a beneficiary who receives an access token on unlock.
  pub async fn add_recipient(
    &self,
    subject_id: Uuid,
    name: String,
    email: String,
  ) -> Result<Recipient> {
    self
      .engine
      .store_call("get subject", self.engine.store.get_subject(subject_id))
      .await?
      .ok_or(Error::SubjectNotFound(subject_id))?;
    let recipient = self
      .engine
      .store_call(
        "add recipient",
        self.engine.store.add_recipient(NewRecipient {
          subject_id,
          name,
          email,
          created_at: self.engine.now(),
        }),
      )
      .await?;
    info!(%subject_id, recipient_id = %recipient.recipient_id, "recipient added");
    Ok(recipient)
  }

  /// Every request for a subject, newest first.
  pub async fn list(&self, subject_id: Uuid) -> Result<Vec<UnlockRequest>> {
    self
      .engine
      .store_call("get subject", self.engine.store.get_subject(subject_id))
      .await?
      .ok_or(Error::SubjectNotFound(subject_id))?;
    self
      .engine
      .store_call(
        "list unlock requests",
        self.engine.store.list_unlock_requests(subject_id),
      )
      .await
  }

  /// Resolve a request whose grace period has run out: approve it if the
  /// quorum still holds, otherwise cancel it and return the subject to
  /// `escalation`.
  pub async fn resolve_expired(&self, request_id: Uuid) -> Result<Resolution> {
    let now = self.engine.now();
    let request = self.request(request_id).await?;
    if !request.is_expired(now) {
      return Ok(Resolution::Skipped);
    }
    let subject_id = request.subject_id;

    let confirmations = self
      .engine
      .store_call(
        "count confirmed contacts",
        self.engine.store.count_confirmed_contacts(subject_id),
      )
      .await?;
    if confirmations < self.engine.config.confirmation_threshold {
      let cancellation = UnlockCancellation {
        at:            now,
        reason:        "grace period ended without quorum".into(),
        actor:         Actor::Scheduler,
        effect:        SubjectEffect::ReturnToEscalation,
        notifications: Vec::new(),
      };
      return Ok(
        match self
          .engine
          .store_call(
            "cancel unlock request",
            self.engine.store.cancel_unlock_request(request_id, cancellation),
          )
          .await?
        {
          Guarded::Applied(cancelled) => {
            info!(
              %request_id,
              %subject_id,
              confirmations,
              "unlock request expired without quorum"
            );
            Resolution::Cancelled(cancelled)
          }
          Guarded::Rejected | Guarded::Missing => Resolution::Skipped,
        },
      );
    }

    let recipients = self
      .engine
      .store_call("list recipients", self.engine.store.list_recipients(subject_id))
      .await?;
    let expires_at =
      now + Duration::days(i64::from(self.engine.config.recipient_token_ttl_days));
    let mut grants = Vec::with_capacity(recipients.len());
    let mut notifications = Vec::with_capacity(recipients.len());
    for recipient in recipients {
      let token = token::issue();
      grants.push(RecipientGrant {
        recipient_id: recipient.recipient_id,
        token_hash:   token.hash,
        expires_at,
      });
      notifications.push(NotificationIntent::daily_for(
        subject_id,
        NotificationKind::VaultUnlocked,
        recipient.recipient_id,
        now,
        json!({
          "request_id":   request_id,
          "recipient_id": recipient.recipient_id,
          "name":         recipient.name,
          "email":        recipient.email,
          "access_token": token.plaintext,
          "expires_at":   expires_at,
        }),
      ));
    }
    let granted = grants.len();
    let approval = UnlockApproval {
      at: now,
      grants,
      notifications,
    };

    match self
      .engine
      .store_call(
        "approve unlock request",
        self.engine.store.approve_unlock_request(request_id, approval),
      )
      .await?
    {
      Guarded::Applied(approved) => {
        info!(
          %request_id,
          %subject_id,
          confirmations,
          recipients = granted,
          "vault unlocked"
        );
        Ok(Resolution::Approved(approved))
      }
      Guarded::Rejected => self.cancel_orphaned(request_id).await,
      Guarded::Missing => Err(Error::RequestNotFound(request_id)),
    }
  }

  /// A still-pending request whose subject is no longer awaiting unlock
  /// (it checked in) can never be approved; close it.
  async fn cancel_orphaned(&self, request_id: Uuid) -> Result<Resolution> {
    let cancellation = UnlockCancellation {
      at:            self.engine.now(),
      reason:        "subject no longer awaiting unlock".into(),
      actor:         Actor::Scheduler,
      effect:        SubjectEffect::None,
      notifications: Vec::new(),
    };
    match self
      .engine
      .store_call(
        "cancel unlock request",
        self.engine.store.cancel_unlock_request(request_id, cancellation),
      )
      .await?
    {
      Guarded::Applied(cancelled) => {
        warn!(
          %request_id,
          subject_id = %cancelled.subject_id,
          "approval refused; request closed"
        );
        Ok(Resolution::Cancelled(cancelled))
      }
      Guarded::Rejected | Guarded::Missing => {
        debug!(%request_id, "request already resolved");
        Ok(Resolution::Skipped)
      }
    }
  }

  /// Cancel a pending request on the subject's behalf. The subject is reset
  /// to `alive` exactly as by a check-in.
  pub async fn cancel(
    &self,
    request_id: Uuid,
    reason: String,
    actor: Actor,
  ) -> Result<UnlockRequest> {
    let now = self.engine.now();
    let subject_id = self.request(request_id).await?.subject_id;
    let cancellation = UnlockCancellation {
      at: now,
      reason,
      actor,
      effect: SubjectEffect::ResetToAlive {
        method: CheckInMethod::UnlockCancellation,
      },
      notifications: vec![cancelled_notice(subject_id, request_id, now)],
    };

    match self
      .engine
      .store_call(
        "cancel unlock request",
        self.engine.store.cancel_unlock_request(request_id, cancellation),
      )
      .await?
    {
      Guarded::Applied(cancelled) => {
        info!(%request_id, %subject_id, "unlock request cancelled");
        Ok(cancelled)
      }
      Guarded::Rejected => {
        let current = self.request(request_id).await?;
        Err(Error::RequestNotPending {
          id:     request_id,
          status: current.status,
        })
      }
      Guarded::Missing => Err(Error::RequestNotFound(request_id)),
    }
  }

  /// Close every pending request of a subject that has just checked in. The
  /// check-in already reset the subject, so the subject is left untouched.
  pub async fn cancel_pending_on_check_in(
    &self,
    subject_id: Uuid,
  ) -> Result<Vec<UnlockRequest>> {
    let now = self.engine.now();
    let pending = self
      .engine
      .store_call(
        "find pending unlock requests",
        self.engine.store.find_pending_unlock_requests(subject_id),
      )
      .await?;

    let mut cancelled = Vec::with_capacity(pending.len());
    for request in pending {
      let cancellation = UnlockCancellation {
        at:            now,
        reason:        "subject checked in".into(),
        actor:         Actor::Subject(subject_id),
        effect:        SubjectEffect::None,
        notifications: vec![cancelled_notice(subject_id, request.request_id, now)],
      };
      if let Guarded::Applied(request) = self
        .engine
        .store_call(
          "cancel unlock request",
          self
            .engine
            .store
            .cancel_unlock_request(request.request_id, cancellation),
        )
        .await?
      {
        info!(
          %subject_id,
          request_id = %request.request_id,
          "unlock request cancelled by check-in"
        );
        cancelled.push(request);
      }
    }
    Ok(cancelled)
  }

  async fn request(&self, request_id: Uuid) -> Result<UnlockRequest> {
    self
      .engine
      .store_call(
        "get unlock request",
        self.engine.store.get_unlock_request(request_id),
      )
      .await?
      .ok_or(Error::RequestNotFound(request_id))
  }
}

fn cancelled_notice(
  subject_id: Uuid,
  request_id: Uuid,
  now: DateTime<Utc>,
) -> NotificationIntent {
  NotificationIntent::daily_for(
    subject_id,
    NotificationKind::UnlockCancelled,
    request_id,
    now,
    json!({ "request_id": request_id }),
  )
}
