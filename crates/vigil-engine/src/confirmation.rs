//! Trusted contacts and the death-confirmation quorum.
//!
//! A confirmation is recorded unconditionally once per contact. Reaching the
//! threshold while the subject is in `escalation` opens the subject's single
//! unlock request; every later confirmation only refreshes its tally. A quorum
//! that forms before escalation, or whose request could not be opened at the
//! time, is picked up by [`ConfirmationEngine::reconcile`] from the missed
//! check-in sweep.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;
use vigil_core::{
  audit::Actor,
  contact::{NewTrustedContact, TrustedContact},
  notification::{NotificationGateway, NotificationIntent, NotificationKind},
  store::{Guarded, VaultStore},
  subject::SubjectStatus,
  unlock::{NewUnlockRequest, UnlockRequest},
};

use crate::{token, Engine, Error, Result};

/// A newly registered contact and the token it will authenticate with. The
/// plaintext token is not retrievable afterwards.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedContact {
  pub contact: TrustedContact,
  pub token:   String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfirmationOutcome {
  pub contact_id:         Uuid,
  pub subject_id:         Uuid,
  pub confirmation_count: u32,
  pub threshold:          u32,
  /// Informational only; the threshold does not scale with it.
  pub total_contacts:     u32,
  pub threshold_reached:  bool,
  pub unlock_request:     Option<UnlockRequest>,
  /// Whether this confirmation opened `unlock_request`.
  pub request_created:    bool,
}

pub struct ConfirmationEngine<'a, S, N> {
  engine: &'a Engine<S, N>,
}

impl<'a, S, N> ConfirmationEngine<'a, S, N>
where
  S: VaultStore,
  N: NotificationGateway,
{
  pub(crate) fn new(engine: &'a Engine<S, N>) -> Self { Self { engine } }

  // ── Contacts ──────────────────────────────────────────────────────────────

  pub async fn add_contact(
    &self,
    subject_id: Uuid,
    name: String,
    email: String,
  ) -> Result<IssuedContact> {
    self
      .engine
      .store_call("get subject", self.engine.store.get_subject(subject_id))
      .await?
      .ok_or(Error::SubjectNotFound(subject_id))?;

    let issued = token::issue();
    let contact = self
      .engine
      .store_call(
        "add trusted contact",
        self.engine.store.add_trusted_contact(NewTrustedContact {
          subject_id,
          name,
          email,
          token_hash: issued.hash,
          created_at: self.engine.now(),
        }),
      )
      .await?;

    info!(%subject_id, contact_id = %contact.contact_id, "trusted contact added");
    Ok(IssuedContact { contact, token: issued.plaintext })
  }

  pub async fn list_contacts(&self, subject_id: Uuid) -> Result<Vec<TrustedContact>> {
    self
      .engine
      .store_call(
        "list trusted contacts",
        self.engine.store.list_trusted_contacts(subject_id),
      )
      .await
  }

  /// Mark the contact holding `token` as verified.
  pub async fn verify_contact(&self, token: &str) -> Result<TrustedContact> {
    let contact = self.contact_by_token(token).await?;
    let verified = self
      .engine
      .store_call(
        "verify trusted contact",
        self.engine.store.verify_trusted_contact(contact.contact_id),
      )
      .await?
      .ok_or(Error::ContactNotFound(contact.contact_id))?;
    info!(contact_id = %verified.contact_id, "trusted contact verified");
    Ok(verified)
  }

  // ── Confirmations ─────────────────────────────────────────────────────────

  pub async fn confirm_death_by_token(&self, token: &str) -> Result<ConfirmationOutcome> {
    let contact = self.contact_by_token(token).await?;
    self.confirm_death(contact.contact_id).await
  }

  /// Record `contact_id`'s confirmation and act on the resulting tally.
  ///
  /// Confirming twice fails with [`Error::AlreadyConfirmed`] and leaves the
  /// tally unchanged.
  pub async fn confirm_death(&self, contact_id: Uuid) -> Result<ConfirmationOutcome> {
    let now = self.engine.now();
    let contact = match self
      .engine
      .store_call(
        "confirm death",
        self.engine.store.confirm_death(contact_id, now),
      )
      .await?
    {
      Guarded::Applied(contact) => contact,
      Guarded::Rejected => return Err(Error::AlreadyConfirmed(contact_id)),
      Guarded::Missing => return Err(Error::ContactNotFound(contact_id)),
    };
    let subject_id = contact.subject_id;

    let confirmation_count = self
      .engine
      .store_call(
        "count confirmed contacts",
        self.engine.store.count_confirmed_contacts(subject_id),
      )
      .await?;
    let total_contacts = u32::try_from(self.list_contacts(subject_id).await?.len())
      .unwrap_or(u32::MAX);
    let threshold = self.engine.config.confirmation_threshold;
    let threshold_reached = confirmation_count >= threshold;

    info!(
      %subject_id,
      %contact_id,
      confirmation_count,
      threshold,
      "death confirmation recorded"
    );

    let (unlock_request, request_created) = if threshold_reached {
      self
        .ensure_request(
          Actor::TrustedContact(contact_id),
          subject_id,
          confirmation_count,
          now,
        )
        .await?
    } else {
      (None, false)
    };

    Ok(ConfirmationOutcome {
      contact_id,
      subject_id,
      confirmation_count,
      threshold,
      total_contacts,
      threshold_reached,
      unlock_request,
      request_created,
    })
  }

  /// Open the unlock request a standing quorum owes an `escalation` subject.
  /// Returns whether a request was opened.
  pub async fn reconcile(&self, subject_id: Uuid) -> Result<bool> {
    let now = self.engine.now();
    let count = self
      .engine
      .store_call(
        "count confirmed contacts",
        self.engine.store.count_confirmed_contacts(subject_id),
      )
      .await?;
    if count < self.engine.config.confirmation_threshold {
      return Ok(false);
    }
    let (_, created) = self
      .ensure_request(Actor::Scheduler, subject_id, count, now)
      .await?;
    Ok(created)
  }

  /// Open the subject's unlock request, or refresh the tally of the one that
  /// is already pending.
  async fn ensure_request(
    &self,
    initiator: Actor,
    subject_id: Uuid,
    count: u32,
    now: DateTime<Utc>,
  ) -> Result<(Option<UnlockRequest>, bool)> {
    let pending = self.pending(subject_id).await?;

    match pending.as_slice() {
      [] => {}
      [request] => return Ok((Some(self.sync(request, count).await?), false)),
      many => {
        let ids: Vec<Uuid> = many.iter().map(|r| r.request_id).collect();
        return Err(
          self
            .engine
            .consistency_violation(
              subject_id,
              initiator,
              format!("{} pending unlock requests", many.len()),
              json!({ "pending_request_ids": ids }),
            )
            .await,
        );
      }
    }

    let subject = self
      .engine
      .store_call("get subject", self.engine.store.get_subject(subject_id))
      .await?
      .ok_or(Error::SubjectNotFound(subject_id))?;
    if subject.status != SubjectStatus::Escalation {
      debug!(
        %subject_id,
        status = %subject.status,
        "quorum reached outside escalation; no request opened"
      );
      return Ok((None, false));
    }

    let minimum = now
      + Duration::days(i64::from(self.engine.config.minimum_request_grace_days));
    let grace_period_ends_at = subject
      .grace_period_ends_at
      .map_or(minimum, |grace| grace.max(minimum));

    let request_id = Uuid::new_v4();
    let notice = NotificationIntent::daily(
      subject_id,
      NotificationKind::UnlockRequested,
      now,
      json!({
        "request_id":           request_id,
        "confirmations_count":  count,
        "grace_period_ends_at": grace_period_ends_at,
      }),
    );
    let opened = self
      .engine
      .store_call(
        "open unlock request",
        self.engine.store.open_unlock_request(NewUnlockRequest {
          request_id,
          subject_id,
          initiated_by: initiator.to_string(),
          confirmations_count: count,
          grace_period_ends_at,
          created_at: now,
          notifications: vec![notice],
        }),
      )
      .await?;

    match opened {
      Guarded::Applied(request) => {
        info!(
          %subject_id,
          %request_id,
          initiated_by = %request.initiated_by,
          grace_ends = %request.grace_period_ends_at,
          "unlock request opened"
        );
        Ok((Some(request), true))
      }
      // Lost a race: someone else opened it, or the subject moved on.
      Guarded::Rejected => match self.pending(subject_id).await?.first() {
        Some(request) => Ok((Some(self.sync(request, count).await?), false)),
        None => Ok((None, false)),
      },
      Guarded::Missing => Err(Error::SubjectNotFound(subject_id)),
    }
  }

  async fn sync(&self, request: &UnlockRequest, count: u32) -> Result<UnlockRequest> {
    let synced = self
      .engine
      .store_call(
        "sync confirmations",
        self.engine.store.sync_confirmations(request.request_id, count),
      )
      .await?;
    Ok(synced.applied().unwrap_or_else(|| request.clone()))
  }

  async fn pending(&self, subject_id: Uuid) -> Result<Vec<UnlockRequest>> {
    self
      .engine
      .store_call(
        "find pending unlock requests",
        self.engine.store.find_pending_unlock_requests(subject_id),
      )
      .await
  }

  async fn contact_by_token(&self, token: &str) -> Result<TrustedContact> {
    self
      .engine
      .store_call(
        "find trusted contact by token",
        self
          .engine
          .store
          .find_trusted_contact_by_token(token::hash(token)),
      )
      .await?
      .ok_or(Error::UnknownToken)
  }
}
