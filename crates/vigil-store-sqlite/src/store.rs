//! [`SqliteStore`]: the SQLite implementation of [`VaultStore`].

use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use rusqlite::OptionalExtension as _;
use uuid::Uuid;

use vigil_core::{
  audit::{Actor, AuditAction, AuditEntry, NewAuditEntry},
  check_in::{CheckIn, CheckInRecord, RecordKind},
  contact::{
    NewRecipient, NewTrustedContact, Recipient, TrustedContact,
    VerificationStatus,
  },
  escalation::Transition,
  notification::{NotificationIntent, OutboxEntry},
  store::{Guarded, VaultStore},
  subject::{NewSubject, Subject, SubjectStatus},
  unlock::{
    NewUnlockRequest, SubjectEffect, UnlockApproval, UnlockCancellation,
    UnlockRequest, UnlockStatus,
  },
};

use crate::{
  encode::{
    encode_dt, encode_i64, encode_uuid, RawAudit, RawContact, RawOutbox,
    RawRecipient, RawRecord, RawRequest, RawSubject, AUDIT_COLUMNS,
    CONTACT_COLUMNS, OUTBOX_COLUMNS, RECIPIENT_COLUMNS, RECORD_COLUMNS,
    REQUEST_COLUMNS, SUBJECT_COLUMNS,
  },
  outbox,
  schema::SCHEMA,
  Error, Result,
};

/// The column value of a strum-backed enum.
fn tag<T: Into<&'static str>>(v: T) -> &'static str { v.into() }

fn decode_guarded<T, U>(
  g: Guarded<T>,
  decode: impl FnOnce(T) -> Result<U>,
) -> Result<Guarded<U>> {
  Ok(match g {
    Guarded::Applied(raw) => Guarded::Applied(decode(raw)?),
    Guarded::Rejected => Guarded::Rejected,
    Guarded::Missing => Guarded::Missing,
  })
}

// ─── Store ───────────────────────────────────────────────────────────────────

/// A Vigil store backed by a single SQLite file.
///
/// Cloning is cheap; the inner connection is reference-counted.
#[derive(Clone)]
pub struct SqliteStore {
  pub(crate) conn: tokio_rusqlite::Connection,
}

impl SqliteStore {
  /// Open (or create) a store at `path` and run schema initialisation.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  /// Open an in-memory store, useful for testing.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  async fn init_schema(&self) -> Result<()> {
    self
      .conn
      .call(|conn| {
        conn.execute_batch(SCHEMA)?;
        Ok(())
      })
      .await?;
    Ok(())
  }
}

// ─── Statement helpers ───────────────────────────────────────────────────────
//
// These run on the connection thread, usually inside an open transaction.

fn subject_row(
  conn: &rusqlite::Connection,
  id: &str,
) -> rusqlite::Result<Option<RawSubject>> {
  conn
    .query_row(
      &format!("SELECT {SUBJECT_COLUMNS} FROM subjects WHERE subject_id = ?1"),
      rusqlite::params![id],
      RawSubject::from_row,
    )
    .optional()
}

fn request_row(
  conn: &rusqlite::Connection,
  id: &str,
) -> rusqlite::Result<Option<RawRequest>> {
  conn
    .query_row(
      &format!("SELECT {REQUEST_COLUMNS} FROM unlock_requests WHERE request_id = ?1"),
      rusqlite::params![id],
      RawRequest::from_row,
    )
    .optional()
}

fn contact_row(
  conn: &rusqlite::Connection,
  id: &str,
) -> rusqlite::Result<Option<RawContact>> {
  conn
    .query_row(
      &format!("SELECT {CONTACT_COLUMNS} FROM trusted_contacts WHERE contact_id = ?1"),
      rusqlite::params![id],
      RawContact::from_row,
    )
    .optional()
}

fn subject_exists(conn: &rusqlite::Connection, id: &str) -> rusqlite::Result<bool> {
  conn.query_row(
    "SELECT EXISTS(SELECT 1 FROM subjects WHERE subject_id = ?1)",
    rusqlite::params![id],
    |r| r.get(0),
  )
}

/// The body of a proof of life. Returns `false` if the subject is unknown.
fn apply_check_in(
  conn: &rusqlite::Connection,
  subject_id: &str,
  record_id: &str,
  method: &str,
  at: DateTime<Utc>,
) -> rusqlite::Result<bool> {
  let interval: Option<i64> = conn
    .query_row(
      "SELECT check_in_interval_days FROM subjects WHERE subject_id = ?1",
      rusqlite::params![subject_id],
      |r| r.get(0),
    )
    .optional()?;
  let Some(interval) = interval else {
    return Ok(false);
  };

  let at_str  = encode_dt(at);
  let due_str = encode_dt(at + Duration::days(interval));

  conn.execute(
    "UPDATE subjects
     SET status = ?2, last_check_in_at = ?3, next_check_in_due_at = ?4,
         grace_period_ends_at = NULL, revision = revision + 1
     WHERE subject_id = ?1",
    rusqlite::params![subject_id, tag(SubjectStatus::Alive), at_str, due_str],
  )?;
  conn.execute(
    "UPDATE check_in_records SET responded_at = ?2
     WHERE subject_id = ?1 AND responded_at IS NULL AND missed = 0",
    rusqlite::params![subject_id, at_str],
  )?;
  conn.execute(
    "UPDATE trusted_contacts SET confirmed_death = 0, confirmed_at = NULL
     WHERE subject_id = ?1 AND confirmed_death = 1",
    rusqlite::params![subject_id],
  )?;
  conn.execute(
    "INSERT INTO check_in_records
       (record_id, subject_id, kind, method, sent_at, responded_at, missed)
     VALUES (?1, ?2, ?3, ?4, ?5, ?5, 0)",
    rusqlite::params![
      record_id,
      subject_id,
      tag(RecordKind::CheckIn),
      method,
      at_str
    ],
  )?;
  Ok(true)
}

fn insert_audit(
  conn: &rusqlite::Connection,
  subject_id: Option<&str>,
  action: AuditAction,
  actor: &str,
  details: &serde_json::Value,
  at: &str,
) -> rusqlite::Result<()> {
  conn.execute(
    "INSERT INTO audit_log (audit_id, subject_id, action, actor, details, recorded_at)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    rusqlite::params![
      encode_uuid(Uuid::new_v4()),
      subject_id,
      tag(action),
      actor,
      details.to_string(),
      at
    ],
  )?;
  Ok(())
}

// ─── VaultStore impl ─────────────────────────────────────────────────────────

impl VaultStore for SqliteStore {
  type Error = Error;

  // ── Subjects ──────────────────────────────────────────────────────────────

  async fn register_subject(&self, input: NewSubject) -> Result<Subject> {
    let subject = Subject {
      subject_id:             Uuid::new_v4(),
      status:                 SubjectStatus::Alive,
      last_check_in_at:       None,
      next_check_in_due_at:   input.first_due_at(),
      check_in_interval_days: input.check_in_interval_days,
      grace_period_ends_at:   None,
      created_at:             input.registered_at,
      revision:               0,
    };

    let id_str   = encode_uuid(subject.subject_id);
    let due_str  = encode_dt(subject.next_check_in_due_at);
    let at_str   = encode_dt(subject.created_at);
    let interval = i64::from(subject.check_in_interval_days);

    self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        tx.execute(
          "INSERT INTO subjects
             (subject_id, status, next_check_in_due_at, check_in_interval_days, created_at)
           VALUES (?1, ?2, ?3, ?4, ?5)",
          rusqlite::params![id_str, tag(SubjectStatus::Alive), due_str, interval, at_str],
        )?;
        tx.execute(
          "INSERT INTO usage_counters (subject_id) VALUES (?1)",
          rusqlite::params![id_str],
        )?;
        tx.commit()?;
        Ok(())
      })
      .await?;

    Ok(subject)
  }

  async fn get_subject(&self, id: Uuid) -> Result<Option<Subject>> {
    let id_str = encode_uuid(id);
    let raw = self
      .conn
      .call(move |conn| Ok(subject_row(conn, &id_str)?))
      .await?;
    raw.map(RawSubject::into_subject).transpose()
  }

  async fn set_check_in_interval(
    &self,
    id:                Uuid,
    expected_revision: u64,
    days:              u32,
    next_due_at:       DateTime<Utc>,
  ) -> Result<Guarded<Subject>> {
    let id_str   = encode_uuid(id);
    let revision = encode_i64("revision", expected_revision)?;
    let days     = i64::from(days);
    let due_str  = encode_dt(next_due_at);

    let outcome = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let changed = tx.execute(
          "UPDATE subjects
           SET check_in_interval_days = ?3, next_check_in_due_at = ?4,
               revision = revision + 1
           WHERE subject_id = ?1 AND revision = ?2",
          rusqlite::params![id_str, revision, days, due_str],
        )?;
        if changed == 0 {
          return Ok(if subject_exists(&tx, &id_str)? {
            Guarded::Rejected
          } else {
            Guarded::Missing
          });
        }
        let raw = subject_row(&tx, &id_str)?;
        tx.commit()?;
        Ok(raw.map_or(Guarded::Missing, Guarded::Applied))
      })
      .await?;

    decode_guarded(outcome, RawSubject::into_subject)
  }

  async fn find_subjects_due(&self, now: DateTime<Utc>) -> Result<Vec<Subject>> {
    let now_str = encode_dt(now);
    let [a, b, c] = SubjectStatus::SWEEPABLE.map(tag);

    let raws = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {SUBJECT_COLUMNS} FROM subjects
           WHERE next_check_in_due_at < ?1 AND status IN (?2, ?3, ?4)
           ORDER BY next_check_in_due_at"
        ))?;
        let rows = stmt
          .query_map(rusqlite::params![now_str, a, b, c], RawSubject::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawSubject::into_subject).collect()
  }

  async fn find_subjects_awaiting_reminder(
    &self,
    horizon: DateTime<Utc>,
  ) -> Result<Vec<Subject>> {
    let horizon_str = encode_dt(horizon);

    let raws = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {SUBJECT_COLUMNS} FROM subjects s
           WHERE s.status = ?2
             AND s.next_check_in_due_at <= ?1
             AND NOT EXISTS (
               SELECT 1 FROM check_in_records r
               WHERE r.subject_id = s.subject_id
                 AND r.kind = ?3
                 AND r.responded_at IS NULL
                 AND r.missed = 0
             )
           ORDER BY s.next_check_in_due_at"
        ))?;
        let rows = stmt
          .query_map(
            rusqlite::params![
              horizon_str,
              tag(SubjectStatus::Alive),
              tag(RecordKind::Reminder)
            ],
            RawSubject::from_row,
          )?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawSubject::into_subject).collect()
  }

  async fn record_check_in(
    &self,
    subject_id: Uuid,
    check_in:   CheckIn,
  ) -> Result<Option<(Subject, CheckInRecord)>> {
    let record = CheckInRecord {
      record_id:    Uuid::new_v4(),
      subject_id,
      kind:         RecordKind::CheckIn,
      method:       Some(check_in.method),
      sent_at:      check_in.at,
      responded_at: Some(check_in.at),
      missed:       false,
    };

    let id_str     = encode_uuid(subject_id);
    let record_str = encode_uuid(record.record_id);
    let method     = tag(check_in.method);
    let at         = check_in.at;

    let raw = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        if !apply_check_in(&tx, &id_str, &record_str, method, at)? {
          return Ok(None);
        }
        let raw = subject_row(&tx, &id_str)?;
        tx.commit()?;
        Ok(raw)
      })
      .await?;

    match raw {
      Some(raw) => Ok(Some((raw.into_subject()?, record))),
      None => Ok(None),
    }
  }

  async fn apply_transition(
    &self,
    transition:    Transition,
    notifications: Vec<NotificationIntent>,
  ) -> Result<Guarded<Subject>> {
    let id_str   = encode_uuid(transition.subject_id);
    let revision = encode_i64("revision", transition.expected_revision)?;
    let from     = tag(transition.from);
    let to       = tag(transition.to);
    let grace    = transition.grace_period_ends_at.map(encode_dt);
    let notices  = outbox::encode(notifications)?;

    let outcome = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let changed = tx.execute(
          "UPDATE subjects
           SET status = ?3, grace_period_ends_at = ?4, revision = revision + 1
           WHERE subject_id = ?1 AND revision = ?2 AND status = ?5",
          rusqlite::params![id_str, revision, to, grace, from],
        )?;
        if changed == 0 {
          return Ok(if subject_exists(&tx, &id_str)? {
            Guarded::Rejected
          } else {
            Guarded::Missing
          });
        }
        tx.execute(
          "UPDATE check_in_records SET missed = 1
           WHERE subject_id = ?1 AND responded_at IS NULL AND missed = 0",
          rusqlite::params![id_str],
        )?;
        outbox::insert(&tx, &notices)?;
        let raw = subject_row(&tx, &id_str)?;
        tx.commit()?;
        Ok(raw.map_or(Guarded::Missing, Guarded::Applied))
      })
      .await?;

    decode_guarded(outcome, RawSubject::into_subject)
  }

  // ── Check-in records ──────────────────────────────────────────────────────

  async fn create_reminder(
    &self,
    subject_id:        Uuid,
    expected_revision: u64,
    sent_at:           DateTime<Utc>,
    notification:      NotificationIntent,
  ) -> Result<Guarded<CheckInRecord>> {
    let record = CheckInRecord {
      record_id: Uuid::new_v4(),
      subject_id,
      kind: RecordKind::Reminder,
      method: None,
      sent_at,
      responded_at: None,
      missed: false,
    };

    let id_str     = encode_uuid(subject_id);
    let record_str = encode_uuid(record.record_id);
    let at_str     = encode_dt(sent_at);
    let revision   = encode_i64("revision", expected_revision)?;
    let notices    = outbox::encode(vec![notification])?;

    let outcome = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let current: Option<(String, i64)> = tx
          .query_row(
            "SELECT status, revision FROM subjects WHERE subject_id = ?1",
            rusqlite::params![id_str],
            |r| Ok((r.get(0)?, r.get(1)?)),
          )
          .optional()?;
        let Some((status, current_revision)) = current else {
          return Ok(Guarded::Missing);
        };
        if status != tag(SubjectStatus::Alive) || current_revision != revision {
          return Ok(Guarded::Rejected);
        }

        let outstanding: bool = tx.query_row(
          "SELECT EXISTS(
             SELECT 1 FROM check_in_records
             WHERE subject_id = ?1 AND kind = ?2
               AND responded_at IS NULL AND missed = 0
           )",
          rusqlite::params![id_str, tag(RecordKind::Reminder)],
          |r| r.get(0),
        )?;
        if outstanding {
          return Ok(Guarded::Rejected);
        }

        tx.execute(
          "INSERT INTO check_in_records
             (record_id, subject_id, kind, method, sent_at, responded_at, missed)
           VALUES (?1, ?2, ?3, NULL, ?4, NULL, 0)",
          rusqlite::params![record_str, id_str, tag(RecordKind::Reminder), at_str],
        )?;
        outbox::insert(&tx, &notices)?;
        tx.commit()?;
        Ok(Guarded::Applied(()))
      })
      .await?;

    Ok(outcome.map(|()| record))
  }

  async fn list_check_in_records(
    &self,
    subject_id: Uuid,
    limit:      usize,
  ) -> Result<Vec<CheckInRecord>> {
    let id_str = encode_uuid(subject_id);
    let limit  = encode_i64("limit", limit)?;

    let raws = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {RECORD_COLUMNS} FROM check_in_records
           WHERE subject_id = ?1
           ORDER BY sent_at DESC, rowid DESC
           LIMIT ?2"
        ))?;
        let rows = stmt
          .query_map(rusqlite::params![id_str, limit], RawRecord::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawRecord::into_record).collect()
  }

  // ── Trusted contacts ──────────────────────────────────────────────────────

  async fn add_trusted_contact(
    &self,
    input: NewTrustedContact,
  ) -> Result<TrustedContact> {
    let contact = TrustedContact {
      contact_id:          Uuid::new_v4(),
      subject_id:          input.subject_id,
      name:                input.name,
      email:               input.email,
      verification_status: VerificationStatus::Pending,
      confirmed_death:     false,
      confirmed_at:        None,
      created_at:          input.created_at,
    };

    let id_str      = encode_uuid(contact.contact_id);
    let subject_str = encode_uuid(contact.subject_id);
    let name        = contact.name.clone();
    let email       = contact.email.clone();
    let token_hash  = input.token_hash;
    let at_str      = encode_dt(contact.created_at);

    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO trusted_contacts
             (contact_id, subject_id, name, email, token_hash, verification_status, created_at)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
          rusqlite::params![
            id_str,
            subject_str,
            name,
            email,
            token_hash,
            tag(VerificationStatus::Pending),
            at_str
          ],
        )?;
        Ok(())
      })
      .await?;

    Ok(contact)
  }

  async fn get_trusted_contact(&self, id: Uuid) -> Result<Option<TrustedContact>> {
    let id_str = encode_uuid(id);
    let raw = self
      .conn
      .call(move |conn| Ok(contact_row(conn, &id_str)?))
      .await?;
    raw.map(RawContact::into_contact).transpose()
  }

  async fn find_trusted_contact_by_token(
    &self,
    token_hash: String,
  ) -> Result<Option<TrustedContact>> {
    let raw = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              &format!(
                "SELECT {CONTACT_COLUMNS} FROM trusted_contacts WHERE token_hash = ?1"
              ),
              rusqlite::params![token_hash],
              RawContact::from_row,
            )
            .optional()?,
        )
      })
      .await?;
    raw.map(RawContact::into_contact).transpose()
  }

  async fn list_trusted_contacts(&self, subject_id: Uuid) -> Result<Vec<TrustedContact>> {
    let id_str = encode_uuid(subject_id);

    let raws = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {CONTACT_COLUMNS} FROM trusted_contacts
           WHERE subject_id = ?1
           ORDER BY created_at, rowid"
        ))?;
        let rows = stmt
          .query_map(rusqlite::params![id_str], RawContact::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawContact::into_contact).collect()
  }

  async fn verify_trusted_contact(&self, id: Uuid) -> Result<Option<TrustedContact>> {
    let id_str = encode_uuid(id);

    let raw = self
      .conn
      .call(move |conn| {
        conn.execute(
          "UPDATE trusted_contacts SET verification_status = ?2 WHERE contact_id = ?1",
          rusqlite::params![id_str, tag(VerificationStatus::Verified)],
        )?;
        Ok(contact_row(conn, &id_str)?)
      })
      .await?;

    raw.map(RawContact::into_contact).transpose()
  }

  async fn confirm_death(
    &self,
    contact_id: Uuid,
    at:         DateTime<Utc>,
  ) -> Result<Guarded<TrustedContact>> {
    let id_str = encode_uuid(contact_id);
    let at_str = encode_dt(at);

    let outcome = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let changed = tx.execute(
          "UPDATE trusted_contacts SET confirmed_death = 1, confirmed_at = ?2
           WHERE contact_id = ?1 AND confirmed_death = 0",
          rusqlite::params![id_str, at_str],
        )?;
        let raw = contact_row(&tx, &id_str)?;
        tx.commit()?;
        Ok(match (changed, raw) {
          (_, None) => Guarded::Missing,
          (0, Some(_)) => Guarded::Rejected,
          (_, Some(raw)) => Guarded::Applied(raw),
        })
      })
      .await?;

    decode_guarded(outcome, RawContact::into_contact)
  }

  async fn count_confirmed_contacts(&self, subject_id: Uuid) -> Result<u32> {
    let id_str = encode_uuid(subject_id);
    let count: i64 = self
      .conn
      .call(move |conn| {
        Ok(conn.query_row(
          "SELECT COUNT(*) FROM trusted_contacts
           WHERE subject_id = ?1 AND confirmed_death = 1",
          rusqlite::params![id_str],
          |r| r.get(0),
        )?)
      })
      .await?;
    u32::try_from(count).map_err(|_| Error::OutOfRange("confirmed_death"))
  }

  // ── Recipients ────────────────────────────────────────────────────────────

  async fn add_recipient(&self, input: NewRecipient) -> Result<Recipient> {
    let recipient = Recipient {
      recipient_id:      Uuid::new_v4(),
      subject_id:        input.subject_id,
      name:              input.name,
      email:             input.email,
      access_expires_at: None,
      created_at:        input.created_at,
    };

    let id_str      = encode_uuid(recipient.recipient_id);
    let subject_str = encode_uuid(recipient.subject_id);
    let name        = recipient.name.clone();
    let email       = recipient.email.clone();
    let at_str      = encode_dt(recipient.created_at);

    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO recipients (recipient_id, subject_id, name, email, created_at)
           VALUES (?1, ?2, ?3, ?4, ?5)",
          rusqlite::params![id_str, subject_str, name, email, at_str],
        )?;
        Ok(())
      })
      .await?;

    Ok(recipient)
  }

  async fn list_recipients(&self, subject_id: Uuid) -> Result<Vec<Recipient>> {
    let id_str = encode_uuid(subject_id);

    let raws = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {RECIPIENT_COLUMNS} FROM recipients
           WHERE subject_id = ?1
           ORDER BY created_at, rowid"
        ))?;
        let rows = stmt
          .query_map(rusqlite::params![id_str], RawRecipient::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawRecipient::into_recipient).collect()
  }

  // ── Unlock requests ───────────────────────────────────────────────────────

  async fn find_pending_unlock_requests(
    &self,
    subject_id: Uuid,
  ) -> Result<Vec<UnlockRequest>> {
    let id_str = encode_uuid(subject_id);

    let raws = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {REQUEST_COLUMNS} FROM unlock_requests
           WHERE subject_id = ?1 AND status = ?2
           ORDER BY created_at"
        ))?;
        let rows = stmt
          .query_map(
            rusqlite::params![id_str, tag(UnlockStatus::Pending)],
            RawRequest::from_row,
          )?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawRequest::into_request).collect()
  }

  async fn get_unlock_request(&self, id: Uuid) -> Result<Option<UnlockRequest>> {
    let id_str = encode_uuid(id);
    let raw = self
      .conn
      .call(move |conn| Ok(request_row(conn, &id_str)?))
      .await?;
    raw.map(RawRequest::into_request).transpose()
  }

  async fn list_unlock_requests(&self, subject_id: Uuid) -> Result<Vec<UnlockRequest>> {
    let id_str = encode_uuid(subject_id);

    let raws = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {REQUEST_COLUMNS} FROM unlock_requests
           WHERE subject_id = ?1
           ORDER BY created_at DESC, rowid DESC"
        ))?;
        let rows = stmt
          .query_map(rusqlite::params![id_str], RawRequest::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawRequest::into_request).collect()
  }

  async fn find_escalated_awaiting_request(
    &self,
    min_confirmations: u32,
  ) -> Result<Vec<Subject>> {
    let min = i64::from(min_confirmations);

    let raws = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {SUBJECT_COLUMNS} FROM subjects s
           WHERE s.status = ?1
             AND NOT EXISTS (
               SELECT 1 FROM unlock_requests r
               WHERE r.subject_id = s.subject_id AND r.status = ?2
             )
             AND (
               SELECT COUNT(*) FROM trusted_contacts c
               WHERE c.subject_id = s.subject_id AND c.confirmed_death = 1
             ) >= ?3
           ORDER BY s.grace_period_ends_at"
        ))?;
        let rows = stmt
          .query_map(
            rusqlite::params![
              tag(SubjectStatus::Escalation),
              tag(UnlockStatus::Pending),
              min
            ],
            RawSubject::from_row,
          )?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawSubject::into_subject).collect()
  }

  async fn open_unlock_request(
    &self,
    input: NewUnlockRequest,
  ) -> Result<Guarded<UnlockRequest>> {
    let request = UnlockRequest {
      request_id:           input.request_id,
      subject_id:           input.subject_id,
      status:               UnlockStatus::Pending,
      confirmations_count:  input.confirmations_count,
      initiated_by:         input.initiated_by,
      grace_period_ends_at: input.grace_period_ends_at,
      created_at:           input.created_at,
      completed_at:         None,
    };

    let request_str  = encode_uuid(request.request_id);
    let subject_str  = encode_uuid(request.subject_id);
    let count        = i64::from(request.confirmations_count);
    let initiated_by = request.initiated_by.clone();
    let grace_str    = encode_dt(request.grace_period_ends_at);
    let at_str       = encode_dt(request.created_at);
    let details      = serde_json::json!({
      "request_id":           request.request_id,
      "confirmations_count":  request.confirmations_count,
      "grace_period_ends_at": grace_str,
    });
    let notices      = outbox::encode(input.notifications)?;

    let outcome = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let status: Option<String> = tx
          .query_row(
            "SELECT status FROM subjects WHERE subject_id = ?1",
            rusqlite::params![subject_str],
            |r| r.get(0),
          )
          .optional()?;
        let Some(status) = status else {
          return Ok(Guarded::Missing);
        };
        if status != tag(SubjectStatus::Escalation) {
          return Ok(Guarded::Rejected);
        }

        let pending: bool = tx.query_row(
          "SELECT EXISTS(
             SELECT 1 FROM unlock_requests WHERE subject_id = ?1 AND status = ?2
           )",
          rusqlite::params![subject_str, tag(UnlockStatus::Pending)],
          |r| r.get(0),
        )?;
        if pending {
          return Ok(Guarded::Rejected);
        }

        tx.execute(
          "INSERT INTO unlock_requests
             (request_id, subject_id, status, confirmations_count, initiated_by,
              grace_period_ends_at, created_at)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
          rusqlite::params![
            request_str,
            subject_str,
            tag(UnlockStatus::Pending),
            count,
            initiated_by,
            grace_str,
            at_str
          ],
        )?;
        tx.execute(
          "UPDATE subjects
           SET status = ?2, grace_period_ends_at = ?3, revision = revision + 1
           WHERE subject_id = ?1",
          rusqlite::params![subject_str, tag(SubjectStatus::UnlockPending), grace_str],
        )?;
        insert_audit(
          &tx,
          Some(&subject_str),
          AuditAction::UnlockRequestInitiated,
          &initiated_by,
          &details,
          &at_str,
        )?;
        outbox::insert(&tx, &notices)?;
        tx.commit()?;
        Ok(Guarded::Applied(()))
      })
      .await?;

    Ok(outcome.map(|()| request))
  }

  async fn sync_confirmations(
    &self,
    request_id: Uuid,
    count:      u32,
  ) -> Result<Guarded<UnlockRequest>> {
    let id_str = encode_uuid(request_id);
    let count  = i64::from(count);

    let outcome = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let changed = tx.execute(
          "UPDATE unlock_requests SET confirmations_count = ?2
           WHERE request_id = ?1 AND status = ?3",
          rusqlite::params![id_str, count, tag(UnlockStatus::Pending)],
        )?;
        let raw = request_row(&tx, &id_str)?;
        tx.commit()?;
        Ok(match (changed, raw) {
          (_, None) => Guarded::Missing,
          (0, Some(_)) => Guarded::Rejected,
          (_, Some(raw)) => Guarded::Applied(raw),
        })
      })
      .await?;

    decode_guarded(outcome, RawRequest::into_request)
  }

  async fn find_expired_pending_requests(
    &self,
    now: DateTime<Utc>,
  ) -> Result<Vec<UnlockRequest>> {
    let now_str = encode_dt(now);

    let raws = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {REQUEST_COLUMNS} FROM unlock_requests
           WHERE status = ?1 AND grace_period_ends_at < ?2
           ORDER BY grace_period_ends_at"
        ))?;
        let rows = stmt
          .query_map(
            rusqlite::params![tag(UnlockStatus::Pending), now_str],
            RawRequest::from_row,
          )?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawRequest::into_request).collect()
  }

  async fn approve_unlock_request(
    &self,
    request_id: Uuid,
    approval:   UnlockApproval,
  ) -> Result<Guarded<UnlockRequest>> {
    let id_str = encode_uuid(request_id);
    let at_str = encode_dt(approval.at);
    let grants: Vec<(String, String, String)> = approval
      .grants
      .into_iter()
      .map(|g| (encode_uuid(g.recipient_id), g.token_hash, encode_dt(g.expires_at)))
      .collect();
    let actor   = Actor::Scheduler.to_string();
    let notices = outbox::encode(approval.notifications)?;

    let outcome = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let Some(request) = request_row(&tx, &id_str)? else {
          return Ok(Guarded::Missing);
        };
        if request.status != tag(UnlockStatus::Pending) {
          return Ok(Guarded::Rejected);
        }
        let subject_status: Option<String> = tx
          .query_row(
            "SELECT status FROM subjects WHERE subject_id = ?1",
            rusqlite::params![request.subject_id],
            |r| r.get(0),
          )
          .optional()?;
        if subject_status.as_deref() != Some(tag(SubjectStatus::UnlockPending)) {
          return Ok(Guarded::Rejected);
        }

        tx.execute(
          "UPDATE unlock_requests SET status = ?2, completed_at = ?3
           WHERE request_id = ?1",
          rusqlite::params![id_str, tag(UnlockStatus::Approved), at_str],
        )?;
        tx.execute(
          "UPDATE subjects
           SET status = ?2, grace_period_ends_at = NULL, revision = revision + 1
           WHERE subject_id = ?1",
          rusqlite::params![request.subject_id, tag(SubjectStatus::Unlocked)],
        )?;
        let mut granted = 0usize;
        for (recipient_id, token_hash, expires_at) in &grants {
          granted += tx.execute(
            "UPDATE recipients SET access_token_hash = ?3, access_expires_at = ?4
             WHERE recipient_id = ?1 AND subject_id = ?2",
            rusqlite::params![recipient_id, request.subject_id, token_hash, expires_at],
          )?;
        }
        let details = serde_json::json!({
          "request_id":          id_str,
          "confirmations_count": request.confirmations_count,
          "recipient_count":     granted,
        });
        insert_audit(
          &tx,
          Some(&request.subject_id),
          AuditAction::VaultUnlocked,
          &actor,
          &details,
          &at_str,
        )?;
        outbox::insert(&tx, &notices)?;

        let raw = request_row(&tx, &id_str)?;
        tx.commit()?;
        Ok(raw.map_or(Guarded::Missing, Guarded::Applied))
      })
      .await?;

    decode_guarded(outcome, RawRequest::into_request)
  }

  async fn cancel_unlock_request(
    &self,
    request_id:   Uuid,
    cancellation: UnlockCancellation,
  ) -> Result<Guarded<UnlockRequest>> {
    let id_str     = encode_uuid(request_id);
    let record_str = encode_uuid(Uuid::new_v4());
    let at         = cancellation.at;
    let at_str     = encode_dt(at);
    let effect     = cancellation.effect;
    let action     = if cancellation.actor == Actor::Scheduler {
      AuditAction::UnlockRequestExpired
    } else {
      AuditAction::UnlockRequestCancelled
    };
    let actor      = cancellation.actor.to_string();
    let details    = serde_json::json!({
      "request_id": request_id,
      "reason":     cancellation.reason,
    });
    let notices    = outbox::encode(cancellation.notifications)?;

    let outcome = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let Some(request) = request_row(&tx, &id_str)? else {
          return Ok(Guarded::Missing);
        };
        if request.status != tag(UnlockStatus::Pending) {
          return Ok(Guarded::Rejected);
        }

        tx.execute(
          "UPDATE unlock_requests SET status = ?2, completed_at = ?3
           WHERE request_id = ?1",
          rusqlite::params![id_str, tag(UnlockStatus::Cancelled), at_str],
        )?;

        match effect {
          SubjectEffect::ResetToAlive { method } => {
            apply_check_in(&tx, &request.subject_id, &record_str, tag(method), at)?;
          }
          SubjectEffect::ReturnToEscalation => {
            tx.execute(
              "UPDATE subjects SET status = ?2, revision = revision + 1
               WHERE subject_id = ?1 AND status = ?3",
              rusqlite::params![
                request.subject_id,
                tag(SubjectStatus::Escalation),
                tag(SubjectStatus::UnlockPending)
              ],
            )?;
          }
          SubjectEffect::None => {}
        }

        insert_audit(
          &tx,
          Some(&request.subject_id),
          action,
          &actor,
          &details,
          &at_str,
        )?;
        outbox::insert(&tx, &notices)?;

        let raw = request_row(&tx, &id_str)?;
        tx.commit()?;
        Ok(raw.map_or(Guarded::Missing, Guarded::Applied))
      })
      .await?;

    decode_guarded(outcome, RawRequest::into_request)
  }

  // ── Audit ─────────────────────────────────────────────────────────────────

  async fn append_audit(&self, entry: NewAuditEntry) -> Result<AuditEntry> {
    let stored = AuditEntry {
      audit_id:    Uuid::new_v4(),
      subject_id:  entry.subject_id,
      action:      entry.action,
      actor:       entry.actor.to_string(),
      details:     entry.details,
      recorded_at: entry.recorded_at,
    };

    let id_str      = encode_uuid(stored.audit_id);
    let subject_str = stored.subject_id.map(encode_uuid);
    let action      = tag(stored.action);
    let actor       = stored.actor.clone();
    let details     = serde_json::to_string(&stored.details)?;
    let at_str      = encode_dt(stored.recorded_at);

    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO audit_log (audit_id, subject_id, action, actor, details, recorded_at)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
          rusqlite::params![id_str, subject_str, action, actor, details, at_str],
        )?;
        Ok(())
      })
      .await?;

    Ok(stored)
  }

  async fn list_audit(&self, subject_id: Uuid) -> Result<Vec<AuditEntry>> {
    let id_str = encode_uuid(subject_id);

    let raws = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {AUDIT_COLUMNS} FROM audit_log
           WHERE subject_id = ?1
           ORDER BY recorded_at, rowid"
        ))?;
        let rows = stmt
          .query_map(rusqlite::params![id_str], RawAudit::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawAudit::into_entry).collect()
  }

  // ── Notification outbox ───────────────────────────────────────────────────

  async fn pending_notifications(&self, limit: usize) -> Result<Vec<OutboxEntry>> {
    let limit = encode_i64("limit", limit)?;

    let raws = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {OUTBOX_COLUMNS} FROM notification_outbox
           WHERE delivered_at IS NULL
           ORDER BY created_at, rowid
           LIMIT ?1"
        ))?;
        let rows = stmt
          .query_map(rusqlite::params![limit], RawOutbox::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawOutbox::into_entry).collect()
  }

  async fn mark_notification_delivered(
    &self,
    dedupe_key: String,
    at:         DateTime<Utc>,
  ) -> Result<bool> {
    let at_str = encode_dt(at);
    let changed = self
      .conn
      .call(move |conn| {
        Ok(conn.execute(
          "UPDATE notification_outbox
           SET delivered_at = ?2, payload = '{}', last_error = NULL
           WHERE dedupe_key = ?1 AND delivered_at IS NULL",
          rusqlite::params![dedupe_key, at_str],
        )?)
      })
      .await?;
    Ok(changed == 1)
  }

  async fn record_notification_failure(
    &self,
    dedupe_key: String,
    error:      String,
  ) -> Result<bool> {
    let changed = self
      .conn
      .call(move |conn| {
        Ok(conn.execute(
          "UPDATE notification_outbox
           SET attempts = attempts + 1, last_error = ?2
           WHERE dedupe_key = ?1 AND delivered_at IS NULL",
          rusqlite::params![dedupe_key, error],
        )?)
      })
      .await?;
    Ok(changed == 1)
  }

  // ── Usage counters ────────────────────────────────────────────────────────

  async fn reset_usage_counters(&self, at: DateTime<Utc>) -> Result<u64> {
    let at_str = encode_dt(at);
    let changed = self
      .conn
      .call(move |conn| {
        Ok(conn.execute(
          "UPDATE usage_counters SET uploads_this_week = 0, last_reset_at = ?1
           WHERE uploads_this_week > 0",
          rusqlite::params![at_str],
        )?)
      })
      .await?;
    Ok(u64::try_from(changed).unwrap_or(u64::MAX))
  }
}
