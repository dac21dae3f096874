//! Encoding and decoding helpers between Rust domain types and the plain-text
//! representations stored in SQLite columns.
//!
//! Timestamps are stored as fixed-width RFC 3339 strings, enums as their
//! snake_case names, UUIDs as hyphenated lowercase strings and free-form
//! details as compact JSON. Rows are first read into `Raw*` structs of plain
//! strings inside the connection thread and decoded afterwards.

use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;
use vigil_core::{
  audit::AuditEntry,
  check_in::CheckInRecord,
  contact::{Recipient, TrustedContact},
  notification::{NotificationIntent, OutboxEntry},
  subject::Subject,
  unlock::UnlockRequest,
};

use crate::{Error, Result};

// ─── Scalars ─────────────────────────────────────────────────────────────────

pub fn encode_uuid(id: Uuid) -> String { id.hyphenated().to_string() }

pub fn decode_uuid(s: &str) -> Result<Uuid> { Ok(Uuid::parse_str(s)?) }

pub fn encode_dt(dt: DateTime<Utc>) -> String {
  dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn decode_dt(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::DateParse(e.to_string()))
}

fn decode_opt_dt(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
  s.as_deref().map(decode_dt).transpose()
}

/// Decode a strum-backed enum column.
pub fn decode_enum<T: FromStr>(kind: &'static str, s: &str) -> Result<T> {
  s.parse().map_err(|_| {
    Error::Core(vigil_core::Error::UnknownVariant {
      kind,
      value: s.to_owned(),
    })
  })
}

fn decode_u32(column: &'static str, v: i64) -> Result<u32> {
  u32::try_from(v).map_err(|_| Error::OutOfRange(column))
}

fn decode_u64(column: &'static str, v: i64) -> Result<u64> {
  u64::try_from(v).map_err(|_| Error::OutOfRange(column))
}

/// An unsigned count or revision as an SQLite integer.
pub fn encode_i64<T: TryInto<i64>>(column: &'static str, v: T) -> Result<i64> {
  v.try_into().map_err(|_| Error::OutOfRange(column))
}

// ─── Subjects ────────────────────────────────────────────────────────────────

pub const SUBJECT_COLUMNS: &str = "subject_id, status, last_check_in_at, \
   next_check_in_due_at, check_in_interval_days, grace_period_ends_at, \
   created_at, revision";

/// Raw strings read directly from a `subjects` row.
pub struct RawSubject {
  pub subject_id:             String,
  pub status:                 String,
  pub last_check_in_at:       Option<String>,
  pub next_check_in_due_at:   String,
  pub check_in_interval_days: i64,
  pub grace_period_ends_at:   Option<String>,
  pub created_at:             String,
  pub revision:               i64,
}

impl RawSubject {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      subject_id:             row.get(0)?,
      status:                 row.get(1)?,
      last_check_in_at:       row.get(2)?,
      next_check_in_due_at:   row.get(3)?,
      check_in_interval_days: row.get(4)?,
      grace_period_ends_at:   row.get(5)?,
      created_at:             row.get(6)?,
      revision:               row.get(7)?,
    })
  }

  pub fn into_subject(self) -> Result<Subject> {
    Ok(Subject {
      subject_id:             decode_uuid(&self.subject_id)?,
      status:                 decode_enum("subject status", &self.status)?,
      last_check_in_at:       decode_opt_dt(self.last_check_in_at)?,
      next_check_in_due_at:   decode_dt(&self.next_check_in_due_at)?,
      check_in_interval_days: decode_u32(
        "check_in_interval_days",
        self.check_in_interval_days,
      )?,
      grace_period_ends_at:   decode_opt_dt(self.grace_period_ends_at)?,
      created_at:             decode_dt(&self.created_at)?,
      revision:               decode_u64("revision", self.revision)?,
    })
  }
}

// ─── Check-in records ────────────────────────────────────────────────────────

pub const RECORD_COLUMNS: &str =
  "record_id, subject_id, kind, method, sent_at, responded_at, missed";

pub struct RawRecord {
  pub record_id:    String,
  pub subject_id:   String,
  pub kind:         String,
  pub method:       Option<String>,
  pub sent_at:      String,
  pub responded_at: Option<String>,
  pub missed:       bool,
}

impl RawRecord {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      record_id:    row.get(0)?,
      subject_id:   row.get(1)?,
      kind:         row.get(2)?,
      method:       row.get(3)?,
      sent_at:      row.get(4)?,
      responded_at: row.get(5)?,
      missed:       row.get(6)?,
    })
  }

  pub fn into_record(self) -> Result<CheckInRecord> {
    Ok(CheckInRecord {
      record_id:    decode_uuid(&self.record_id)?,
      subject_id:   decode_uuid(&self.subject_id)?,
      kind:         decode_enum("record kind", &self.kind)?,
      method:       self
        .method
        .as_deref()
        .map(|m| decode_enum("check-in method", m))
        .transpose()?,
      sent_at:      decode_dt(&self.sent_at)?,
      responded_at: decode_opt_dt(self.responded_at)?,
      missed:       self.missed,
    })
  }
}

// ─── Trusted contacts ────────────────────────────────────────────────────────

pub const CONTACT_COLUMNS: &str = "contact_id, subject_id, name, email, \
   verification_status, confirmed_death, confirmed_at, created_at";

pub struct RawContact {
  pub contact_id:          String,
  pub subject_id:          String,
  pub name:                String,
  pub email:               String,
  pub verification_status: String,
  pub confirmed_death:     bool,
  pub confirmed_at:        Option<String>,
  pub created_at:          String,
}

impl RawContact {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      contact_id:          row.get(0)?,
      subject_id:          row.get(1)?,
      name:                row.get(2)?,
      email:               row.get(3)?,
      verification_status: row.get(4)?,
      confirmed_death:     row.get(5)?,
      confirmed_at:        row.get(6)?,
      created_at:          row.get(7)?,
    })
  }

  pub fn into_contact(self) -> Result<TrustedContact> {
    Ok(TrustedContact {
      contact_id:          decode_uuid(&self.contact_id)?,
      subject_id:          decode_uuid(&self.subject_id)?,
      name:                self.name,
      email:               self.email,
      verification_status: decode_enum(
        "verification status",
        &self.verification_status,
      )?,
      confirmed_death:     self.confirmed_death,
      confirmed_at:        decode_opt_dt(self.confirmed_at)?,
      created_at:          decode_dt(&self.created_at)?,
    })
  }
}

// ─── Recipients ──────────────────────────────────────────────────────────────

pub const RECIPIENT_COLUMNS: &str =
  "recipient_id, subject_id, name, email, access_expires_at, created_at";

pub struct RawRecipient {
  pub recipient_id:      String,
  pub subject_id:        String,
  pub name:              String,
  pub email:             String,
  pub access_expires_at: Option<String>,
  pub created_at:        String,
}

impl RawRecipient {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      recipient_id:      row.get(0)?,
      subject_id:        row.get(1)?,
      name:              row.get(2)?,
      email:             row.get(3)?,
      access_expires_at: row.get(4)?,
      created_at:        row.get(5)?,
    })
  }

  pub fn into_recipient(self) -> Result<Recipient> {
    Ok(Recipient {
      recipient_id:      decode_uuid(&self.recipient_id)?,
      subject_id:        decode_uuid(&self.subject_id)?,
      name:              self.name,
      email:             self.email,
      access_expires_at: decode_opt_dt(self.access_expires_at)?,
      created_at:        decode_dt(&self.created_at)?,
    })
  }
}

// ─── Unlock requests ─────────────────────────────────────────────────────────

pub const REQUEST_COLUMNS: &str = "request_id, subject_id, status, \
   confirmations_count, initiated_by, grace_period_ends_at, created_at, \
   completed_at";

pub struct RawRequest {
  pub request_id:           String,
  pub subject_id:           String,
  pub status:               String,
  pub confirmations_count:  i64,
  pub initiated_by:         String,
  pub grace_period_ends_at: String,
  pub created_at:           String,
  pub completed_at:         Option<String>,
}

impl RawRequest {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      request_id:           row.get(0)?,
      subject_id:           row.get(1)?,
      status:               row.get(2)?,
      confirmations_count:  row.get(3)?,
      initiated_by:         row.get(4)?,
      grace_period_ends_at: row.get(5)?,
      created_at:           row.get(6)?,
      completed_at:         row.get(7)?,
    })
  }

  pub fn into_request(self) -> Result<UnlockRequest> {
    Ok(UnlockRequest {
      request_id:           decode_uuid(&self.request_id)?,
      subject_id:           decode_uuid(&self.subject_id)?,
      status:               decode_enum("unlock status", &self.status)?,
      confirmations_count:  decode_u32(
        "confirmations_count",
        self.confirmations_count,
      )?,
      initiated_by:         self.initiated_by,
      grace_period_ends_at: decode_dt(&self.grace_period_ends_at)?,
      created_at:           decode_dt(&self.created_at)?,
      completed_at:         decode_opt_dt(self.completed_at)?,
    })
  }
}

// ─── Audit ───────────────────────────────────────────────────────────────────

pub const AUDIT_COLUMNS: &str =
  "audit_id, subject_id, action, actor, details, recorded_at";

pub struct RawAudit {
  pub audit_id:    String,
  pub subject_id:  Option<String>,
  pub action:      String,
  pub actor:       String,
  pub details:     String,
  pub recorded_at: String,
}

impl RawAudit {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      audit_id:    row.get(0)?,
      subject_id:  row.get(1)?,
      action:      row.get(2)?,
      actor:       row.get(3)?,
      details:     row.get(4)?,
      recorded_at: row.get(5)?,
    })
  }

  pub fn into_entry(self) -> Result<AuditEntry> {
    Ok(AuditEntry {
      audit_id:    decode_uuid(&self.audit_id)?,
      subject_id:  self.subject_id.as_deref().map(decode_uuid).transpose()?,
      action:      decode_enum("audit action", &self.action)?,
      actor:       self.actor,
      details:     serde_json::from_str(&self.details)?,
      recorded_at: decode_dt(&self.recorded_at)?,
    })
  }
}

// ─── Notification outbox ─────────────────────────────────────────────────────

pub const OUTBOX_COLUMNS: &str = "dedupe_key, subject_id, kind, priority, \
   payload, created_at, attempts, last_error";

pub struct RawOutbox {
  pub dedupe_key: String,
  pub subject_id: String,
  pub kind:       String,
  pub priority:   String,
  pub payload:    String,
  pub created_at: String,
  pub attempts:   i64,
  pub last_error: Option<String>,
}

impl RawOutbox {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      dedupe_key: row.get(0)?,
      subject_id: row.get(1)?,
      kind:       row.get(2)?,
      priority:   row.get(3)?,
      payload:    row.get(4)?,
      created_at: row.get(5)?,
      attempts:   row.get(6)?,
      last_error: row.get(7)?,
    })
  }

  pub fn into_entry(self) -> Result<OutboxEntry> {
    Ok(OutboxEntry {
      intent:     NotificationIntent {
        subject_id: decode_uuid(&self.subject_id)?,
        kind:       decode_enum("notification kind", &self.kind)?,
        dedupe_key: self.dedupe_key,
        priority:   decode_enum("notification priority", &self.priority)?,
        payload:    serde_json::from_str(&self.payload)?,
        created_at: decode_dt(&self.created_at)?,
      },
      attempts:   decode_u32("attempts", self.attempts)?,
      last_error: self.last_error,
    })
  }
}
