//! Queueing notification intents inside a write transaction.
//!
//! Intents land in `notification_outbox` keyed by their dedupe key. A second
//! intent with the same key is ignored, which is what makes repeated sweeps
//! safe to run. Payloads are serialised before the connection call.

use vigil_core::notification::NotificationIntent;

use crate::{
  encode::{encode_dt, encode_uuid},
  Result,
};

/// An intent flattened to its column values.
pub struct OutboxRow {
  dedupe_key: String,
  subject_id: String,
  kind:       &'static str,
  priority:   &'static str,
  payload:    String,
  created_at: String,
}

pub fn encode(intents: Vec<NotificationIntent>) -> Result<Vec<OutboxRow>> {
  intents
    .into_iter()
    .map(|intent| {
      Ok(OutboxRow {
        payload:    serde_json::to_string(&intent.payload)?,
        subject_id: encode_uuid(intent.subject_id),
        kind:       intent.kind.into(),
        priority:   intent.priority.into(),
        created_at: encode_dt(intent.created_at),
        dedupe_key: intent.dedupe_key,
      })
    })
    .collect()
}

/// Queue `rows`, skipping keys already present. Returns how many were new.
pub fn insert(conn: &rusqlite::Connection, rows: &[OutboxRow]) -> rusqlite::Result<usize> {
  let mut stmt = conn.prepare(
    "INSERT OR IGNORE INTO notification_outbox
       (dedupe_key, subject_id, kind, priority, payload, created_at)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
  )?;
  let mut inserted = 0;
  for row in rows {
    inserted += stmt.execute(rusqlite::params![
      row.dedupe_key,
      row.subject_id,
      row.kind,
      row.priority,
      row.payload,
      row.created_at
    ])?;
  }
  Ok(inserted)
}
