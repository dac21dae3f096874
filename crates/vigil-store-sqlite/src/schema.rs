//! SQL schema for the Vigil SQLite store.
//!
//! Executed once at connection startup via `PRAGMA user_version`. Future
//! migrations will be gated on that version number.

/// Full schema DDL; idempotent thanks to `CREATE ... IF NOT EXISTS`.
///
/// Timestamps are fixed-width RFC 3339 UTC strings
/// (`2030-01-01T00:00:00.000000Z`), so `<` on the column orders instants.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS subjects (
    subject_id             TEXT PRIMARY KEY,
    status                 TEXT NOT NULL,
    last_check_in_at       TEXT,
    next_check_in_due_at   TEXT NOT NULL,
    check_in_interval_days INTEGER NOT NULL CHECK (check_in_interval_days > 0),
    grace_period_ends_at   TEXT,
    created_at             TEXT NOT NULL,
    revision               INTEGER NOT NULL DEFAULT 0,
    -- A grace deadline exists exactly while the subject is escalated.
    CHECK ((grace_period_ends_at IS NOT NULL)
           = (status IN ('escalation', 'unlock_pending')))
);

-- Reminders and check-ins. Rows are appended; only responded_at and missed
-- are ever updated.
CREATE TABLE IF NOT EXISTS check_in_records (
    record_id    TEXT PRIMARY KEY,
    subject_id   TEXT NOT NULL REFERENCES subjects(subject_id),
    kind         TEXT NOT NULL,   -- 'reminder' | 'check_in'
    method       TEXT,
    sent_at      TEXT NOT NULL,
    responded_at TEXT,
    missed       INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS trusted_contacts (
    contact_id          TEXT PRIMARY KEY,
    subject_id          TEXT NOT NULL REFERENCES subjects(subject_id),
    name                TEXT NOT NULL,
    email               TEXT NOT NULL,
    token_hash          TEXT NOT NULL UNIQUE,
    verification_status TEXT NOT NULL DEFAULT 'pending',
    confirmed_death     INTEGER NOT NULL DEFAULT 0,
    confirmed_at        TEXT,
    created_at          TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS recipients (
    recipient_id      TEXT PRIMARY KEY,
    subject_id        TEXT NOT NULL REFERENCES subjects(subject_id),
    name              TEXT NOT NULL,
    email             TEXT NOT NULL,
    access_token_hash TEXT,
    access_expires_at TEXT,
    created_at        TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS unlock_requests (
    request_id           TEXT PRIMARY KEY,
    subject_id           TEXT NOT NULL REFERENCES subjects(subject_id),
    status               TEXT NOT NULL,   -- 'pending' | 'approved' | 'cancelled'
    confirmations_count  INTEGER NOT NULL DEFAULT 0,
    initiated_by         TEXT NOT NULL,
    grace_period_ends_at TEXT NOT NULL,
    created_at           TEXT NOT NULL,
    completed_at         TEXT
);

-- At most one pending request per subject.
CREATE UNIQUE INDEX IF NOT EXISTS unlock_requests_one_pending
    ON unlock_requests(subject_id) WHERE status = 'pending';

CREATE TABLE IF NOT EXISTS audit_log (
    audit_id    TEXT PRIMARY KEY,
    subject_id  TEXT,
    action      TEXT NOT NULL,
    actor       TEXT NOT NULL,
    details     TEXT NOT NULL DEFAULT '{}',
    recorded_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS usage_counters (
    subject_id        TEXT PRIMARY KEY REFERENCES subjects(subject_id),
    uploads_this_week INTEGER NOT NULL DEFAULT 0,
    last_reset_at     TEXT
);

-- Notification outbox, filled by the writes that owe a notice. The delivery
-- relay drains undelivered rows; a delivered row keeps only its envelope.
CREATE TABLE IF NOT EXISTS notification_outbox (
    dedupe_key   TEXT PRIMARY KEY,
    subject_id   TEXT NOT NULL,
    kind         TEXT NOT NULL,
    priority     TEXT NOT NULL,
    payload      TEXT NOT NULL,
    created_at   TEXT NOT NULL,
    delivered_at TEXT,
    attempts     INTEGER NOT NULL DEFAULT 0,
    last_error   TEXT
);

CREATE INDEX IF NOT EXISTS subjects_due_idx       ON subjects(status, next_check_in_due_at);
CREATE INDEX IF NOT EXISTS records_subject_idx    ON check_in_records(subject_id, sent_at);
CREATE INDEX IF NOT EXISTS contacts_subject_idx   ON trusted_contacts(subject_id);
CREATE INDEX IF NOT EXISTS recipients_subject_idx ON recipients(subject_id);
CREATE INDEX IF NOT EXISTS requests_expiry_idx    ON unlock_requests(status, grace_period_ends_at);
CREATE INDEX IF NOT EXISTS audit_subject_idx      ON audit_log(subject_id, recorded_at);
CREATE INDEX IF NOT EXISTS outbox_pending_idx     ON notification_outbox(delivered_at, created_at);

PRAGMA user_version = 1;
";
