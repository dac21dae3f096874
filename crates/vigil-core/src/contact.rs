//! Trusted contacts (death witnesses) and recipients (vault beneficiaries).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};
use uuid::Uuid;

// ─── Trusted contacts ────────────────────────────────────────────────────────

#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Default,
  Serialize,
  Deserialize,
  Display,
  EnumString,
  IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum VerificationStatus {
  #[default]
  Pending,
  Verified,
}

/// An independent human nominated by the subject to confirm their death.
///
/// The contact's access token is never stored; only its hash is, and it is
/// not part of this read model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustedContact {
  pub contact_id:          Uuid,
  pub subject_id:          Uuid,
  pub name:                String,
  pub email:               String,
  pub verification_status: VerificationStatus,
  pub confirmed_death:     bool,
  pub confirmed_at:        Option<DateTime<Utc>>,
  pub created_at:          DateTime<Utc>,
}

/// Input to [`crate::store::VaultStore::add_trusted_contact`].
#[derive(Debug, Clone)]
pub struct NewTrustedContact {
  pub subject_id: Uuid,
  pub name:       String,
  pub email:      String,
  /// Hex SHA-256 of the token handed to the contact.
  pub token_hash: String,
  pub created_at: DateTime<Utc>,
}

// ─── Recipients ──────────────────────────────────────────────────────────────

/// Someone who receives access to the vault once it unlocks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
  pub recipient_id:      Uuid,
  pub subject_id:        Uuid,
  pub name:              String,
  pub email:             String,
  /// Set when the vault unlocks.
  pub access_expires_at: Option<DateTime<Utc>>,
  pub created_at:        DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewRecipient {
  pub subject_id: Uuid,
  pub name:       String,
  pub email:      String,
  pub created_at: DateTime<Utc>,
}

/// A freshly minted access token for one recipient. Only the hash is
/// persisted; the plaintext travels in the recipient's notification.
#[derive(Debug, Clone)]
pub struct RecipientGrant {
  pub recipient_id: Uuid,
  pub token_hash:   String,
  pub expires_at:   DateTime<Utc>,
}
