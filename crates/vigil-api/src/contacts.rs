//! Handlers for trusted contacts and death confirmation.
//!
//! | Method | Path | Notes |
//! |--------|------|-------|
//! | `POST` | `/subjects/:id/trusted-contacts` | Body: `{"name","email"}`; token shown once |
//! | `GET`  | `/subjects/:id/trusted-contacts` | |
//! | `POST` | `/trusted-contacts/verify` | Body: `{"token":".."}` |
//! | `POST` | `/confirm-death` | Body: `{"token":".."}`; 409 on a repeat |

use std::sync::Arc;

use axum::{
  Json,
  extract::{Path, State},
  http::StatusCode,
  response::IntoResponse,
};
use serde::Deserialize;
use uuid::Uuid;
use vigil_core::{
  contact::TrustedContact,
  notification::NotificationGateway,
  store::VaultStore,
};
use vigil_engine::{Engine, confirmation::ConfirmationOutcome};

use crate::error::ApiError;

/// Trim and sanity-check a name/email pair.
pub(crate) fn validate_person(
  name: String,
  email: String,
) -> Result<(String, String), ApiError> {
  let name = name.trim();
  let email = email.trim();
  if name.is_empty() {
    return Err(ApiError::BadRequest("name must not be empty".into()));
  }
  match email.split_once('@') {
    Some((local, domain)) if !local.is_empty() && !domain.is_empty() => {}
    _ => return Err(ApiError::BadRequest(format!("invalid email address: {email:?}"))),
  }
  Ok((name.to_owned(), email.to_owned()))
}

// ─── Contacts ─────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ContactBody {
  pub name:  String,
  pub email: String,
}

/// `POST /subjects/:id/trusted-contacts`
pub async fn add<S, N>(
  State(engine): State<Arc<Engine<S, N>>>,
  Path(id): Path<Uuid>,
  Json(body): Json<ContactBody>,
) -> Result<impl IntoResponse, ApiError>
where
  S: VaultStore,
  N: NotificationGateway,
{
  let (name, email) = validate_person(body.name, body.email)?;
  let issued = engine.confirmations().add_contact(id, name, email).await?;
  Ok((StatusCode::CREATED, Json(issued)))
}

/// `GET /subjects/:id/trusted-contacts`
pub async fn list<S, N>(
  State(engine): State<Arc<Engine<S, N>>>,
  Path(id): Path<Uuid>,
) -> Result<Json<Vec<TrustedContact>>, ApiError>
where
  S: VaultStore,
  N: NotificationGateway,
{
  Ok(Json(engine.confirmations().list_contacts(id).await?))
}

// ─── Token endpoints ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct TokenBody {
  pub token: String,
}

/// `POST /trusted-contacts/verify`
pub async fn verify<S, N>(
  State(engine): State<Arc<Engine<S, N>>>,
  Json(body): Json<TokenBody>,
) -> Result<Json<TrustedContact>, ApiError>
where
  S: VaultStore,
  N: NotificationGateway,
{
  Ok(Json(engine.confirmations().verify_contact(body.token.trim()).await?))
}

/// `POST /confirm-death`
pub async fn confirm_death<S, N>(
  State(engine): State<Arc<Engine<S, N>>>,
  Json(body): Json<TokenBody>,
) -> Result<Json<ConfirmationOutcome>, ApiError>
where
  S: VaultStore,
  N: NotificationGateway,
{
  Ok(Json(
    engine
      .confirmations()
      .confirm_death_by_token(body.token.trim())
      .await?,
  ))
}
