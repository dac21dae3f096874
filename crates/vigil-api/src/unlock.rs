//! Handlers for unlock requests.
//!
//! | Method | Path | Notes |
//! |--------|------|-------|
//! | `GET`  | `/subjects/:id/unlock-requests` | Newest first |
//! | `POST` | `/unlock-requests/:id/cancel` | Optional `{"reason"}`; 409 unless pending |

use std::sync::Arc;

use axum::{
  Json,
  extract::{Path, State},
};
use serde::Deserialize;
use uuid::Uuid;
use vigil_core::{
  audit::Actor,
  notification::NotificationGateway,
  store::VaultStore,
  unlock::UnlockRequest,
};
use vigil_engine::Engine;

use crate::error::ApiError;

/// `GET /subjects/:id/unlock-requests`
pub async fn list<S, N>(
  State(engine): State<Arc<Engine<S, N>>>,
  Path(id): Path<Uuid>,
) -> Result<Json<Vec<UnlockRequest>>, ApiError>
where
  S: VaultStore,
  N: NotificationGateway,
{
  Ok(Json(engine.unlocks().list(id).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelBody {
  #[serde(default)]
  pub reason: Option<String>,
}

/// `POST /unlock-requests/:id/cancel`
///
/// Cancelling proves the subject is alive, so the subject is reset exactly as
/// by a check-in.
pub async fn cancel<S, N>(
  State(engine): State<Arc<Engine<S, N>>>,
  Path(id): Path<Uuid>,
  Json(body): Json<CancelBody>,
) -> Result<Json<UnlockRequest>, ApiError>
where
  S: VaultStore,
  N: NotificationGateway,
{
  let unlocks = engine.unlocks();
  let request = unlocks.get(id).await?;
  let reason = body
    .reason
    .map(|r| r.trim().to_owned())
    .filter(|r| !r.is_empty())
    .unwrap_or_else(|| "cancelled by subject".to_owned());
  Ok(Json(
    unlocks
      .cancel(id, reason, Actor::Subject(request.subject_id))
      .await?,
  ))
}
