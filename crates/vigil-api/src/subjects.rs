//! Handlers for `/subjects` endpoints.
//!
//! | Method | Path | Notes |
//! |--------|------|-------|
//! | `POST` | `/subjects` | Body: `{"check_in_interval_days":30}` (optional) |
//! | `POST` | `/subjects/:id/check-in` | Body: `{"method":"app"}`; `{}` defaults to `app` |
//! | `GET`  | `/subjects/:id/check-in-status` | 404 if not found |
//! | `GET`  | `/subjects/:id/check-ins` | Optional `?limit=<n>`, newest first |
//! | `PUT`  | `/subjects/:id/check-in-interval` | Body: `{"days":60}`; 7..=365 |
//! | `POST` | `/subjects/:id/recipients` | Body: `{"name":"..","email":".."}` |

use std::sync::Arc;

use axum::{
  Json,
  extract::{Path, Query, State},
  http::StatusCode,
  response::IntoResponse,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;
use vigil_core::{
  check_in::{CheckInMethod, CheckInRecord},
  notification::NotificationGateway,
  store::VaultStore,
  subject::{Subject, SubjectStatus},
};
use vigil_engine::{Engine, tracker::CheckInStatus};

use crate::error::ApiError;

const DEFAULT_INTERVAL_DAYS: u32 = 30;
const DEFAULT_HISTORY_LIMIT: usize = 50;
const MAX_HISTORY_LIMIT: usize = 500;

// ─── Register ─────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateBody {
  #[serde(default = "default_interval")]
  pub check_in_interval_days: u32,
}

fn default_interval() -> u32 { DEFAULT_INTERVAL_DAYS }

/// `POST /subjects`
pub async fn create<S, N>(
  State(engine): State<Arc<Engine<S, N>>>,
  Json(body): Json<CreateBody>,
) -> Result<impl IntoResponse, ApiError>
where
  S: VaultStore,
  N: NotificationGateway,
{
  let subject = engine.tracker().register(body.check_in_interval_days).await?;
  Ok((StatusCode::CREATED, Json(subject)))
}

// ─── Check in ─────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct CheckInBody {
  #[serde(default)]
  pub method: CheckInMethod,
}

#[derive(Debug, Serialize)]
pub struct CheckInResponse {
  pub next_check_in_due_at:      DateTime<Utc>,
  pub status:                    SubjectStatus,
  /// Unlock requests closed because the subject proved liveness.
  pub cancelled_unlock_requests: Vec<Uuid>,
}

/// `POST /subjects/:id/check-in`
pub async fn check_in<S, N>(
  State(engine): State<Arc<Engine<S, N>>>,
  Path(id): Path<Uuid>,
  Json(body): Json<CheckInBody>,
) -> Result<Json<CheckInResponse>, ApiError>
where
  S: VaultStore,
  N: NotificationGateway,
{
  if body.method == CheckInMethod::UnlockCancellation {
    return Err(ApiError::BadRequest(
      "unlock_cancellation is not a check-in method; cancel the request instead".into(),
    ));
  }
  let receipt = engine.tracker().check_in(id, body.method).await?;

  let mut cancelled_unlock_requests = Vec::new();
  if engine.config().cancel_pending_on_check_in {
    // The check-in has committed; a failure here leaves the request for the
    // resolution sweep, which refuses to approve it.
    match engine.unlocks().cancel_pending_on_check_in(id).await {
      Ok(cancelled) => {
        cancelled_unlock_requests = cancelled.into_iter().map(|r| r.request_id).collect();
      }
      Err(e) => warn!(subject_id = %id, error = %e, "could not cancel pending unlock requests"),
    }
  }

  Ok(Json(CheckInResponse {
    next_check_in_due_at: receipt.next_check_in_due_at,
    status: receipt.subject.status,
    cancelled_unlock_requests,
  }))
}

// ─── Status ───────────────────────────────────────────────────────────────────

/// `GET /subjects/:id/check-in-status`
pub async fn status<S, N>(
  State(engine): State<Arc<Engine<S, N>>>,
  Path(id): Path<Uuid>,
) -> Result<Json<CheckInStatus>, ApiError>
where
  S: VaultStore,
  N: NotificationGateway,
{
  Ok(Json(engine.tracker().status(id).await?))
}

// ─── History ──────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
  pub limit: Option<usize>,
}

/// `GET /subjects/:id/check-ins[?limit=<n>]`
pub async fn history<S, N>(
  State(engine): State<Arc<Engine<S, N>>>,
  Path(id): Path<Uuid>,
  Query(params): Query<HistoryParams>,
) -> Result<Json<Vec<CheckInRecord>>, ApiError>
where
  S: VaultStore,
  N: NotificationGateway,
{
  let limit = params
    .limit
    .unwrap_or(DEFAULT_HISTORY_LIMIT)
    .min(MAX_HISTORY_LIMIT);
  Ok(Json(engine.tracker().history(id, limit).await?))
}

// ─── Interval ─────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct IntervalBody {
  pub days: u32,
}

/// `PUT /subjects/:id/check-in-interval`
pub async fn set_interval<S, N>(
  State(engine): State<Arc<Engine<S, N>>>,
  Path(id): Path<Uuid>,
  Json(body): Json<IntervalBody>,
) -> Result<Json<Subject>, ApiError>
where
  S: VaultStore,
  N: NotificationGateway,
{
  Ok(Json(engine.tracker().set_interval(id, body.days).await?))
}

// ─── Recipients ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RecipientBody {
  pub name:  String,
  pub email: String,
}

/// `POST /subjects/:id/recipients`
pub async fn add_recipient<S, N>(
  State(engine): State<Arc<Engine<S, N>>>,
  Path(id): Path<Uuid>,
  Json(body): Json<RecipientBody>,
) -> Result<impl IntoResponse, ApiError>
where
  S: VaultStore,
  N: NotificationGateway,
{
  let (name, email) = crate::contacts::validate_person(body.name, body.email)?;
  let recipient = engine.unlocks().add_recipient(id, name, email).await?;
  Ok((StatusCode::CREATED, Json(recipient)))
}
