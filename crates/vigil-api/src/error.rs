//! API error type and [`axum::response::IntoResponse`] implementation.

use axum::{
  Json,
  http::StatusCode,
  response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;
use tracing::error;
use vigil_engine::ErrorKind;

/// An error returned by an API handler.
#[derive(Debug, Error)]
pub enum ApiError {
  #[error("not found: {0}")]
  NotFound(String),

  #[error("bad request: {0}")]
  BadRequest(String),

  #[error("conflict: {0}")]
  Conflict(String),

  #[error("unavailable: {0}")]
  Unavailable(String),

  #[error("internal error: {0}")]
  Internal(String),
}

impl From<vigil_engine::Error> for ApiError {
  fn from(e: vigil_engine::Error) -> Self {
    let message = e.to_string();
    match e.kind() {
      ErrorKind::NotFound => Self::NotFound(message),
      ErrorKind::InvalidInput => Self::BadRequest(message),
      ErrorKind::InvalidState => Self::Conflict(message),
      ErrorKind::Transient => Self::Unavailable(message),
      ErrorKind::ConsistencyViolation => Self::Internal(message),
    }
  }
}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    let (status, message) = match self {
      ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
      ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
      ApiError::Conflict(m) => (StatusCode::CONFLICT, m),
      ApiError::Unavailable(m) => (StatusCode::SERVICE_UNAVAILABLE, m),
      ApiError::Internal(m) => {
        error!(error = %m, "request failed");
        (StatusCode::INTERNAL_SERVER_ERROR, m)
      }
    };
    (status, Json(json!({ "error": message }))).into_response()
  }
}
