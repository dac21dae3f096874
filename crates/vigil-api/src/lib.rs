//! JSON REST API for Vigil.
//!
//! Exposes an axum [`Router`] over an [`Engine`]. Authentication of subjects
//! and operators, TLS and rate limiting are the caller's responsibility;
//! trusted contacts authenticate with the token issued when they were added.
//!
//! # Mounting
//!
//! ```rust,ignore
//! .nest("/api", vigil_api::api_router(engine.clone()))
//! ```

pub mod contacts;
pub mod error;
pub mod subjects;
pub mod unlock;

use std::sync::Arc;

use axum::{
  Router,
  routing::{get, post, put},
};
use vigil_core::{notification::NotificationGateway, store::VaultStore};
use vigil_engine::Engine;

pub use error::ApiError;

/// Build a fully-materialised API router for `engine`.
///
/// The returned `Router<()>` can be nested into any parent router regardless
/// of its own state type.
pub fn api_router<S, N>(engine: Arc<Engine<S, N>>) -> Router<()>
where
  S: VaultStore + 'static,
  N: NotificationGateway + 'static,
{
  Router::new()
    // Subjects
    .route("/subjects", post(subjects::create::<S, N>))
    .route("/subjects/{id}/check-in", post(subjects::check_in::<S, N>))
    .route("/subjects/{id}/check-in-status", get(subjects::status::<S, N>))
    .route("/subjects/{id}/check-ins", get(subjects::history::<S, N>))
    .route(
      "/subjects/{id}/check-in-interval",
      put(subjects::set_interval::<S, N>),
    )
    .route("/subjects/{id}/recipients", post(subjects::add_recipient::<S, N>))
    // Trusted contacts
    .route(
      "/subjects/{id}/trusted-contacts",
      get(contacts::list::<S, N>).post(contacts::add::<S, N>),
    )
    .route("/trusted-contacts/verify", post(contacts::verify::<S, N>))
    .route("/confirm-death", post(contacts::confirm_death::<S, N>))
    // Unlock requests
    .route("/subjects/{id}/unlock-requests", get(unlock::list::<S, N>))
    .route("/unlock-requests/{id}/cancel", post(unlock::cancel::<S, N>))
    .with_state(engine)
}
