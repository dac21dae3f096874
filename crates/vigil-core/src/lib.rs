//! Core types and trait definitions for the Vigil dead man's switch.
//!
//! This crate is deliberately free of HTTP, database and runtime
//! dependencies. The escalation rules in [`escalation`] are pure functions of
//! a [`subject::Subject`] and an instant supplied by a [`clock::Clock`].

// We intentionally use native `async fn` in traits (stabilised in Rust 1.75).
// Suppress the advisory lint about `Send` bounds on the returned futures.
#![allow(async_fn_in_trait)]

pub mod audit;
pub mod check_in;
pub mod clock;
pub mod contact;
pub mod error;
pub mod escalation;
pub mod notification;
pub mod store;
pub mod subject;
pub mod unlock;

pub use error::{Error, Result};
