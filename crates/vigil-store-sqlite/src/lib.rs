//! SQLite backend for the Vigil store.
//!
//! Wraps [`tokio_rusqlite`] so all database access runs on a dedicated thread
//! without blocking the async runtime. Every multi-row write happens inside a
//! single `rusqlite` transaction.

mod encode;
mod outbox;
mod schema;
mod store;

pub mod error;

pub use error::{Error, Result};
pub use store::SqliteStore;
