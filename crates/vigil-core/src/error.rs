//! Error types for `vigil-core`.

use thiserror::Error;

/// Shortest accepted check-in interval, in days.
pub const MIN_INTERVAL_DAYS: u32 = 7;
/// Longest accepted check-in interval, in days.
pub const MAX_INTERVAL_DAYS: u32 = 365;

#[derive(Debug, Error)]
pub enum Error {
  #[error(
    "check-in interval must be between {MIN_INTERVAL_DAYS} and \
     {MAX_INTERVAL_DAYS} days, got {0}"
  )]
  InvalidInterval(u32),

  #[error("unknown {kind} value: {value:?}")]
  UnknownVariant { kind: &'static str, value: String },

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Validate a check-in interval supplied by a subject.
pub fn validate_interval(days: u32) -> Result<u32> {
  if (MIN_INTERVAL_DAYS..=MAX_INTERVAL_DAYS).contains(&days) {
    Ok(days)
  } else {
    Err(Error::InvalidInterval(days))
  }
}
