//! Exponential backoff for whole-sweep retries.

use std::{future::Future, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::{ErrorKind, Result, Shutdown};

/// Retry policy with exponential backoff.
///
/// Only [`ErrorKind::Transient`] failures are retried. The delay doubles
/// after each attempt, capped at `max_backoff_ms`. A stop request during the
/// delay ends the retries with the last error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
  /// Retries after the first attempt.
  pub max_retries:        u32,
  pub initial_backoff_ms: u64,
  pub max_backoff_ms:     u64,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_retries:        3,
      initial_backoff_ms: 1_000,
      max_backoff_ms:     60_000,
    }
  }
}

impl RetryPolicy {
  pub fn new(max_retries: u32, initial_backoff_ms: u64, max_backoff_ms: u64) -> Self {
    Self {
      max_retries,
      initial_backoff_ms,
      max_backoff_ms,
    }
  }

  pub async fn execute<F, Fut, T>(
    &self,
    name: &str,
    shutdown: &Shutdown,
    mut operation: F,
  ) -> Result<T>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    let mut attempt = 0;
    let mut backoff_ms = self.initial_backoff_ms;
    let mut stop = shutdown.clone();

    loop {
      match operation().await {
        Ok(value) => return Ok(value),
        Err(e) if e.kind() == ErrorKind::Transient && attempt < self.max_retries => {
          attempt += 1;
          warn!(
            task = name,
            attempt,
            max_retries = self.max_retries,
            backoff_ms,
            error = %e,
            "transient failure; retrying"
          );
          tokio::select! {
            _ = sleep(Duration::from_millis(backoff_ms)) => {}
            _ = stop.requested() => {
              debug!(task = name, attempt, "stop requested during backoff; giving up");
              return Err(e);
            }
          }
          backoff_ms = backoff_ms.saturating_mul(2).min(self.max_backoff_ms);
        }
        Err(e) => return Err(e),
      }
    }
  }
}
