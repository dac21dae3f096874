//! Time source abstraction.
//!
//! Every elapsed-time decision reads the current instant from a [`Clock`]
//! handed in by the caller, so tests can jump the clock by months.

use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Duration, Utc};

/// Supplies the current instant.
pub trait Clock: Send + Sync {
  fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> { Utc::now() }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
  now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
  pub fn new(start: DateTime<Utc>) -> Self { Self { now: Mutex::new(start) } }

  pub fn set(&self, to: DateTime<Utc>) {
    *self.now.lock().unwrap_or_else(PoisonError::into_inner) = to;
  }

  pub fn advance(&self, by: Duration) {
    let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
    *now += by;
  }
}

impl Clock for ManualClock {
  fn now(&self) -> DateTime<Utc> {
    *self.now.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

#[cfg(test)]
mod tests {
  use chrono::TimeZone;

  use super::*;

  #[test]
  fn manual_clock_moves_only_when_told() {
    let start = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
    let clock = ManualClock::new(start);
    assert_eq!(clock.now(), start);

    clock.advance(Duration::days(91));
    assert_eq!(clock.now(), start + Duration::days(91));

    clock.set(start);
    assert_eq!(clock.now(), start);
  }
}
