//! Background scheduling of the sweeps.
//!
//! A [`Scheduler`] holds named tasks, each with its own [`Cadence`]. `start`
//! spawns one tokio task per scheduled task, so a slow sweep never delays the
//! others. A per-name guard keeps at most one run of a task in flight, whether
//! triggered by its timer or by [`Scheduler::run_now`].

use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use chrono::{DateTime, Datelike, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use tokio::{sync::{watch, Mutex}, task::JoinHandle, time::Instant};
use tracing::{debug, error, info, warn};
use vigil_core::{clock::Clock, notification::NotificationGateway, store::VaultStore};

use crate::{retry::RetryPolicy, Engine, Result, Shutdown, SweepReport};

pub const MISSED_CHECK_INS: &str = "missed-check-ins";
pub const UNLOCK_RESOLUTION: &str = "unlock-resolution";
pub const CHECK_IN_REMINDERS: &str = "check-in-reminders";
pub const WEEKLY_USAGE_RESET: &str = "weekly-usage-reset";
pub const NOTIFICATION_DELIVERY: &str = "notification-delivery";

// ─── Cadence ─────────────────────────────────────────────────────────────────

/// When a task runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
  /// A fixed period after the previous run was scheduled.
  Every(Duration),
  /// Calendar-aligned, once a week at a UTC wall-clock time.
  Weekly { weekday: Weekday, at: NaiveTime },
}

impl Cadence {
  /// The first instant strictly after `now` at which the task is due.
  pub fn next_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
    match *self {
      Self::Every(period) => chrono::Duration::from_std(period)
        .ok()
        .and_then(|period| now.checked_add_signed(period))
        .unwrap_or(DateTime::<Utc>::MAX_UTC),
      Self::Weekly { weekday, at } => {
        let ahead = (7 + weekday.num_days_from_monday()
          - now.weekday().num_days_from_monday())
          % 7;
        let candidate = (now.date_naive() + chrono::Duration::days(i64::from(ahead)))
          .and_time(at)
          .and_utc();
        if candidate > now {
          candidate
        } else {
          candidate + chrono::Duration::weeks(1)
        }
      }
    }
  }
}

// ─── Configuration ───────────────────────────────────────────────────────────

/// Cadences and retry behaviour for the standard sweeps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
  pub missed_check_in_every_secs:       u64,
  pub unlock_resolution_every_secs:     u64,
  pub reminder_every_secs:              u64,
  pub notification_delivery_every_secs: u64,
  pub weekly_reset_weekday:             Weekday,
  pub weekly_reset_at:                  NaiveTime,
  /// Run every task once as soon as the scheduler starts.
  pub run_on_startup:                   bool,
  pub retry:                            RetryPolicy,
}

impl Default for SchedulerConfig {
  fn default() -> Self {
    Self {
      missed_check_in_every_secs:       6 * 60 * 60,
      unlock_resolution_every_secs:     60 * 60,
      reminder_every_secs:              6 * 60 * 60,
      notification_delivery_every_secs: 60,
      weekly_reset_weekday:             Weekday::Mon,
      weekly_reset_at:                  NaiveTime::MIN,
      run_on_startup:                   true,
      retry:                            RetryPolicy::default(),
    }
  }
}

// ─── Tasks ───────────────────────────────────────────────────────────────────

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;
type TaskFn = Arc<dyn Fn(Shutdown) -> BoxFuture<Result<SweepReport>> + Send + Sync>;

struct ScheduledTask {
  name:    &'static str,
  cadence: Cadence,
  run:     TaskFn,
  /// Held for the duration of a run.
  guard:   Mutex<()>,
}

/// The result of asking for a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
  Completed(SweepReport),
  /// Every retry failed; the message is the last error.
  Failed(String),
  /// A run of the same task was already in flight.
  AlreadyRunning,
  UnknownTask,
}

async fn run_guarded(
  task: &ScheduledTask,
  retry: &RetryPolicy,
  shutdown: &Shutdown,
) -> RunOutcome {
  let Ok(_running) = task.guard.try_lock() else {
    debug!(task = task.name, "previous run still in flight; skipping");
    return RunOutcome::AlreadyRunning;
  };

  let started = Instant::now();
  match retry
    .execute(task.name, shutdown, || (task.run)(shutdown.clone()))
    .await
  {
    Ok(report) => {
      info!(
        task = task.name,
        examined = report.examined,
        changed = report.changed,
        skipped = report.skipped,
        failed = report.failed,
        interrupted = report.interrupted,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "sweep finished"
      );
      RunOutcome::Completed(report)
    }
    Err(e) => {
      error!(task = task.name, error = %e, "sweep failed");
      RunOutcome::Failed(e.to_string())
    }
  }
}

// ─── Scheduler ───────────────────────────────────────────────────────────────

pub struct Scheduler {
  tasks:          Vec<Arc<ScheduledTask>>,
  clock:          Arc<dyn Clock>,
  retry:          RetryPolicy,
  run_on_startup: bool,
  shutdown_tx:    watch::Sender<bool>,
  handles:        Vec<JoinHandle<()>>,
}

impl Scheduler {
  pub fn new(clock: Arc<dyn Clock>, retry: RetryPolicy) -> Self {
    let (shutdown_tx, _) = watch::channel(false);
    Self {
      tasks: Vec::new(),
      clock,
      retry,
      run_on_startup: false,
      shutdown_tx,
      handles: Vec::new(),
    }
  }

  pub fn run_on_startup(mut self, yes: bool) -> Self {
    self.run_on_startup = yes;
    self
  }

  /// Register a task. Names must be unique; a later task with the same name
  /// replaces the earlier one.
  pub fn add_task<F, Fut>(&mut self, name: &'static str, cadence: Cadence, run: F)
  where
    F: Fn(Shutdown) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<SweepReport>> + Send + 'static,
  {
    self.tasks.retain(|t| t.name != name);
    self.tasks.push(Arc::new(ScheduledTask {
      name,
      cadence,
      run: Arc::new(move |shutdown| Box::pin(run(shutdown))),
      guard: Mutex::new(()),
    }));
  }

  /// A scheduler carrying the standard sweeps for `engine`.
  pub fn for_engine<S, N>(engine: Arc<Engine<S, N>>, config: &SchedulerConfig) -> Self
  where
    S: VaultStore + 'static,
    N: NotificationGateway + 'static,
  {
    let mut scheduler = Self::new(engine.clock(), config.retry.clone())
      .run_on_startup(config.run_on_startup);

    let e = Arc::clone(&engine);
    scheduler.add_task(
      MISSED_CHECK_INS,
      Cadence::Every(Duration::from_secs(config.missed_check_in_every_secs)),
      move |shutdown| {
        let e = Arc::clone(&e);
        async move { e.sweeps().missed_check_ins(&shutdown).await }
      },
    );

    let e = Arc::clone(&engine);
    scheduler.add_task(
      UNLOCK_RESOLUTION,
      Cadence::Every(Duration::from_secs(config.unlock_resolution_every_secs)),
      move |shutdown| {
        let e = Arc::clone(&e);
        async move { e.sweeps().unlock_resolutions(&shutdown).await }
      },
    );

    let e = Arc::clone(&engine);
    scheduler.add_task(
      CHECK_IN_REMINDERS,
      Cadence::Every(Duration::from_secs(config.reminder_every_secs)),
      move |shutdown| {
        let e = Arc::clone(&e);
        async move { e.sweeps().reminders(&shutdown).await }
      },
    );

    let e = Arc::clone(&engine);
    scheduler.add_task(
      NOTIFICATION_DELIVERY,
      Cadence::Every(Duration::from_secs(config.notification_delivery_every_secs)),
      move |shutdown| {
        let e = Arc::clone(&e);
        async move { e.sweeps().deliver_notifications(&shutdown).await }
      },
    );

    let e = engine;
    scheduler.add_task(
      WEEKLY_USAGE_RESET,
      Cadence::Weekly {
        weekday: config.weekly_reset_weekday,
        at:      config.weekly_reset_at,
      },
      move |_shutdown| {
        let e = Arc::clone(&e);
        async move { e.sweeps().weekly_reset().await }
      },
    );

    scheduler
  }

  pub fn task_names(&self) -> Vec<&'static str> {
    self.tasks.iter().map(|t| t.name).collect()
  }

  /// Spawn one background loop per task. Calling `start` on a running
  /// scheduler does nothing.
  pub fn start(&mut self) {
    if !self.handles.is_empty() {
      warn!("scheduler already started");
      return;
    }
    self.shutdown_tx.send_replace(false);

    for task in &self.tasks {
      let task = Arc::clone(task);
      let clock = Arc::clone(&self.clock);
      let retry = self.retry.clone();
      let run_on_startup = self.run_on_startup;
      let mut shutdown = Shutdown::new(self.shutdown_tx.subscribe());

      self.handles.push(tokio::spawn(async move {
        info!(task = task.name, cadence = ?task.cadence, "scheduled task started");
        if run_on_startup && !shutdown.is_requested() {
          run_guarded(&task, &retry, &shutdown).await;
        }
        loop {
          let now = clock.now();
          let wait = (task.cadence.next_after(now) - now)
            .to_std()
            .unwrap_or(Duration::ZERO);
          tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = shutdown.requested() => break,
          }
          if shutdown.is_requested() {
            break;
          }
          run_guarded(&task, &retry, &shutdown).await;
        }
        info!(task = task.name, "scheduled task stopped");
      }));
    }
  }

  /// Run one task immediately, outside its cadence.
  pub async fn run_now(&self, name: &str) -> RunOutcome {
    let Some(task) = self.tasks.iter().find(|t| t.name == name) else {
      return RunOutcome::UnknownTask;
    };
    let shutdown = Shutdown::new(self.shutdown_tx.subscribe());
    run_guarded(task, &self.retry, &shutdown).await
  }

  /// Signal every loop to stop and wait for in-flight runs to finish their
  /// current entity.
  pub async fn stop(&mut self) {
    self.shutdown_tx.send_replace(true);
    for handle in self.handles.drain(..) {
      if let Err(e) = handle.await {
        warn!(error = %e, "scheduled task ended abnormally");
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use chrono::TimeZone;
  use tokio::sync::Notify;
  use vigil_core::clock::SystemClock;

  use super::*;

  #[tokio::test]
  async fn overlapping_runs_of_one_task_are_refused() {
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let mut scheduler = Scheduler::new(Arc::new(SystemClock), RetryPolicy::default());
    let (s, r) = (Arc::clone(&started), Arc::clone(&release));
    scheduler.add_task("slow", Cadence::Every(Duration::from_secs(3600)), move |_| {
      let (s, r) = (Arc::clone(&s), Arc::clone(&r));
      async move {
        s.notify_one();
        r.notified().await;
        Ok(SweepReport { changed: 1, ..SweepReport::default() })
      }
    });

    let first = scheduler.run_now("slow");
    let second = async {
      started.notified().await;
      let outcome = scheduler.run_now("slow").await;
      release.notify_one();
      outcome
    };
    let (first, second) = tokio::join!(first, second);

    assert_eq!(second, RunOutcome::AlreadyRunning);
    assert_eq!(
      first,
      RunOutcome::Completed(SweepReport { changed: 1, ..SweepReport::default() })
    );
    // The guard is released once the run finishes.
    release.notify_one();
    assert!(matches!(scheduler.run_now("slow").await, RunOutcome::Completed(_)));
  }

  #[test]
  fn weekly_cadence_lands_on_next_monday_midnight() {
    let cadence = Cadence::Weekly {
      weekday: Weekday::Mon,
      at:      NaiveTime::MIN,
    };
    // 2030-01-02 is a Wednesday.
    let wed = Utc.with_ymd_and_hms(2030, 1, 2, 15, 30, 0).unwrap();
    assert_eq!(
      cadence.next_after(wed),
      Utc.with_ymd_and_hms(2030, 1, 7, 0, 0, 0).unwrap()
    );

    let monday_midnight = Utc.with_ymd_and_hms(2030, 1, 7, 0, 0, 0).unwrap();
    assert_eq!(
      cadence.next_after(monday_midnight),
      Utc.with_ymd_and_hms(2030, 1, 14, 0, 0, 0).unwrap()
    );
  }

  #[test]
  fn every_cadence_adds_its_period() {
    let now = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
    let cadence = Cadence::Every(Duration::from_secs(3600));
    assert_eq!(cadence.next_after(now), now + chrono::Duration::hours(1));
  }
}
