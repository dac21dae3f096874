//! Engine tests against an in-memory SQLite store and a hand-driven clock.

use std::sync::{
  atomic::{AtomicBool, Ordering},
  Arc, Mutex,
};

use chrono::{DateTime, Duration, TimeZone, Utc};
use uuid::Uuid;
use vigil_core::{
  audit::{Actor, AuditAction, AuditEntry, NewAuditEntry},
  check_in::{CheckIn, CheckInMethod, CheckInRecord, RecordKind},
  clock::{Clock, ManualClock},
  contact::{NewRecipient, NewTrustedContact, Recipient, TrustedContact},
  escalation::Transition,
  notification::{
    Enqueued, NotificationGateway, NotificationIntent, NotificationKind, OutboxEntry,
  },
  store::{Guarded, VaultStore},
  subject::{NewSubject, Subject, SubjectStatus},
  unlock::{
    NewUnlockRequest, UnlockApproval, UnlockCancellation, UnlockRequest, UnlockStatus,
  },
};
use vigil_store_sqlite::SqliteStore;

use crate::{
  scheduler::{RunOutcome, MISSED_CHECK_INS, NOTIFICATION_DELIVERY},
  unlock::Resolution,
  Engine, EngineConfig, Error, ErrorKind, Scheduler, SchedulerConfig, Shutdown,
};

// ─── Harness ─────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
#[error("mail relay unavailable")]
struct RelayDown;

#[derive(Default)]
struct RecordingNotifier {
  sent: Mutex<Vec<NotificationIntent>>,
  down: AtomicBool,
}

impl RecordingNotifier {
  fn kinds(&self) -> Vec<NotificationKind> {
    self.sent.lock().unwrap().iter().map(|i| i.kind).collect()
  }

  fn count(&self, kind: NotificationKind) -> usize {
    self.kinds().into_iter().filter(|k| *k == kind).count()
  }

  fn of_kind(&self, kind: NotificationKind) -> Vec<NotificationIntent> {
    let sent = self.sent.lock().unwrap();
    sent.iter().filter(|i| i.kind == kind).cloned().collect()
  }

  fn set_down(&self, down: bool) { self.down.store(down, Ordering::SeqCst); }
}

impl NotificationGateway for RecordingNotifier {
  type Error = RelayDown;

  async fn enqueue(&self, intent: NotificationIntent) -> Result<Enqueued, RelayDown> {
    if self.down.load(Ordering::SeqCst) {
      return Err(RelayDown);
    }
    let mut sent = self.sent.lock().unwrap();
    if sent.iter().any(|i| i.dedupe_key == intent.dedupe_key) {
      return Ok(Enqueued::Duplicate);
    }
    sent.push(intent);
    Ok(Enqueued::Accepted)
  }
}

// ─── Fault-injecting store ───────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
enum FlakyError {
  #[error(transparent)]
  Store(#[from] vigil_store_sqlite::Error),
  #[error("injected {0} failure")]
  Injected(&'static str),
}

type FlakyResult<T> = Result<T, FlakyError>;

/// A SQLite store that can be told to fail particular writes.
struct FlakyStore {
  inner:           SqliteStore,
  fail_transition: Mutex<Option<Uuid>>,
  fail_next_open:  AtomicBool,
}

impl FlakyStore {
  fn new(inner: SqliteStore) -> Self {
    Self {
      inner,
      fail_transition: Mutex::new(None),
      fail_next_open: AtomicBool::new(false),
    }
  }

  /// Fail every transition of `subject_id` until cleared.
  fn fail_transitions_of(&self, subject_id: Option<Uuid>) {
    *self.fail_transition.lock().unwrap() = subject_id;
  }

  fn fail_next_open(&self) { self.fail_next_open.store(true, Ordering::SeqCst); }
}

impl VaultStore for FlakyStore {
  type Error = FlakyError;

  async fn register_subject(&self, input: NewSubject) -> FlakyResult<Subject> {
    Ok(self.inner.register_subject(input).await?)
  }

  async fn get_subject(&self, id: Uuid) -> FlakyResult<Option<Subject>> {
    Ok(self.inner.get_subject(id).await?)
  }

  async fn set_check_in_interval(
    &self,
    id: Uuid,
    expected_revision: u64,
    days: u32,
    next_due_at: DateTime<Utc>,
  ) -> FlakyResult<Guarded<Subject>> {
    Ok(
      self
        .inner
        .set_check_in_interval(id, expected_revision, days, next_due_at)
        .await?,
    )
  }

  async fn find_subjects_due(&self, now: DateTime<Utc>) -> FlakyResult<Vec<Subject>> {
    Ok(self.inner.find_subjects_due(now).await?)
  }

  async fn find_subjects_awaiting_reminder(
    &self,
    horizon: DateTime<Utc>,
  ) -> FlakyResult<Vec<Subject>> {
    Ok(self.inner.find_subjects_awaiting_reminder(horizon).await?)
  }

  async fn record_check_in(
    &self,
    subject_id: Uuid,
    check_in: CheckIn,
  ) -> FlakyResult<Option<(Subject, CheckInRecord)>> {
    Ok(self.inner.record_check_in(subject_id, check_in).await?)
  }

  async fn apply_transition(
    &self,
    transition: Transition,
    notifications: Vec<NotificationIntent>,
  ) -> FlakyResult<Guarded<Subject>> {
    let failing = *self.fail_transition.lock().unwrap();
    if failing == Some(transition.subject_id) {
      return Err(FlakyError::Injected("transition"));
    }
    Ok(self.inner.apply_transition(transition, notifications).await?)
  }

  async fn create_reminder(
    &self,
    subject_id: Uuid,
    expected_revision: u64,
    sent_at: DateTime<Utc>,
    notification: NotificationIntent,
  ) -> FlakyResult<Guarded<CheckInRecord>> {
    Ok(
      self
        .inner
        .create_reminder(subject_id, expected_revision, sent_at, notification)
        .await?,
    )
  }

  async fn list_check_in_records(
    &self,
    subject_id: Uuid,
    limit: usize,
  ) -> FlakyResult<Vec<CheckInRecord>> {
    Ok(self.inner.list_check_in_records(subject_id, limit).await?)
  }

  async fn add_trusted_contact(&self, input: NewTrustedContact) -> FlakyResult<TrustedContact> {
    Ok(self.inner.add_trusted_contact(input).await?)
  }

  async fn get_trusted_contact(&self, id: Uuid) -> FlakyResult<Option<TrustedContact>> {
    Ok(self.inner.get_trusted_contact(id).await?)
  }

  async fn find_trusted_contact_by_token(
    &self,
    token_hash: String,
  ) -> FlakyResult<Option<TrustedContact>> {
    Ok(self.inner.find_trusted_contact_by_token(token_hash).await?)
  }

  async fn list_trusted_contacts(&self, subject_id: Uuid) -> FlakyResult<Vec<TrustedContact>> {
    Ok(self.inner.list_trusted_contacts(subject_id).await?)
  }

  async fn verify_trusted_contact(&self, id: Uuid) -> FlakyResult<Option<TrustedContact>> {
    Ok(self.inner.verify_trusted_contact(id).await?)
  }

  async fn confirm_death(
    &self,
    contact_id: Uuid,
    at: DateTime<Utc>,
  ) -> FlakyResult<Guarded<TrustedContact>> {
    Ok(self.inner.confirm_death(contact_id, at).await?)
  }

  async fn count_confirmed_contacts(&self, subject_id: Uuid) -> FlakyResult<u32> {
    Ok(self.inner.count_confirmed_contacts(subject_id).await?)
  }

  async fn add_recipient(&self, input: NewRecipient) -> FlakyResult<Recipient> {
    Ok(self.inner.add_recipient(input).await?)
  }

  async fn list_recipients(&self, subject_id: Uuid) -> FlakyResult<Vec<Recipient>> {
    Ok(self.inner.list_recipients(subject_id).await?)
  }

  async fn find_pending_unlock_requests(
    &self,
    subject_id: Uuid,
  ) -> FlakyResult<Vec<UnlockRequest>> {
    Ok(self.inner.find_pending_unlock_requests(subject_id).await?)
  }

  async fn get_unlock_request(&self, id: Uuid) -> FlakyResult<Option<UnlockRequest>> {
    Ok(self.inner.get_unlock_request(id).await?)
  }

  async fn list_unlock_requests(&self, subject_id: Uuid) -> FlakyResult<Vec<UnlockRequest>> {
    Ok(self.inner.list_unlock_requests(subject_id).await?)
  }

  async fn find_escalated_awaiting_request(
    &self,
    min_confirmations: u32,
  ) -> FlakyResult<Vec<Subject>> {
    Ok(self.inner.find_escalated_awaiting_request(min_confirmations).await?)
  }

  async fn open_unlock_request(
    &self,
    input: NewUnlockRequest,
  ) -> FlakyResult<Guarded<UnlockRequest>> {
    if self.fail_next_open.swap(false, Ordering::SeqCst) {
      return Err(FlakyError::Injected("open unlock request"));
    }
    Ok(self.inner.open_unlock_request(input).await?)
  }

  async fn sync_confirmations(
    &self,
    request_id: Uuid,
    count: u32,
  ) -> FlakyResult<Guarded<UnlockRequest>> {
    Ok(self.inner.sync_confirmations(request_id, count).await?)
  }

  async fn find_expired_pending_requests(
    &self,
    now: DateTime<Utc>,
  ) -> FlakyResult<Vec<UnlockRequest>> {
    Ok(self.inner.find_expired_pending_requests(now).await?)
  }

  async fn approve_unlock_request(
    &self,
    request_id: Uuid,
    approval: UnlockApproval,
  ) -> FlakyResult<Guarded<UnlockRequest>> {
    Ok(self.inner.approve_unlock_request(request_id, approval).await?)
  }

  async fn cancel_unlock_request(
    &self,
    request_id: Uuid,
    cancellation: UnlockCancellation,
  ) -> FlakyResult<Guarded<UnlockRequest>> {
    Ok(self.inner.cancel_unlock_request(request_id, cancellation).await?)
  }

  async fn append_audit(&self, entry: NewAuditEntry) -> FlakyResult<AuditEntry> {
    Ok(self.inner.append_audit(entry).await?)
  }

  async fn list_audit(&self, subject_id: Uuid) -> FlakyResult<Vec<AuditEntry>> {
    Ok(self.inner.list_audit(subject_id).await?)
  }

  async fn pending_notifications(&self, limit: usize) -> FlakyResult<Vec<OutboxEntry>> {
    Ok(self.inner.pending_notifications(limit).await?)
  }

  async fn mark_notification_delivered(
    &self,
    dedupe_key: String,
    at: DateTime<Utc>,
  ) -> FlakyResult<bool> {
    Ok(self.inner.mark_notification_delivered(dedupe_key, at).await?)
  }

  async fn record_notification_failure(
    &self,
    dedupe_key: String,
    error: String,
  ) -> FlakyResult<bool> {
    Ok(self.inner.record_notification_failure(dedupe_key, error).await?)
  }

  async fn reset_usage_counters(&self, at: DateTime<Utc>) -> FlakyResult<u64> {
    Ok(self.inner.reset_usage_counters(at).await?)
  }
}

type TestEngine = Engine<FlakyStore, RecordingNotifier>;

struct Harness {
  store:    Arc<FlakyStore>,
  notifier: Arc<RecordingNotifier>,
  clock:    Arc<ManualClock>,
  engine:   Arc<TestEngine>,
}

fn day(n: i64) -> DateTime<Utc> {
  Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap() + Duration::days(n)
}

async fn harness() -> Harness { harness_with(EngineConfig::default()).await }

async fn harness_with(config: EngineConfig) -> Harness {
  let store = Arc::new(FlakyStore::new(
    SqliteStore::open_in_memory().await.expect("store"),
  ));
  let notifier = Arc::new(RecordingNotifier::default());
  let clock = Arc::new(ManualClock::new(day(0)));
  let engine = Arc::new(Engine::new(
    Arc::clone(&store),
    Arc::clone(&notifier),
    Arc::clone(&clock) as Arc<dyn Clock>,
    config,
  ));
  Harness { store, notifier, clock, engine }
}

impl Harness {
  fn at(&self, n: i64) { self.clock.set(day(n)); }

  async fn subject(&self, id: Uuid) -> Subject {
    self.store.get_subject(id).await.unwrap().expect("subject")
  }

  /// Run the missed check-in sweep, then relay whatever it queued.
  async fn sweep_missed(&self) -> crate::SweepReport {
    let report = self
      .engine
      .sweeps()
      .missed_check_ins(&Shutdown::never())
      .await
      .unwrap();
    self.deliver().await;
    report
  }

  /// Run the unlock resolution sweep, then relay whatever it queued.
  async fn sweep_unlocks(&self) -> crate::SweepReport {
    let report = self
      .engine
      .sweeps()
      .unlock_resolutions(&Shutdown::never())
      .await
      .unwrap();
    self.deliver().await;
    report
  }

  async fn deliver(&self) -> crate::SweepReport {
    self
      .engine
      .sweeps()
      .deliver_notifications(&Shutdown::never())
      .await
      .unwrap()
  }

  /// Register a subject at day 0 and walk it to `escalation` at day 151.
  async fn escalated_subject(&self) -> Subject {
    self.at(0);
    let subject = self.engine.tracker().register(30).await.unwrap();
    for n in [91, 121, 151] {
      self.at(n);
      self.sweep_missed().await;
    }
    let subject = self.subject(subject.subject_id).await;
    assert_eq!(subject.status, SubjectStatus::Escalation);
    subject
  }

  async fn contacts(&self, subject_id: Uuid, n: usize) -> Vec<Uuid> {
    let mut ids = Vec::new();
    for i in 0..n {
      let issued = self
        .engine
        .confirmations()
        .add_contact(subject_id, format!("Contact {i}"), format!("c{i}@example.com"))
        .await
        .unwrap();
      ids.push(issued.contact.contact_id);
    }
    ids
  }
}

// ─── Check-ins ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn register_validates_interval() {
  let h = harness().await;
  let err = h.engine.tracker().register(3).await.unwrap_err();
  assert_eq!(err.kind(), ErrorKind::InvalidInput);

  let subject = h.engine.tracker().register(30).await.unwrap();
  assert_eq!(subject.next_check_in_due_at, day(30));
}

#[tokio::test]
async fn check_in_pushes_due_date_and_reports_status() {
  let h = harness().await;
  let subject = h.engine.tracker().register(30).await.unwrap();

  h.at(10);
  let receipt = h
    .engine
    .tracker()
    .check_in(subject.subject_id, CheckInMethod::App)
    .await
    .unwrap();
  assert_eq!(receipt.next_check_in_due_at, day(40));
  assert_eq!(receipt.record.kind, RecordKind::CheckIn);

  h.at(15);
  let status = h.engine.tracker().status(subject.subject_id).await.unwrap();
  assert_eq!(status.status, SubjectStatus::Alive);
  assert_eq!(status.days_until_due, 25);
  assert!(!status.is_overdue);
  assert_eq!(status.last_check_in_at, Some(day(10)));
}

#[tokio::test]
async fn check_in_unknown_subject_is_not_found() {
  let h = harness().await;
  let err = h
    .engine
    .tracker()
    .check_in(Uuid::new_v4(), CheckInMethod::App)
    .await
    .unwrap_err();
  assert!(matches!(err, Error::SubjectNotFound(_)));
  assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn set_interval_recomputes_from_last_check_in() {
  let h = harness().await;
  let subject = h.engine.tracker().register(30).await.unwrap();
  h.at(5);
  h.engine
    .tracker()
    .check_in(subject.subject_id, CheckInMethod::App)
    .await
    .unwrap();

  let updated = h
    .engine
    .tracker()
    .set_interval(subject.subject_id, 60)
    .await
    .unwrap();
  assert_eq!(updated.check_in_interval_days, 60);
  assert_eq!(updated.next_check_in_due_at, day(65));

  let err = h
    .engine
    .tracker()
    .set_interval(subject.subject_id, 400)
    .await
    .unwrap_err();
  assert_eq!(err.kind(), ErrorKind::InvalidInput);
}

#[tokio::test]
async fn history_lists_newest_first() {
  let h = harness().await;
  let subject = h.engine.tracker().register(30).await.unwrap();
  for n in [1, 2, 3] {
    h.at(n);
    h.engine
      .tracker()
      .check_in(subject.subject_id, CheckInMethod::Push)
      .await
      .unwrap();
  }
  let history = h.engine.tracker().history(subject.subject_id, 2).await.unwrap();
  assert_eq!(history.len(), 2);
  assert_eq!(history[0].sent_at, day(3));
  assert_eq!(history[1].sent_at, day(2));
}

// ─── Escalation sweep ────────────────────────────────────────────────────────

#[tokio::test]
async fn missed_sweep_walks_the_ladder_one_rung_at_a_time() {
  let h = harness().await;
  let subject = h.engine.tracker().register(30).await.unwrap();

  h.at(90);
  assert_eq!(h.sweep_missed().await.changed, 0);
  assert_eq!(h.subject(subject.subject_id).await.status, SubjectStatus::Alive);

  h.clock.set(day(90) + Duration::seconds(1));
  assert_eq!(h.sweep_missed().await.changed, 1);
  assert_eq!(h.subject(subject.subject_id).await.status, SubjectStatus::MissedOne);

  // Far in the future a single sweep still moves only one rung.
  h.at(400);
  h.sweep_missed().await;
  assert_eq!(h.subject(subject.subject_id).await.status, SubjectStatus::MissedTwo);
}

#[tokio::test]
async fn repeated_sweep_on_the_same_day_notifies_once() {
  let h = harness().await;
  h.engine.tracker().register(30).await.unwrap();

  h.at(91);
  let first = h.sweep_missed().await;
  let second = h.sweep_missed().await;
  assert_eq!(first.changed, 1);
  assert_eq!(second.changed, 0);
  assert_eq!(h.notifier.count(NotificationKind::MissedOne), 1);
}

#[tokio::test]
async fn escalation_notifies_subject_and_every_contact() {
  let h = harness().await;
  let subject = h.engine.tracker().register(30).await.unwrap();
  h.contacts(subject.subject_id, 3).await;

  for n in [91, 121, 151] {
    h.at(n);
    h.sweep_missed().await;
  }
  let escalated = h.subject(subject.subject_id).await;
  assert_eq!(escalated.status, SubjectStatus::Escalation);
  assert_eq!(escalated.grace_period_ends_at, Some(day(181)));
  assert_eq!(h.notifier.count(NotificationKind::Escalation), 4);
}

#[tokio::test]
async fn sweep_stops_between_subjects_on_shutdown() {
  let h = harness().await;
  h.engine.tracker().register(30).await.unwrap();
  h.engine.tracker().register(30).await.unwrap();
  h.at(91);

  let (tx, rx) = tokio::sync::watch::channel(true);
  let report = h
    .engine
    .sweeps()
    .missed_check_ins(&Shutdown::new(rx))
    .await
    .unwrap();
  drop(tx);
  assert!(report.interrupted);
  assert_eq!(report.examined, 0);
}

#[tokio::test]
async fn failed_transition_does_not_hold_back_other_subjects() {
  let h = harness().await;
  h.at(0);
  let stuck = h.engine.tracker().register(30).await.unwrap().subject_id;
  let moving = h.engine.tracker().register(30).await.unwrap().subject_id;
  h.store.fail_transitions_of(Some(stuck));

  h.at(91);
  let report = h.sweep_missed().await;
  assert_eq!(report.examined, 2);
  assert_eq!(report.changed, 1);
  assert_eq!(report.failed, 1);
  assert_eq!(h.subject(stuck).await.status, SubjectStatus::Alive);
  assert_eq!(h.subject(moving).await.status, SubjectStatus::MissedOne);

  h.store.fail_transitions_of(None);
  h.at(92);
  let report = h.sweep_missed().await;
  assert_eq!(report.changed, 1);
  assert_eq!(report.failed, 0);
  assert_eq!(h.subject(stuck).await.status, SubjectStatus::MissedOne);
  assert_eq!(h.subject(moving).await.status, SubjectStatus::MissedOne);
}

#[tokio::test]
async fn reminders_go_out_once_per_interval() {
  let h = harness().await;
  let subject = h.engine.tracker().register(30).await.unwrap();

  h.at(22);
  let early = h.engine.sweeps().reminders(&Shutdown::never()).await.unwrap();
  assert_eq!(early.changed, 0);

  h.at(23);
  let first = h.engine.sweeps().reminders(&Shutdown::never()).await.unwrap();
  assert_eq!(first.changed, 1);

  h.at(24);
  let again = h.engine.sweeps().reminders(&Shutdown::never()).await.unwrap();
  assert_eq!(again.examined, 0);
  assert_eq!(h.notifier.count(NotificationKind::CheckInReminder), 0);
  assert_eq!(h.deliver().await.changed, 1);
  assert_eq!(h.notifier.count(NotificationKind::CheckInReminder), 1);

  // A check-in answers the reminder and opens the next cycle.
  h.engine
    .tracker()
    .check_in(subject.subject_id, CheckInMethod::EmailLink)
    .await
    .unwrap();
  h.at(47);
  let next = h.engine.sweeps().reminders(&Shutdown::never()).await.unwrap();
  assert_eq!(next.changed, 1);
}

// ─── Confirmations ───────────────────────────────────────────────────────────

#[tokio::test]
async fn confirming_twice_is_invalid_state() {
  let h = harness().await;
  let subject = h.escalated_subject().await;
  let ids = h.contacts(subject.subject_id, 3).await;

  h.at(155);
  let first = h.engine.confirmations().confirm_death(ids[0]).await.unwrap();
  assert_eq!(first.confirmation_count, 1);
  assert!(!first.threshold_reached);

  let err = h.engine.confirmations().confirm_death(ids[0]).await.unwrap_err();
  assert!(matches!(err, Error::AlreadyConfirmed(_)));
  assert_eq!(err.kind(), ErrorKind::InvalidState);
  assert_eq!(
    h.store.count_confirmed_contacts(subject.subject_id).await.unwrap(),
    1
  );
}

#[tokio::test]
async fn third_confirmation_keeps_the_single_request() {
  let h = harness().await;
  let subject = h.escalated_subject().await;
  let ids = h.contacts(subject.subject_id, 3).await;

  h.at(160);
  h.engine.confirmations().confirm_death(ids[0]).await.unwrap();
  let second = h.engine.confirmations().confirm_death(ids[1]).await.unwrap();
  assert!(second.threshold_reached);
  assert!(second.request_created);
  assert_eq!(second.total_contacts, 3);
  let request = second.unlock_request.expect("request");

  let third = h.engine.confirmations().confirm_death(ids[2]).await.unwrap();
  assert!(third.threshold_reached);
  assert!(!third.request_created);
  let synced = third.unlock_request.expect("request");
  assert_eq!(synced.request_id, request.request_id);
  assert_eq!(synced.confirmations_count, 3);

  assert_eq!(
    h.store
      .find_pending_unlock_requests(subject.subject_id)
      .await
      .unwrap()
      .len(),
    1
  );
  h.deliver().await;
  assert_eq!(h.notifier.count(NotificationKind::UnlockRequested), 1);
}

#[tokio::test]
async fn quorum_outside_escalation_opens_nothing() {
  let h = harness().await;
  let subject = h.engine.tracker().register(30).await.unwrap();
  let ids = h.contacts(subject.subject_id, 2).await;

  h.at(10);
  h.engine.confirmations().confirm_death(ids[0]).await.unwrap();
  let outcome = h.engine.confirmations().confirm_death(ids[1]).await.unwrap();
  assert!(outcome.threshold_reached);
  assert!(outcome.unlock_request.is_none());
  assert_eq!(h.subject(subject.subject_id).await.status, SubjectStatus::Alive);
}

#[tokio::test]
async fn quorum_formed_before_escalation_opens_request_on_escalation() {
  let h = harness().await;
  h.at(0);
  let subject = h.engine.tracker().register(30).await.unwrap();
  let id = subject.subject_id;
  let ids = h.contacts(id, 2).await;
  for n in [91, 121] {
    h.at(n);
    h.sweep_missed().await;
  }
  assert_eq!(h.subject(id).await.status, SubjectStatus::MissedTwo);

  h.at(130);
  for contact in &ids {
    let outcome = h.engine.confirmations().confirm_death(*contact).await.unwrap();
    assert!(outcome.unlock_request.is_none());
  }

  h.at(151);
  let report = h.sweep_missed().await;
  assert_eq!(report.changed, 2);
  assert_eq!(report.failed, 0);

  let pending = h.store.find_pending_unlock_requests(id).await.unwrap();
  assert_eq!(pending.len(), 1);
  assert_eq!(pending[0].initiated_by, "scheduler");
  assert_eq!(pending[0].confirmations_count, 2);
  assert_eq!(pending[0].grace_period_ends_at, day(181));
  assert_eq!(h.subject(id).await.status, SubjectStatus::UnlockPending);
  assert_eq!(h.notifier.count(NotificationKind::UnlockRequested), 1);

  h.at(152);
  assert_eq!(h.sweep_missed().await.examined, 0);

  h.at(182);
  assert_eq!(h.sweep_unlocks().await.changed, 1);
  assert_eq!(h.subject(id).await.status, SubjectStatus::Unlocked);
}

#[tokio::test]
async fn request_lost_to_a_store_failure_is_opened_by_the_next_sweep() {
  let h = harness().await;
  let subject = h.escalated_subject().await;
  let id = subject.subject_id;
  let ids = h.contacts(id, 2).await;

  h.at(160);
  h.engine.confirmations().confirm_death(ids[0]).await.unwrap();
  h.store.fail_next_open();
  let err = h.engine.confirmations().confirm_death(ids[1]).await.unwrap_err();
  assert_eq!(err.kind(), ErrorKind::Transient);

  // The confirmation itself committed, so retrying it cannot help.
  let err = h.engine.confirmations().confirm_death(ids[1]).await.unwrap_err();
  assert!(matches!(err, Error::AlreadyConfirmed(_)));
  assert_eq!(h.subject(id).await.status, SubjectStatus::Escalation);
  assert!(h.store.find_pending_unlock_requests(id).await.unwrap().is_empty());

  h.at(161);
  let report = h.sweep_missed().await;
  assert_eq!(report.examined, 1);
  assert_eq!(report.changed, 1);

  let pending = h.store.find_pending_unlock_requests(id).await.unwrap();
  assert_eq!(pending.len(), 1);
  assert_eq!(pending[0].initiated_by, "scheduler");
  assert_eq!(pending[0].grace_period_ends_at, day(181));
  assert_eq!(h.subject(id).await.status, SubjectStatus::UnlockPending);
}

#[tokio::test]
async fn contacts_verify_and_confirm_by_token() {
  let h = harness().await;
  let subject = h.escalated_subject().await;
  let issued = h
    .engine
    .confirmations()
    .add_contact(subject.subject_id, "Ann".into(), "ann@example.com".into())
    .await
    .unwrap();

  let verified = h.engine.confirmations().verify_contact(&issued.token).await.unwrap();
  assert_eq!(verified.contact_id, issued.contact.contact_id);

  let outcome = h
    .engine
    .confirmations()
    .confirm_death_by_token(&issued.token)
    .await
    .unwrap();
  assert_eq!(outcome.confirmation_count, 1);

  let err = h
    .engine
    .confirmations()
    .confirm_death_by_token("not-a-token")
    .await
    .unwrap_err();
  assert!(matches!(err, Error::UnknownToken));
}

// ─── Unlock workflow ─────────────────────────────────────────────────────────

#[tokio::test]
async fn end_to_end_silence_to_unlock() {
  let h = harness().await;
  h.at(0);
  let subject = h.engine.tracker().register(30).await.unwrap();
  let id = subject.subject_id;
  let ids = h.contacts(id, 3).await;
  let recipient = h
    .store
    .add_recipient(NewRecipient {
      subject_id: id,
      name:       "Heir".into(),
      email:      "heir@example.com".into(),
      created_at: day(0),
    })
    .await
    .unwrap();

  for (n, expected) in [
    (91, SubjectStatus::MissedOne),
    (121, SubjectStatus::MissedTwo),
    (151, SubjectStatus::Escalation),
  ] {
    h.at(n);
    h.sweep_missed().await;
    let current = h.subject(id).await;
    assert_eq!(current.status, expected);
    assert!(current.grace_invariant_holds());
  }
  assert_eq!(h.subject(id).await.grace_period_ends_at, Some(day(181)));

  h.at(160);
  h.engine.confirmations().confirm_death(ids[0]).await.unwrap();
  let outcome = h.engine.confirmations().confirm_death(ids[1]).await.unwrap();
  let request = outcome.unlock_request.expect("request");
  assert_eq!(request.status, UnlockStatus::Pending);
  assert_eq!(request.confirmations_count, 2);
  assert_eq!(request.grace_period_ends_at, day(181));
  let pending = h.subject(id).await;
  assert_eq!(pending.status, SubjectStatus::UnlockPending);
  assert!(pending.grace_invariant_holds());

  h.at(181);
  assert_eq!(h.sweep_unlocks().await.examined, 0);

  h.at(182);
  let report = h.sweep_unlocks().await;
  assert_eq!(report.changed, 1);

  let resolved = h.store.get_unlock_request(request.request_id).await.unwrap().unwrap();
  assert_eq!(resolved.status, UnlockStatus::Approved);
  assert_eq!(resolved.completed_at, Some(day(182)));

  let unlocked = h.subject(id).await;
  assert_eq!(unlocked.status, SubjectStatus::Unlocked);
  assert!(unlocked.grace_invariant_holds());

  let recipients = h.store.list_recipients(id).await.unwrap();
  assert_eq!(recipients[0].recipient_id, recipient.recipient_id);
  assert_eq!(recipients[0].access_expires_at, Some(day(182 + 3650)));
  assert_eq!(h.notifier.count(NotificationKind::VaultUnlocked), 1);

  let actions: Vec<_> = h
    .store
    .list_audit(id)
    .await
    .unwrap()
    .into_iter()
    .map(|e| e.action)
    .collect();
  assert_eq!(actions, vec![
    AuditAction::UnlockRequestInitiated,
    AuditAction::VaultUnlocked
  ]);

  // A second resolution sweep finds nothing to do.
  let again = h.sweep_unlocks().await;
  assert_eq!(again.examined, 0);
  assert_eq!(h.notifier.count(NotificationKind::VaultUnlocked), 1);
}

#[tokio::test]
async fn unlock_notice_survives_a_refused_delivery() {
  let h = harness().await;
  let subject = h.escalated_subject().await;
  let id = subject.subject_id;
  let ids = h.contacts(id, 2).await;
  h.store
    .add_recipient(NewRecipient {
      subject_id: id,
      name:       "Heir".into(),
      email:      "heir@example.com".into(),
      created_at: day(0),
    })
    .await
    .unwrap();

  h.at(160);
  for contact in &ids {
    h.engine.confirmations().confirm_death(*contact).await.unwrap();
  }
  h.deliver().await;

  h.notifier.set_down(true);
  h.at(182);
  let report = h
    .engine
    .sweeps()
    .unlock_resolutions(&Shutdown::never())
    .await
    .unwrap();
  assert_eq!(report.changed, 1);
  assert_eq!(h.subject(id).await.status, SubjectStatus::Unlocked);

  let relay = h.deliver().await;
  assert_eq!(relay.failed, 1);
  assert_eq!(relay.changed, 0);
  let queued = h.store.pending_notifications(10).await.unwrap();
  assert_eq!(queued.len(), 1);
  assert_eq!(queued[0].intent.kind, NotificationKind::VaultUnlocked);
  assert_eq!(queued[0].attempts, 1);
  assert!(
    queued[0]
      .last_error
      .as_deref()
      .is_some_and(|e| e.contains("mail relay unavailable"))
  );
  assert_eq!(h.notifier.count(NotificationKind::VaultUnlocked), 0);

  h.notifier.set_down(false);
  h.at(183);
  assert_eq!(h.deliver().await.changed, 1);
  let sent = h.notifier.of_kind(NotificationKind::VaultUnlocked);
  assert_eq!(sent.len(), 1);
  let token = sent[0].payload["access_token"].as_str().expect("token");
  assert_eq!(token.len(), 64);
  assert!(h.store.pending_notifications(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn cancel_pending_resets_subject_and_cannot_repeat() {
  let h = harness().await;
  let subject = h.escalated_subject().await;
  let ids = h.contacts(subject.subject_id, 2).await;
  h.at(160);
  h.engine.confirmations().confirm_death(ids[0]).await.unwrap();
  let request = h
    .engine
    .confirmations()
    .confirm_death(ids[1])
    .await
    .unwrap()
    .unlock_request
    .expect("request");

  h.at(165);
  let cancelled = h
    .engine
    .unlocks()
    .cancel(request.request_id, "I am fine".into(), Actor::Subject(subject.subject_id))
    .await
    .unwrap();
  assert_eq!(cancelled.status, UnlockStatus::Cancelled);

  let alive = h.subject(subject.subject_id).await;
  assert_eq!(alive.status, SubjectStatus::Alive);
  assert!(alive.next_check_in_due_at > day(165));
  assert!(alive.grace_invariant_holds());
  assert_eq!(
    h.store.count_confirmed_contacts(subject.subject_id).await.unwrap(),
    0
  );

  let history = h.engine.tracker().history(subject.subject_id, 1).await.unwrap();
  assert_eq!(history[0].method, Some(CheckInMethod::UnlockCancellation));

  let err = h
    .engine
    .unlocks()
    .cancel(request.request_id, "again".into(), Actor::Subject(subject.subject_id))
    .await
    .unwrap_err();
  assert!(matches!(err, Error::RequestNotPending { status: UnlockStatus::Cancelled, .. }));
  assert_eq!(err.kind(), ErrorKind::InvalidState);

  let err = h
    .engine
    .unlocks()
    .cancel(Uuid::new_v4(), "nope".into(), Actor::Subject(subject.subject_id))
    .await
    .unwrap_err();
  assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn cancel_approved_request_is_invalid_state() {
  let h = harness().await;
  let subject = h.escalated_subject().await;
  let ids = h.contacts(subject.subject_id, 2).await;
  h.at(160);
  h.engine.confirmations().confirm_death(ids[0]).await.unwrap();
  let request = h
    .engine
    .confirmations()
    .confirm_death(ids[1])
    .await
    .unwrap()
    .unlock_request
    .expect("request");

  h.at(182);
  let resolution = h.engine.unlocks().resolve_expired(request.request_id).await.unwrap();
  assert!(matches!(resolution, Resolution::Approved(_)));

  let err = h
    .engine
    .unlocks()
    .cancel(request.request_id, "too late".into(), Actor::Subject(subject.subject_id))
    .await
    .unwrap_err();
  assert!(matches!(err, Error::RequestNotPending { status: UnlockStatus::Approved, .. }));
}

#[tokio::test]
async fn check_in_during_grace_blocks_approval() {
  let h = harness_with(EngineConfig {
    cancel_pending_on_check_in: false,
    ..EngineConfig::default()
  })
  .await;
  let subject = h.escalated_subject().await;
  let ids = h.contacts(subject.subject_id, 2).await;
  h.at(160);
  h.engine.confirmations().confirm_death(ids[0]).await.unwrap();
  h.engine.confirmations().confirm_death(ids[1]).await.unwrap();

  h.at(170);
  h.engine
    .tracker()
    .check_in(subject.subject_id, CheckInMethod::App)
    .await
    .unwrap();

  h.at(182);
  let report = h.sweep_unlocks().await;
  assert_eq!(report.changed, 1);

  let requests = h.engine.unlocks().list(subject.subject_id).await.unwrap();
  assert_eq!(requests[0].status, UnlockStatus::Cancelled);
  assert_eq!(h.subject(subject.subject_id).await.status, SubjectStatus::Alive);
  assert_eq!(h.notifier.count(NotificationKind::VaultUnlocked), 0);
}

#[tokio::test]
async fn check_in_path_cancels_pending_request() {
  let h = harness().await;
  let subject = h.escalated_subject().await;
  let ids = h.contacts(subject.subject_id, 2).await;
  h.at(160);
  h.engine.confirmations().confirm_death(ids[0]).await.unwrap();
  h.engine.confirmations().confirm_death(ids[1]).await.unwrap();

  h.at(170);
  h.engine
    .tracker()
    .check_in(subject.subject_id, CheckInMethod::App)
    .await
    .unwrap();
  let cancelled = h
    .engine
    .unlocks()
    .cancel_pending_on_check_in(subject.subject_id)
    .await
    .unwrap();
  assert_eq!(cancelled.len(), 1);

  let alive = h.subject(subject.subject_id).await;
  assert_eq!(alive.status, SubjectStatus::Alive);
  assert_eq!(alive.last_check_in_at, Some(day(170)));
  h.deliver().await;
  assert_eq!(h.notifier.count(NotificationKind::UnlockCancelled), 1);
}

#[tokio::test]
async fn request_without_quorum_returns_to_escalation() {
  let h = harness().await;
  let subject = h.escalated_subject().await;
  let ids = h.contacts(subject.subject_id, 2).await;
  h.at(160);
  h.engine.confirmations().confirm_death(ids[0]).await.unwrap();
  h.engine.confirmations().confirm_death(ids[1]).await.unwrap();

  // The same store, resolved by an engine that demands a larger quorum.
  let strict = Engine::new(
    Arc::clone(&h.store),
    Arc::clone(&h.notifier),
    Arc::clone(&h.clock) as Arc<dyn Clock>,
    EngineConfig {
      confirmation_threshold: 3,
      ..EngineConfig::default()
    },
  );
  h.at(182);
  let report = strict
    .sweeps()
    .unlock_resolutions(&Shutdown::never())
    .await
    .unwrap();
  assert_eq!(report.changed, 1);

  let back = h.subject(subject.subject_id).await;
  assert_eq!(back.status, SubjectStatus::Escalation);
  assert!(back.grace_invariant_holds());

  let last = h.store.list_audit(subject.subject_id).await.unwrap().pop().unwrap();
  assert_eq!(last.action, AuditAction::UnlockRequestExpired);
}

// ─── Scheduler ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn scheduler_runs_named_tasks_on_demand() {
  let h = harness().await;
  h.engine.tracker().register(30).await.unwrap();
  h.at(91);

  let scheduler = Scheduler::for_engine(Arc::clone(&h.engine), &SchedulerConfig::default());
  assert_eq!(scheduler.task_names().len(), 5);

  match scheduler.run_now(MISSED_CHECK_INS).await {
    RunOutcome::Completed(report) => assert_eq!(report.changed, 1),
    other => panic!("unexpected outcome: {other:?}"),
  }
  match scheduler.run_now(NOTIFICATION_DELIVERY).await {
    RunOutcome::Completed(report) => assert_eq!(report.changed, 1),
    other => panic!("unexpected outcome: {other:?}"),
  }
  assert_eq!(h.notifier.count(NotificationKind::MissedOne), 1);
  assert_eq!(scheduler.run_now("no-such-task").await, RunOutcome::UnknownTask);
}

#[tokio::test]
async fn scheduler_start_and_stop() {
  let h = harness().await;
  h.engine.tracker().register(30).await.unwrap();
  h.at(91);

  let mut scheduler = Scheduler::for_engine(Arc::clone(&h.engine), &SchedulerConfig {
    run_on_startup: false,
    ..SchedulerConfig::default()
  });
  scheduler.start();
  scheduler.stop().await;

  // Nothing ran: the first tick is hours away and startup runs are off.
  assert!(h.notifier.kinds().is_empty());
}
