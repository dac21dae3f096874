//! Error type for `vigil-engine`.

use thiserror::Error;
use uuid::Uuid;
use vigil_core::unlock::UnlockStatus;

/// How a caller should treat an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
  /// The referenced entity does not exist. Surfaced, never retried.
  NotFound,
  /// The input was rejected before touching any state.
  InvalidInput,
  /// The entity is not in a state that permits the operation.
  InvalidState,
  /// Store or notification I/O failed or timed out. Safe to retry.
  Transient,
  /// Persisted state breaks an invariant and needs manual review.
  ConsistencyViolation,
}

#[derive(Debug, Error)]
pub enum Error {
  #[error("subject {0} not found")]
  SubjectNotFound(Uuid),

  #[error("trusted contact {0} not found")]
  ContactNotFound(Uuid),

  #[error("unlock request {0} not found")]
  RequestNotFound(Uuid),

  #[error("unknown token")]
  UnknownToken,

  #[error("trusted contact {0} has already confirmed")]
  AlreadyConfirmed(Uuid),

  #[error("unlock request {id} is {status}, not pending")]
  RequestNotPending { id: Uuid, status: UnlockStatus },

  #[error("subject {0} changed concurrently")]
  ConcurrentUpdate(Uuid),

  #[error(transparent)]
  Core(#[from] vigil_core::Error),

  #[error("{op} failed: {source}")]
  Transient {
    op:     &'static str,
    #[source]
    source: Box<dyn std::error::Error + Send + Sync>,
  },

  #[error("{0} timed out")]
  Timeout(&'static str),

  #[error("consistency violation on subject {subject_id}: {detail}")]
  ConsistencyViolation { subject_id: Uuid, detail: String },
}

impl Error {
  pub(crate) fn transient<E>(op: &'static str, source: E) -> Self
  where
    E: std::error::Error + Send + Sync + 'static,
  {
    Self::Transient { op, source: Box::new(source) }
  }

  pub fn kind(&self) -> ErrorKind {
    match self {
      Self::SubjectNotFound(_)
      | Self::ContactNotFound(_)
      | Self::RequestNotFound(_)
      | Self::UnknownToken => ErrorKind::NotFound,
      Self::Core(_) => ErrorKind::InvalidInput,
      Self::AlreadyConfirmed(_)
      | Self::RequestNotPending { .. }
      | Self::ConcurrentUpdate(_) => ErrorKind::InvalidState,
      Self::Transient { .. } | Self::Timeout(_) => ErrorKind::Transient,
      Self::ConsistencyViolation { .. } => ErrorKind::ConsistencyViolation,
    }
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
