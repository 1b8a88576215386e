//! Typed errors for each step of the worker pipeline.
//!
//! Application-level plumbing (config, CLI) uses `color_eyre::Result`; the
//! components below return these so callers can tell a recoverable network
//! failure from a fatal storage one.

use thiserror::Error;

use crate::worker::lifecycle::{LifecycleEvent, WorkerState};

/// Transport-level failure. An HTTP error status is not a `NetworkError`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
  /// Host unreachable, connection reset, DNS failure, ...
  #[error("network unreachable: {0}")]
  Unreachable(String),

  /// Request did not complete within the configured timeout.
  #[error("network request timed out")]
  Timeout,

  /// Request could not be built (bad URL, bad header).
  #[error("invalid request: {0}")]
  InvalidRequest(String),
}

impl NetworkError {
  /// Whether this failure means "we are offline" rather than "the request is wrong".
  pub fn is_offline(&self) -> bool {
    matches!(self, Self::Unreachable(_) | Self::Timeout)
  }
}

impl From<reqwest::Error> for NetworkError {
  fn from(err: reqwest::Error) -> Self {
    if err.is_timeout() {
      Self::Timeout
    } else if err.is_builder() {
      Self::InvalidRequest(err.to_string())
    } else {
      Self::Unreachable(err.to_string())
    }
  }
}

/// Failure of a cache or outbox storage backend.
#[derive(Error, Debug)]
pub enum StorageError {
  #[error("storage backend error: {0}")]
  Backend(#[from] rusqlite::Error),

  #[error("failed to encode stored value: {0}")]
  Encoding(#[from] serde_json::Error),

  #[error("lock poisoned: {0}")]
  Poisoned(String),

  #[error("bucket {0} does not exist")]
  MissingBucket(String),
}

/// Install failures. All of them are fatal to the installing worker.
#[derive(Error, Debug)]
pub enum InstallError {
  #[error("failed to precache {url}: {source}")]
  Unreachable {
    url: String,
    #[source]
    source: NetworkError,
  },

  #[error("failed to precache {url}: server answered {status}")]
  BadStatus { url: String, status: u16 },

  #[error("invalid manifest entry {entry}: {reason}")]
  InvalidManifest { entry: String, reason: String },

  #[error(transparent)]
  Storage(#[from] StorageError),
}

/// Errors surfaced by the outbox.
#[derive(Error, Debug)]
pub enum OutboxError {
  /// The store could not be written; the operation was NOT saved.
  #[error("failed to save pending operation: {0}")]
  Storage(#[from] StorageError),

  /// A stored entry could not be decoded; the drain cycle is aborted.
  #[error("outbox store is unreadable: {0}")]
  Corrupt(String),

  #[error("cannot resolve endpoint for {target}: {reason}")]
  Endpoint { target: String, reason: String },
}

/// Why a single outbox entry was kept in the queue.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReplayFailure {
  #[error(transparent)]
  Network(#[from] NetworkError),

  #[error("server answered {status}")]
  Rejected { status: u16 },

  #[error("{0}")]
  Endpoint(String),

  /// The entry could not be leased for replay.
  #[error("outbox store error: {0}")]
  Storage(String),
}

/// A lifecycle event that is not valid in the current state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("cannot apply {event:?} while {state:?}")]
pub struct LifecycleError {
  pub state: WorkerState,
  pub event: LifecycleEvent,
}

/// Failure while the worker handles an event.
#[derive(Error, Debug)]
pub enum WorkerError {
  #[error("install failed: {0}")]
  Install(#[from] InstallError),

  #[error(transparent)]
  Lifecycle(#[from] LifecycleError),

  #[error(transparent)]
  Storage(#[from] StorageError),

  #[error(transparent)]
  Network(#[from] NetworkError),

  #[error(transparent)]
  Outbox(#[from] OutboxError),
}
