//! Error types for the synchronization layer.
//!
//! Fetch errors know whether retrying could help. Only the fetch path ever
//! retries; mutations and the push channel report and move on.

use thiserror::Error;

/// Whether retrying the failed operation may succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transience {
  /// Retry will never help without changing inputs (validation, auth, conflict).
  Permanent,
  /// Retry may help (timeout, connection reset, server outage).
  Retryable,
}

impl Transience {
  pub fn is_retryable(self) -> bool {
    matches!(self, Transience::Retryable)
  }
}

/// Failure while fetching a page from the collection endpoint.
///
/// `Clone` so one failure can be handed to every waiter of a de-duplicated
/// request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
  #[error("request timed out")]
  Timeout,
  #[error("network error: {0}")]
  Network(String),
  #[error("server error {status}: {message}")]
  Server { status: u16, message: String },
  #[error("request rejected ({status}): {message}")]
  Rejected { status: u16, message: String },
  #[error("malformed response: {0}")]
  Decode(String),
}

impl FetchError {
  pub fn transience(&self) -> Transience {
    match self {
      FetchError::Timeout | FetchError::Network(_) | FetchError::Server { .. } => {
        Transience::Retryable
      }
      FetchError::Rejected { .. } | FetchError::Decode(_) => Transience::Permanent,
    }
  }
}

/// Failure while submitting a single item mutation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MutationError {
  #[error("mutation rejected ({status}): {reason}")]
  Rejected { status: u16, reason: String },
  #[error("network error: {0}")]
  Network(String),
  #[error("malformed response: {0}")]
  Decode(String),
}

impl MutationError {
  /// Short human-readable reason, used in bulk outcome reports.
  pub fn reason(&self) -> String {
    match self {
      MutationError::Rejected { reason, .. } => reason.clone(),
      other => other.to_string(),
    }
  }
}

/// Failure of the push channel. Never surfaced to views; it only drives
/// connection state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
  #[error("failed to connect: {0}")]
  Connect(String),
  #[error("stream error: {0}")]
  Stream(String),
}
