//! Error descriptor shared by the transport, retry policy and cache.
//!
//! Transport failures are classified exactly once, where they are produced,
//! into a closed set of kinds. Everything downstream matches on the kind.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
  /// Aborted by the issuer
  Cancelled,
  /// Connection could not be made or was lost
  Network,
  /// Transport timeout or HTTP 408
  Timeout,
  /// HTTP 429
  RateLimited,
  /// Any other 4xx
  ClientError,
  /// 5xx
  ServerError,
  Unclassified,
}

impl ErrorKind {
  pub fn as_str(self) -> &'static str {
    match self {
      ErrorKind::Cancelled => "cancelled",
      ErrorKind::Network => "network",
      ErrorKind::Timeout => "timeout",
      ErrorKind::RateLimited => "rate-limited",
      ErrorKind::ClientError => "client-error",
      ErrorKind::ServerError => "server-error",
      ErrorKind::Unclassified => "unclassified",
    }
  }
}

impl fmt::Display for ErrorKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Map an HTTP status to an error kind.
pub fn classify_status(status: u16) -> ErrorKind {
  match status {
    408 => ErrorKind::Timeout,
    429 => ErrorKind::RateLimited,
    400..=499 => ErrorKind::ClientError,
    500..=599 => ErrorKind::ServerError,
    _ => ErrorKind::Unclassified,
  }
}

/// A failed RPC attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct RpcError {
  pub kind: ErrorKind,
  pub status: Option<u16>,
  /// Server-suggested wait before the next attempt
  pub retry_after: Option<Duration>,
  pub message: String,
}

impl RpcError {
  pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
    Self {
      kind,
      status: None,
      retry_after: None,
      message: message.into(),
    }
  }

  pub fn cancelled(message: impl Into<String>) -> Self {
    Self::new(ErrorKind::Cancelled, message)
  }

  pub fn network(message: impl Into<String>) -> Self {
    Self::new(ErrorKind::Network, message)
  }

  pub fn timeout(message: impl Into<String>) -> Self {
    Self::new(ErrorKind::Timeout, message)
  }

  pub fn unclassified(message: impl Into<String>) -> Self {
    Self::new(ErrorKind::Unclassified, message)
  }

  /// Build an error from an HTTP status, classifying it.
  pub fn from_status(status: u16, message: impl Into<String>) -> Self {
    Self {
      kind: classify_status(status),
      status: Some(status),
      retry_after: None,
      message: message.into(),
    }
  }

  pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
    self.retry_after = Some(retry_after);
    self
  }

  pub fn is_cancelled(&self) -> bool {
    self.kind == ErrorKind::Cancelled
  }

  /// Whether the error carries a 4xx status.
  pub fn is_client_status(&self) -> bool {
    self.status.is_some_and(|s| (400..500).contains(&s))
  }
}
