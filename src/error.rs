//! Error taxonomy shared by the cache, the remote adapters and the mutation
//! coordinator.

use std::time::Duration;

/// Failure reported by a [`RemoteDataSource`](crate::remote::RemoteDataSource).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
  #[error("network error: {0}")]
  Network(String),
  #[error("authentication failed: {0}")]
  Auth(String),
  #[error("not found: {0}")]
  NotFound(String),
  #[error("remote error: {0}")]
  Unknown(String),
}

impl RemoteError {
  pub fn timeout(after: Duration) -> Self {
    RemoteError::Network(format!("request timed out after {}ms", after.as_millis()))
  }
}

impl From<serde_json::Error> for RemoteError {
  fn from(err: serde_json::Error) -> Self {
    RemoteError::Unknown(format!("failed to decode record: {}", err))
  }
}

/// Rejected mutation input, reported before any remote call is made.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
  #[error("{field} must be a positive id, got {value}")]
  InvalidId { field: &'static str, value: i64 },
  #[error("{0} must not be empty")]
  Missing(&'static str),
  #[error("profile patch has no fields to update")]
  EmptyPatch,
}

/// Error returned to the caller of a mutation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MutationError {
  #[error(transparent)]
  Validation(#[from] ValidationError),
  #[error(transparent)]
  Remote(#[from] RemoteError),
  #[error("remote returned a {0} record for this mutation")]
  UnexpectedRecord(&'static str),
}

/// Non-fatal condition: the last refresh failed but previously fetched data
/// is still being served.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("showing data from {age_ms}ms ago; last refresh failed: {error}")]
pub struct StaleDataWarning {
  pub error: RemoteError,
  pub age_ms: u128,
}
