//! Error types shared by the repositories and the highlight sync engine.

use thiserror::Error;

/// Failure of a remote read or write.
///
/// Cloneable so one failed fetch can be handed to every caller waiting on
/// the same in-flight request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
  /// The caller is not entitled to the resource.
  #[error("not authorized: {0}")]
  Unauthorized(String),
  /// Network or server trouble.
  #[error("unavailable: {0}")]
  Unavailable(String),
  /// The payload could not be decoded or is missing required fields.
  #[error("malformed: {0}")]
  Malformed(String),
}

/// Why a pending highlight operation could not be applied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OperationError {
  /// Add or update without a color. Never sent, never retried.
  #[error("operation is missing its color payload")]
  MissingPayload,
  /// The remote collaborator failed or declined the call.
  #[error(transparent)]
  Remote(#[from] FetchError),
}

impl OperationError {
  pub fn is_retryable(&self) -> bool {
    matches!(self, OperationError::Remote(_))
  }
}

/// A USFM passage id that could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid passage id '{0}'")]
pub struct InvalidPassage(pub String);
