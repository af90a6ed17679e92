//! Application error model with MCP error mapping
//!
//! Defines the error taxonomy shared by the cache engine and the remote
//! boundary, and maps each variant to the MCP `ErrorData` type returned by
//! tool handlers.

use rmcp::model::ErrorData;
use serde_json::json;
use thiserror::Error;

/// Application error type
///
/// The remote-facing variants distinguish "try again later"
/// (`Connection`, `RemoteUnavailable`) from "the server said no"
/// (`RemoteRejected`) and from "we cannot know what happened"
/// (`AmbiguousOutcome`), so callers can pick between retry, report and
/// re-check.
#[derive(Debug, Clone, Error)]
pub enum AppError {
    /// Caller error (validation failed, bad folder name, empty required list)
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Resource not found (account, message, part)
    #[error("not found: {0}")]
    NotFound(String),
    /// Transient remote failure (timeout, connection reset); retryable
    #[error("connection error: {0}")]
    Connection(String),
    /// Transient remote failures persisted after all retry attempts
    #[error("remote unavailable: {0}")]
    RemoteUnavailable(String),
    /// Remote refused the operation (unknown folder, bad credentials)
    #[error("remote rejected: {0}")]
    RemoteRejected(String),
    /// Connection dropped after a mutation was dispatched
    #[error("ambiguous outcome: {0}")]
    AmbiguousOutcome(String),
    /// Internal error (unexpected failure, external crate error)
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Convenience constructor for `InvalidInput`
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Whether the retry boundary may repeat the failed call
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_))
    }

    /// Convert to MCP `ErrorData`
    ///
    /// # Mappings
    ///
    /// - `InvalidInput` → `invalid_params`
    /// - `NotFound` → `resource_not_found`
    /// - `Connection` / `RemoteUnavailable` → `internal_error` (`remote_unavailable`)
    /// - `RemoteRejected` → `invalid_request`
    /// - `AmbiguousOutcome` → `internal_error` (`ambiguous_outcome`)
    /// - `Internal` → `internal_error`
    pub fn to_error_data(&self) -> ErrorData {
        let msg = self.to_string();
        match self {
            Self::InvalidInput(_) => {
                ErrorData::invalid_params(msg, Some(json!({ "code": "invalid_input" })))
            }
            Self::NotFound(_) => {
                ErrorData::resource_not_found(msg, Some(json!({ "code": "not_found" })))
            }
            Self::Connection(_) | Self::RemoteUnavailable(_) => ErrorData::internal_error(
                msg,
                Some(json!({ "code": "remote_unavailable", "retryable": true })),
            ),
            Self::RemoteRejected(_) => {
                ErrorData::invalid_request(msg, Some(json!({ "code": "remote_rejected" })))
            }
            Self::AmbiguousOutcome(_) => ErrorData::internal_error(
                msg,
                Some(json!({ "code": "ambiguous_outcome", "recheck": true })),
            ),
            Self::Internal(_) => {
                ErrorData::internal_error(msg, Some(json!({ "code": "internal" })))
            }
        }
    }
}

/// Type alias for fallible return values
pub type AppResult<T> = Result<T, AppError>;
