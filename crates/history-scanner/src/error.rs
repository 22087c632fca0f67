//! Error types for archive scanning.
//!
//! Failures are classified once, where they happen, and then carried as data:
//!
//! - [`QueueError`] comes out of the HTTP engine and says whether the request
//!   failed because the object is missing, because of something worth
//!   retrying, or terminally; and whether the fault lies with the connection
//!   or with the content.
//! - [`ScanError`] is what ends up persisted on a [`Scan`](crate::Scan):
//!   either a `VERIFICATION` problem (a gap or a hash mismatch, a real defect
//!   in the archive) or a `CONNECTION` problem (inconclusive, retry later).
//! - [`VerificationFailure`] is returned by the pure ledger verifier.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::url_builder::Category;

/// Message carried by errors for objects the archive does not have.
pub const NOT_FOUND_MESSAGE: &str = "the object does not exist";

/// How the HTTP engine should treat a failed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueErrorKind {
    /// HTTP 404: the object is not published.
    NotFound,
    /// Timeouts, aborted connections, HTTP 429, corrupt streams.
    Retryable,
    /// Anything else. Never retried.
    Fatal,
}

/// Which side of the exchange a failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCause {
    Connection,
    Verification,
}

/// A classified request failure.
#[derive(Debug, Clone, Error)]
#[error("{kind:?} {cause:?} error for {url}: {message}")]
pub struct QueueError {
    pub kind: QueueErrorKind,
    pub cause: ErrorCause,
    pub url: String,
    pub checkpoint: Option<u32>,
    pub message: String,
}

impl QueueError {
    pub fn not_found(url: impl Into<String>) -> Self {
        Self {
            kind: QueueErrorKind::NotFound,
            cause: ErrorCause::Verification,
            url: url.into(),
            checkpoint: None,
            message: NOT_FOUND_MESSAGE.to_string(),
        }
    }

    pub fn retryable(cause: ErrorCause, url: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: QueueErrorKind::Retryable,
            cause,
            url: url.into(),
            checkpoint: None,
            message: message.into(),
        }
    }

    pub fn fatal(cause: ErrorCause, url: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: QueueErrorKind::Fatal,
            cause,
            url: url.into(),
            checkpoint: None,
            message: message.into(),
        }
    }

    /// Classify a transport-level failure from reqwest.
    pub fn from_transport(url: impl Into<String>, error: &reqwest::Error) -> Self {
        let transient = error.is_timeout()
            || error.is_connect()
            || error.is_request()
            || error.is_body()
            || error.is_decode();
        if transient {
            Self::retryable(ErrorCause::Connection, url, error.to_string())
        } else {
            Self::fatal(ErrorCause::Connection, url, error.to_string())
        }
    }

    /// Attach the checkpoint the request belonged to, keeping one that is
    /// already set.
    pub fn with_checkpoint(mut self, checkpoint: Option<u32>) -> Self {
        if self.checkpoint.is_none() {
            self.checkpoint = checkpoint;
        }
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == QueueErrorKind::Retryable
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == QueueErrorKind::NotFound
    }
}

/// Persisted classification of a scan failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScanErrorType {
    Verification,
    Connection,
}

impl fmt::Display for ScanErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanErrorType::Verification => f.write_str("verification"),
            ScanErrorType::Connection => f.write_str("connection"),
        }
    }
}

/// The error embedded in a failed [`Scan`](crate::Scan).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(rename_all = "camelCase")]
#[error("{error_type} error at {url}: {message}")]
pub struct ScanError {
    #[serde(rename = "type")]
    pub error_type: ScanErrorType,
    pub url: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<u32>,
}

impl ScanError {
    pub fn verification(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: ScanErrorType::Verification,
            url: url.into(),
            message: message.into(),
            checkpoint: None,
        }
    }

    pub fn connection(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: ScanErrorType::Connection,
            url: url.into(),
            message: message.into(),
            checkpoint: None,
        }
    }

    pub fn with_checkpoint(mut self, checkpoint: u32) -> Self {
        self.checkpoint = Some(checkpoint);
        self
    }

    pub fn is_verification(&self) -> bool {
        self.error_type == ScanErrorType::Verification
    }

    /// A missing file: a hole in the published history.
    pub fn is_gap(&self) -> bool {
        self.is_verification() && self.message == NOT_FOUND_MESSAGE
    }
}

impl From<QueueError> for ScanError {
    fn from(error: QueueError) -> Self {
        let error_type = match (error.kind, error.cause) {
            (QueueErrorKind::NotFound, _) => ScanErrorType::Verification,
            (_, ErrorCause::Verification) => ScanErrorType::Verification,
            (_, ErrorCause::Connection) => ScanErrorType::Connection,
        };
        ScanError {
            error_type,
            url: error.url,
            message: error.message,
            checkpoint: error.checkpoint,
        }
    }
}

/// First ledger that failed verification within a range.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{category} verification failed at ledger {ledger}: {message}")]
pub struct VerificationFailure {
    pub ledger: u32,
    pub category: Category,
    pub message: String,
}

/// Failures of a [`ScanRepository`](crate::ScanRepository) backend.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage error: {0}")]
    Storage(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_maps_to_verification() {
        let err: ScanError = QueueError::not_found("http://a/b").with_checkpoint(Some(127)).into();
        assert_eq!(err.error_type, ScanErrorType::Verification);
        assert_eq!(err.checkpoint, Some(127));
        assert_eq!(err.message, "the object does not exist");
        assert!(err.is_gap());
    }

    #[test]
    fn test_cause_decides_scan_error_type() {
        let conn: ScanError =
            QueueError::retryable(ErrorCause::Connection, "http://a", "timed out").into();
        assert_eq!(conn.error_type, ScanErrorType::Connection);

        let corrupt: ScanError =
            QueueError::retryable(ErrorCause::Verification, "http://a", "bad gzip").into();
        assert_eq!(corrupt.error_type, ScanErrorType::Verification);
    }

    #[test]
    fn test_with_checkpoint_keeps_existing() {
        let err = QueueError::not_found("u")
            .with_checkpoint(Some(63))
            .with_checkpoint(Some(127));
        assert_eq!(err.checkpoint, Some(63));
    }

    #[test]
    fn test_scan_error_json_shape() {
        let err = ScanError::connection("http://a", "HTTP status 503");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["type"], "CONNECTION");
        assert_eq!(json["url"], "http://a");
        assert!(json.get("checkpoint").is_none());
    }
}
