//! Error handling
//!
//! Every failure that can cross the message bus has a stable [`ErrorKind`].
//! On the wire an error travels as a [`RemoteError`] (kind + message +
//! optional structured parameters); locally it is a [`StorageError`].
//! Converting between the two preserves both kind and message, so a caller
//! on the proxy side sees the same failure the engine raised.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable error kinds shared by both peers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// A referenced document or attachment does not exist
    NotFound,
    /// A write was rejected because the stored revision differs
    Conflict,
    /// Request parameters could not be decoded or are invalid
    InvalidParams,
    /// The requested method is not part of the operation set
    UnknownMethod,
    /// The connection id has no registered session
    UnknownSession,
    /// The storage factory failed to create an instance
    CreationFailed,
    /// The instance has been closed
    Closed,
    /// No reply arrived within the configured timeout
    Timeout,
    /// The message bus stopped delivering messages
    Disconnected,
    /// Anything else, including kinds this peer does not know
    #[serde(other)]
    Internal,
}

impl ErrorKind {
    /// Wire name of the kind
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "NOT_FOUND",
            Self::Conflict => "CONFLICT",
            Self::InvalidParams => "INVALID_PARAMS",
            Self::UnknownMethod => "UNKNOWN_METHOD",
            Self::UnknownSession => "UNKNOWN_SESSION",
            Self::CreationFailed => "CREATION_FAILED",
            Self::Closed => "CLOSED",
            Self::Timeout => "TIMEOUT",
            Self::Disconnected => "DISCONNECTED",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by storage operations, local or remote
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Write conflict: {0}")]
    Conflict(String),

    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    #[error("Unknown method: {0}")]
    UnknownMethod(String),

    #[error("Unknown session: {0}")]
    UnknownSession(String),

    #[error("Failed to create storage instance: {0}")]
    CreationFailed(String),

    #[error("Storage instance closed: {0}")]
    Closed(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Message bus disconnected: {0}")]
    Disconnected(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl StorageError {
    /// Build an error of the given kind
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::NotFound => Self::NotFound(message),
            ErrorKind::Conflict => Self::Conflict(message),
            ErrorKind::InvalidParams => Self::InvalidParams(message),
            ErrorKind::UnknownMethod => Self::UnknownMethod(message),
            ErrorKind::UnknownSession => Self::UnknownSession(message),
            ErrorKind::CreationFailed => Self::CreationFailed(message),
            ErrorKind::Closed => Self::Closed(message),
            ErrorKind::Timeout => Self::Timeout(message),
            ErrorKind::Disconnected => Self::Disconnected(message),
            ErrorKind::Internal => Self::Internal(message),
        }
    }

    /// The stable kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::InvalidParams(_) => ErrorKind::InvalidParams,
            Self::UnknownMethod(_) => ErrorKind::UnknownMethod,
            Self::UnknownSession(_) => ErrorKind::UnknownSession,
            Self::CreationFailed(_) => ErrorKind::CreationFailed,
            Self::Closed(_) => ErrorKind::Closed,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Disconnected(_) => ErrorKind::Disconnected,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// The message without the kind prefix
    pub fn message(&self) -> &str {
        match self {
            Self::NotFound(m)
            | Self::Conflict(m)
            | Self::InvalidParams(m)
            | Self::UnknownMethod(m)
            | Self::UnknownSession(m)
            | Self::CreationFailed(m)
            | Self::Closed(m)
            | Self::Timeout(m)
            | Self::Disconnected(m)
            | Self::Internal(m) => m,
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(error: serde_json::Error) -> Self {
        Self::InvalidParams(error.to_string())
    }
}

/// Serialized error payload carried in a reply's `error` field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteError {
    pub kind: ErrorKind,
    pub message: String,
    /// Optional machine-readable details
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
}

impl RemoteError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            parameters: None,
        }
    }

    /// Attach structured parameters
    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.parameters = Some(parameters);
        self
    }
}

impl From<&StorageError> for RemoteError {
    fn from(error: &StorageError) -> Self {
        RemoteError::new(error.kind(), error.message())
    }
}

impl From<StorageError> for RemoteError {
    fn from(error: StorageError) -> Self {
        RemoteError::from(&error)
    }
}

impl From<RemoteError> for StorageError {
    fn from(error: RemoteError) -> Self {
        StorageError::new(error.kind, error.message)
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_wire_names() {
        let json = serde_json::to_string(&ErrorKind::UnknownSession).unwrap();
        assert_eq!(json, "\"UNKNOWN_SESSION\"");
        assert_eq!(ErrorKind::UnknownSession.to_string(), "UNKNOWN_SESSION");
    }

    #[test]
    fn test_unknown_kind_decodes_as_internal() {
        let err: RemoteError =
            serde_json::from_str(r#"{"kind":"DISK_ON_FIRE","message":"hot"}"#).unwrap();
        assert_eq!(err.kind, ErrorKind::Internal);
        assert_eq!(err.message, "hot");
    }

    #[test]
    fn test_remote_conversion_preserves_kind_and_message() {
        let err = StorageError::NotFound("document 'a' missing".to_string());
        let remote = RemoteError::from(&err);
        assert_eq!(remote.kind, ErrorKind::NotFound);
        assert_eq!(remote.message, "document 'a' missing");

        let back = StorageError::from(remote);
        assert_eq!(back, err);
    }

    #[test]
    fn test_error_display() {
        let err = StorageError::UnknownSession("abc".to_string());
        let msg = err.to_string();
        assert!(msg.contains("Unknown session"));
        assert!(msg.contains("abc"));
    }

    #[test]
    fn test_parameters_omitted_when_absent() {
        let json = serde_json::to_value(RemoteError::new(ErrorKind::Conflict, "rev")).unwrap();
        assert!(json.get("parameters").is_none());

        let json = serde_json::to_value(
            RemoteError::new(ErrorKind::Conflict, "rev")
                .with_parameters(serde_json::json!({"id": "a"})),
        )
        .unwrap();
        assert_eq!(json["parameters"]["id"], "a");
    }
}
