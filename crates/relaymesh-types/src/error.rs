//! Shared error types for relaymesh.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Top-level error type for routing, correlation and transport failures.
///
/// Domain failures of an operation are never returned as a `MeshError` from a
/// module call; they travel inside a failed [`ResponseMessage`] as an
/// [`ErrorValue`] instead.
///
/// [`ResponseMessage`]: crate::messages::ResponseMessage
#[derive(Error, Debug)]
pub enum MeshError {
    /// A module had to forward an envelope but no sink is configured.
    #[error("No sink configured on module '{module}'")]
    NoSink {
        /// The module that could not forward.
        module: String,
    },

    /// The operation is not handled by the module it was addressed to.
    #[error("Unhandled operation '{operation}' for thing '{thing_id}'")]
    UnhandledOperation {
        /// The operation that was requested.
        operation: String,
        /// The addressed thing.
        thing_id: String,
    },

    /// The requested property does not exist.
    #[error("Property not found: {0}")]
    PropertyNotFound(String),

    /// A response reached a module that neither owns it nor has a sink.
    #[error("End of the line for response to '{thing_id}', no sink")]
    EndOfLine {
        /// The thing the response was addressed to.
        thing_id: String,
    },

    /// The transport binding cannot carry this kind of message.
    #[error("{0} is not supported by this protocol")]
    NotSupported(String),

    /// The sender is not allowed to perform the operation.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// The client or connection is not (or no longer) connected.
    #[error("Not connected: {0}")]
    NotConnected(String),

    /// No response arrived before the timeout.
    #[error("Timeout waiting for response to '{0}'")]
    Timeout(String),

    /// A correlation ID was opened while already open.
    #[error("Correlation ID already open: {0}")]
    DuplicateCorrelation(String),

    /// The response carried an error.
    #[error("Remote error {}: {}", .0.status, .0.title)]
    Remote(ErrorValue),

    /// Payload (de)serialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid input from the caller.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Alias for Result with MeshError.
pub type MeshResult<T> = Result<T, MeshError>;

/// RFC 9457 problem-details value carried by failed responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorValue {
    /// HTTP-style status code.
    pub status: u16,
    /// Short human readable summary.
    pub title: String,
    /// Longer explanation, if any.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub detail: String,
    /// Problem type URI.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub problem_type: Option<String>,
}

impl ErrorValue {
    /// Create an error value with a status and title.
    pub fn new(status: u16, title: impl Into<String>) -> Self {
        Self {
            status,
            title: title.into(),
            detail: String::new(),
            problem_type: None,
        }
    }

    /// Attach a detail message.
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }
}

impl std::fmt::Display for ErrorValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.detail.is_empty() {
            write!(f, "{} {}", self.status, self.title)
        } else {
            write!(f, "{} {}: {}", self.status, self.title, self.detail)
        }
    }
}

impl From<&MeshError> for ErrorValue {
    fn from(err: &MeshError) -> Self {
        let status = match err {
            MeshError::NoSink { .. } => 503,
            MeshError::UnhandledOperation { .. } => 501,
            MeshError::PropertyNotFound(_) => 404,
            MeshError::EndOfLine { .. } => 502,
            MeshError::NotSupported(_) => 501,
            MeshError::Unauthorized(_) => 403,
            MeshError::NotConnected(_) => 503,
            MeshError::Timeout(_) => 504,
            MeshError::InvalidInput(_) | MeshError::Serialization(_) => 400,
            MeshError::Remote(value) => return value.clone(),
            MeshError::DuplicateCorrelation(_) => 500,
        };
        ErrorValue::new(status, err.to_string())
    }
}

impl From<MeshError> for ErrorValue {
    fn from(err: MeshError) -> Self {
        ErrorValue::from(&err)
    }
}
