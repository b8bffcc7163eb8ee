//! Shared error type across PortLink crates.

use thiserror::Error;

/// Machine-readable error codes carried by rejected sends and failure replies
/// (stable API).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Payload failed its registered schema.
    Validation,
    /// No reply within the deadline after exhausting retries.
    Timeout,
    /// Operation referenced an unknown target id.
    TargetNotFound,
    /// Target exists but is not in the connected state.
    NotConnected,
    /// Origin rejected or unsafe target origin.
    Security,
    /// Payload could not be serialized for transmission.
    Serialization,
    /// Handshake failure, unexpected closure, or heartbeat-detected loss.
    Connection,
    /// Setup mistake (bad config value, missing allowed origins).
    Config,
    /// Internal invariant failure.
    Internal,
}

impl ErrorCode {
    /// String representation used on the wire in failure replies.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Validation => "VALIDATION_FAILED",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::TargetNotFound => "TARGET_NOT_FOUND",
            ErrorCode::NotConnected => "NOT_CONNECTED",
            ErrorCode::Security => "SECURITY",
            ErrorCode::Serialization => "SERIALIZATION",
            ErrorCode::Connection => "CONNECTION",
            ErrorCode::Config => "CONFIG",
            ErrorCode::Internal => "INTERNAL",
        }
    }
}

/// Shared result type.
pub type Result<T> = std::result::Result<T, PortLinkError>;

/// Unified error type used by core and engine.
#[derive(Debug, Error)]
pub enum PortLinkError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("timed out after {attempts} attempt(s)")]
    Timeout { attempts: u32 },
    #[error("unknown target: {0}")]
    TargetNotFound(String),
    #[error("target not connected: {0}")]
    NotConnected(String),
    #[error("security: {0}")]
    Security(String),
    #[error("serialization: {0}")]
    Serialization(String),
    #[error("connection: {0}")]
    Connection(String),
    #[error("config: {0}")]
    Config(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl PortLinkError {
    /// Map internal error to a stable machine-readable code.
    pub fn code(&self) -> ErrorCode {
        match self {
            PortLinkError::Validation(_) => ErrorCode::Validation,
            PortLinkError::Timeout { .. } => ErrorCode::Timeout,
            PortLinkError::TargetNotFound(_) => ErrorCode::TargetNotFound,
            PortLinkError::NotConnected(_) => ErrorCode::NotConnected,
            PortLinkError::Security(_) => ErrorCode::Security,
            PortLinkError::Serialization(_) => ErrorCode::Serialization,
            PortLinkError::Connection(_) => ErrorCode::Connection,
            PortLinkError::Config(_) => ErrorCode::Config,
            PortLinkError::Internal(_) => ErrorCode::Internal,
        }
    }
}
