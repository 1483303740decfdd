//! Error Handling Infrastructure
//!
//! This module defines all error types used throughout Rebound.
//!
//! Driver failures are classified once, at the driver boundary, into a
//! [`DriverError`] carrying an [`ErrorKind`]. The client decides whether to
//! retry by inspecting that kind, never by matching on driver-specific types.
//!
//! # Error Categories
//! - `ExhaustedRetries`: a transient failure persisted through every attempt
//! - `Failed`: a non-transient driver failure, surfaced without retry
//! - `NotConnected`: a statement was issued while the client was closed
//! - `InvalidInput`: malformed retry settings or parameters
//! - `ConfigError`: profile file or environment variable errors

use std::fmt;

use thiserror::Error;

/// Retry classification of a driver failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Connectivity or availability failure; eligible for retry
    Transient,
    /// Logic, permission or syntax failure; never retried
    NonTransient,
}

impl ErrorKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::NonTransient => "non-transient",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure reported by a database driver
#[derive(Error, Debug)]
#[error("{message}")]
pub struct DriverError {
    kind: ErrorKind,
    code: Option<String>,
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl DriverError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, code: None, message: message.into(), source: None }
    }

    /// Create a transient (retryable) driver error
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    /// Create a non-transient driver error
    pub fn non_transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NonTransient, message)
    }

    /// Attach the driver's native error code (SQLSTATE, SQLite result code, ...)
    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Attach the underlying driver error
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self.kind, ErrorKind::Transient)
    }

    #[must_use]
    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// The client operation an error belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Opening the connection
    Connect,
    /// A single statement via `execute`
    Query,
    /// A parameter batch via `execute_batch`
    Batch,
}

impl Operation {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "Connection",
            Self::Query => "Query",
            Self::Batch => "Batch execution",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for Rebound operations
#[derive(Error, Debug)]
pub enum ClientError {
    /// A transient failure persisted through `max_retries` attempts
    #[error("{operation} failed after {attempts} attempts: {source}")]
    ExhaustedRetries {
        operation: Operation,
        attempts: u32,
        #[source]
        source: DriverError,
    },

    /// A non-transient failure, surfaced immediately
    #[error("{operation} failed: {source}")]
    Failed {
        operation: Operation,
        #[source]
        source: DriverError,
    },

    /// A statement was issued while no connection is open
    #[error("Not connected: call connect() before issuing statements")]
    NotConnected,

    /// Invalid input or configuration values
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration error (file not found, invalid JSON, missing env var)
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl ClientError {
    /// Convert error to error code string for JSON output
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::ExhaustedRetries { .. } => "EXHAUSTED_RETRIES",
            Self::Failed { operation: Operation::Connect, .. } => "CONNECTION_FAILED",
            Self::Failed { operation: Operation::Query, .. } => "QUERY_FAILED",
            Self::Failed { operation: Operation::Batch, .. } => "BATCH_FAILED",
            Self::NotConnected => "NOT_CONNECTED",
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::ConfigError(_) => "CONFIG_ERROR",
        }
    }

    /// Get human-readable error message (never includes credentials)
    #[must_use]
    pub fn message(&self) -> String {
        self.to_string()
    }

    /// The operation that failed, if the error came from the driver
    #[must_use]
    pub const fn operation(&self) -> Option<Operation> {
        match self {
            Self::ExhaustedRetries { operation, .. } | Self::Failed { operation, .. } => {
                Some(*operation)
            }
            _ => None,
        }
    }

    /// The underlying driver error, if any
    #[must_use]
    pub const fn driver_error(&self) -> Option<&DriverError> {
        match self {
            Self::ExhaustedRetries { source, .. } | Self::Failed { source, .. } => Some(source),
            _ => None,
        }
    }

    pub(crate) fn exhausted(operation: Operation, attempts: u32, source: DriverError) -> Self {
        Self::ExhaustedRetries { operation, attempts, source }
    }

    pub(crate) fn failed(operation: Operation, source: DriverError) -> Self {
        Self::Failed { operation, source }
    }

    /// Create an invalid input error
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Create a configuration error
    pub fn config_error(message: impl Into<String>) -> Self {
        Self::ConfigError(message.into())
    }
}

/// Result type alias for Rebound operations
pub type Result<T> = std::result::Result<T, ClientError>;

/// Result type alias for driver primitives
pub type DriverResult<T> = std::result::Result<T, DriverError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_error_codes() {
        let exhausted =
            ClientError::exhausted(Operation::Query, 3, DriverError::transient("server closed"));
        assert_eq!(exhausted.error_code(), "EXHAUSTED_RETRIES");
        assert_eq!(
            ClientError::failed(Operation::Connect, DriverError::non_transient("auth")).error_code(),
            "CONNECTION_FAILED"
        );
        assert_eq!(
            ClientError::failed(Operation::Query, DriverError::non_transient("syntax")).error_code(),
            "QUERY_FAILED"
        );
        assert_eq!(
            ClientError::failed(Operation::Batch, DriverError::non_transient("unique")).error_code(),
            "BATCH_FAILED"
        );
        assert_eq!(ClientError::NotConnected.error_code(), "NOT_CONNECTED");
        assert_eq!(ClientError::invalid_input("test").error_code(), "INVALID_INPUT");
        assert_eq!(ClientError::config_error("test").error_code(), "CONFIG_ERROR");
    }

    #[test]
    fn test_exhausted_message_names_operation_and_cause() {
        let err = ClientError::exhausted(
            Operation::Batch,
            3,
            DriverError::transient("connection reset by peer"),
        );
        let message = err.message();
        assert!(message.contains("Batch execution failed after 3 attempts"));
        assert!(message.contains("connection reset by peer"));
    }

    #[test]
    fn test_driver_error_keeps_source_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let driver = DriverError::transient("lost connection").with_code("08006").with_source(io);
        assert!(driver.is_transient());
        assert_eq!(driver.code(), Some("08006"));
        assert!(driver.source().is_some());

        let err = ClientError::exhausted(Operation::Connect, 1, driver);
        let source = err.source().expect("client error wraps driver error");
        assert_eq!(source.to_string(), "lost connection");
        assert_eq!(err.driver_error().map(DriverError::kind), Some(ErrorKind::Transient));
    }

    #[test]
    fn test_operation_only_for_driver_errors() {
        assert_eq!(ClientError::NotConnected.operation(), None);
        assert!(ClientError::NotConnected.driver_error().is_none());
        let err = ClientError::failed(Operation::Query, DriverError::non_transient("x"));
        assert_eq!(err.operation(), Some(Operation::Query));
    }
}
