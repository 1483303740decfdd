//! JSON Output Envelope Types
//!
//! Every `rebound` command prints exactly one envelope per result on stdout.
//!
//! # Output Contract
//! - Success: `{"ok": true, "engine": "...", "command": "...", "data": ..., "meta": {...}}`
//! - Error: `{"ok": false, "engine": "...", "command": "...", "error": {"code": "...", "message": "..."}}`
//!
//! `code` values are the stable strings from [`ClientError::error_code`].

use serde::{Deserialize, Serialize};

use crate::engine::Row;
use crate::error::ClientError;

/// Success envelope for operation results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessEnvelope<T> {
    /// Always true for success envelopes
    pub ok: bool,

    /// Database engine used (postgres, sqlite)
    pub engine: String,

    /// Command that was executed (exec, batch, shell, profile)
    pub command: String,

    pub data: T,

    pub meta: Metadata,
}

impl<T> SuccessEnvelope<T> {
    pub fn new(engine: impl Into<String>, command: impl Into<String>, data: T, meta: Metadata) -> Self {
        Self { ok: true, engine: engine.into(), command: command.into(), data, meta }
    }
}

/// Error envelope for operation failures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    /// Always false for error envelopes
    pub ok: bool,

    /// Database engine (empty string if not engine-specific)
    pub engine: String,

    pub command: String,

    pub error: ErrorInfo,
}

impl ErrorEnvelope {
    pub fn new(engine: impl Into<String>, command: impl Into<String>, error: ErrorInfo) -> Self {
        Self { ok: false, engine: engine.into(), command: command.into(), error }
    }

    /// Create error envelope from a [`ClientError`]
    pub fn from_error(engine: impl Into<String>, command: impl Into<String>, err: &ClientError) -> Self {
        let mut info = ErrorInfo::new(err.error_code(), err.message());
        if let ClientError::ExhaustedRetries { attempts, .. } = err {
            info.attempts = Some(*attempts);
        }
        info.transient = err.driver_error().map(crate::error::DriverError::is_transient);
        info.driver_code = err.driver_error().and_then(|e| e.code()).map(str::to_string);
        Self::new(engine, command, info)
    }
}

/// Error information structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Stable error code (e.g., "EXHAUSTED_RETRIES", "QUERY_FAILED")
    pub code: String,

    /// Human-readable error message (no credentials)
    pub message: String,

    /// Attempts made, for exhausted retries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,

    /// Classification of the underlying driver failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transient: Option<bool>,

    /// Native driver code (SQLSTATE or `SQLite` extended code)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_code: Option<String>,
}

impl ErrorInfo {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            attempts: None,
            transient: None,
            driver_code: None,
        }
    }
}

/// Data payload for `exec` and `shell` statements
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatementResult {
    /// Rows when fetched, `null` otherwise
    pub rows: Option<Vec<Row>>,
}

/// Data payload for `batch`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResult {
    /// Number of parameter tuples submitted
    pub tuples: usize,
}

/// Execution metadata included in all success responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    /// Wall time in milliseconds, including any retries
    pub execution_ms: u64,

    /// Number of rows returned (for fetched statements)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows_returned: Option<usize>,
}

impl Metadata {
    pub const fn new(execution_ms: u64) -> Self {
        Self { execution_ms, rows_returned: None }
    }

    pub const fn with_rows(execution_ms: u64, rows_returned: usize) -> Self {
        Self { execution_ms, rows_returned: Some(rows_returned) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{DriverError, Operation};

    #[test]
    fn test_success_envelope_serialization() {
        let mut row = Row::new();
        row.insert("1".to_string(), serde_json::json!(1));
        let envelope = SuccessEnvelope::new(
            "sqlite",
            "exec",
            StatementResult { rows: Some(vec![row]) },
            Metadata::with_rows(42, 1),
        );

        let json = serde_json::to_string(&envelope).unwrap();
        assert_eq!(
            json,
            r#"{"ok":true,"engine":"sqlite","command":"exec","data":{"rows":[{"1":1}]},"meta":{"execution_ms":42,"rows_returned":1}}"#
        );
    }

    #[test]
    fn test_statement_without_fetch_serializes_null_rows() {
        let envelope =
            SuccessEnvelope::new("postgres", "exec", StatementResult { rows: None }, Metadata::new(3));
        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains(r#""data":{"rows":null}"#));
        assert!(!json.contains("rows_returned"));
    }

    #[test]
    fn test_error_envelope_serialization() {
        let envelope = ErrorEnvelope::new(
            "postgres",
            "exec",
            ErrorInfo::new("NOT_CONNECTED", "Not connected"),
        );

        let json = serde_json::to_string(&envelope).unwrap();
        assert_eq!(
            json,
            r#"{"ok":false,"engine":"postgres","command":"exec","error":{"code":"NOT_CONNECTED","message":"Not connected"}}"#
        );
    }

    #[test]
    fn test_error_envelope_from_exhausted_retries() {
        let err = ClientError::exhausted(
            Operation::Query,
            3,
            DriverError::transient("server closed the connection").with_code("08006"),
        );
        let envelope = ErrorEnvelope::from_error("postgres", "exec", &err);

        assert!(!envelope.ok);
        assert_eq!(envelope.error.code, "EXHAUSTED_RETRIES");
        assert_eq!(envelope.error.attempts, Some(3));
        assert_eq!(envelope.error.transient, Some(true));
        assert_eq!(envelope.error.driver_code.as_deref(), Some("08006"));
        assert!(envelope.error.message.contains("Query failed after 3 attempts"));
    }

    #[test]
    fn test_error_envelope_from_config_error() {
        let err = ClientError::config_error("Profile 'x' not found");
        let envelope = ErrorEnvelope::from_error("", "profile", &err);

        assert_eq!(envelope.error.code, "CONFIG_ERROR");
        assert!(envelope.error.attempts.is_none());
        assert!(envelope.error.transient.is_none());
        let json = serde_json::to_string(&envelope).unwrap();
        assert!(!json.contains("driver_code"));
    }

    #[test]
    fn test_batch_result_serialization() {
        let envelope = SuccessEnvelope::new("sqlite", "batch", BatchResult { tuples: 3 }, Metadata::new(7));
        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains(r#""data":{"tuples":3}"#));
    }
}
