//! Database Driver Traits and Core Types
//!
//! This module defines the seam between the resilient client and the
//! underlying database driver. Each engine (`PostgreSQL`, `SQLite`) provides a
//! [`Driver`] that opens a [`Session`]; the session offers the primitives the
//! client composes into retrying operations (execute, batch, commit, rollback,
//! close).
//!
//! # Classification at the boundary
//! Every session method reports failures as a [`DriverError`] already
//! classified as transient or non-transient. Engines inspect their native
//! error codes (SQLSTATE, `SQLite` result codes) to decide.
//!
//! # Engine Isolation
//! Each engine implementation is completely independent.
//! No shared SQL helpers or cross-engine abstractions.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{DriverError, DriverResult};

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;

/// Default `PostgreSQL` port
pub const DEFAULT_PORT: u16 = 5432;

/// A bind parameter. Engines convert it to their native parameter types.
pub type BindValue = serde_json::Value;

/// One result row: column name to value, in the column order of the result set.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Supported database engine types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    /// `PostgreSQL` database
    Postgres,
    /// `SQLite` database
    SQLite,
}

impl DatabaseType {
    /// Get the engine name as a string
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::SQLite => "sqlite",
        }
    }
}

impl fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for DatabaseType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "sqlite" => Ok(Self::SQLite),
            other => Err(format!("unknown engine '{other}' (expected postgres or sqlite)")),
        }
    }
}

/// Connection identity, supplied once at client construction
///
/// For `SQLite`, `database` holds the file path (or `:memory:`) and the
/// remaining fields are ignored.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionParams {
    /// Hostname or IP address
    pub host: String,

    /// Database name
    pub database: String,

    /// User name
    pub user: String,

    /// Password
    /// WARNING: Sensitive data, do not log or include in error messages
    pub password: String,

    /// Port number
    pub port: u16,
}

impl ConnectionParams {
    /// Create connection parameters for a server database
    pub fn new(
        host: impl Into<String>,
        database: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            host: host.into(),
            database: database.into(),
            user: user.into(),
            password: password.into(),
            port,
        }
    }

    /// Create connection parameters for a `SQLite` file (or `:memory:`)
    pub fn sqlite(path: impl Into<String>) -> Self {
        Self::new("", path, "", "", 0)
    }
}

impl fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("host", &self.host)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("port", &self.port)
            .finish()
    }
}

/// Whether the client currently holds an open session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Closed,
    Open,
}

/// Opens sessions against one kind of database
pub trait Driver {
    type Session: Session;

    /// Engine identifier, used in logs and output envelopes
    fn engine(&self) -> DatabaseType;

    /// Open a connection together with its statement handle
    fn connect(&self, params: &ConnectionParams) -> DriverResult<Self::Session>;
}

/// An open connection with its statement handle
///
/// Statements run inside a transaction the session opens on demand; nothing
/// is visible to other connections until [`commit`](Session::commit).
pub trait Session {
    /// Run one statement. With `fetch`, collect every row the statement
    /// produces; without it, return `None`.
    fn execute(
        &mut self,
        statement: &str,
        params: &[BindValue],
        fetch: bool,
    ) -> DriverResult<Option<Vec<Row>>>;

    /// Run one statement once per parameter tuple.
    fn execute_batch(&mut self, statement: &str, param_list: &[Vec<BindValue>]) -> DriverResult<()>;

    /// Commit the active transaction, if any.
    fn commit(&mut self) -> DriverResult<()>;

    /// Roll back the active transaction, if any.
    fn rollback(&mut self) -> DriverResult<()>;

    /// Release the statement handles, then the connection.
    fn close(self) -> DriverResult<()>;
}

/// Standard conversion of a parameter that an engine cannot bind
pub(crate) fn unsupported_param(index: usize, value: &BindValue, target: &str) -> DriverError {
    DriverError::non_transient(format!("Cannot bind parameter ${} ({value}) as {target}", index + 1))
}
