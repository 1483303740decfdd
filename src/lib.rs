//! Rebound - Resilient Single-Connection Database Client
//!
//! Rebound manages one database connection for one caller and keeps it
//! usable across transient failures: connection attempts retry with
//! exponential backoff and jitter, and a statement that hits a transient
//! failure is rolled back, the connection is re-established, and the
//! statement is resubmitted.
//!
//! # Core Principles
//! - Every statement runs in a transaction that either commits or rolls back
//! - Failures are classified at the driver boundary (transient vs not)
//! - Non-transient failures surface immediately and unchanged
//! - The connection is released on every exit path of a scoped acquisition
//!
//! # Module Organization
//! - [`error`] - Driver error classification and client error types
//! - [`retry`] - Backoff policy and the sleeper seam
//! - [`engine`] - Driver/session traits and the `PostgreSQL` / `SQLite` drivers
//! - [`client`] - The retrying [`Client`] and its scoped guard
//! - [`config`] - Connection profiles for the CLI
//! - [`logging`] - Subscriber setup for the CLI
//! - [`output`] - JSON output envelope types
//!
//! # Example
//! ```no_run
//! # #[cfg(feature = "sqlite")]
//! # fn main() -> rebound::Result<()> {
//! use rebound::engine::sqlite::SqliteDriver;
//! use rebound::{Client, ConnectionParams, RetryConfig};
//!
//! let mut client = Client::new(
//!     SqliteDriver::default(),
//!     ConnectionParams::sqlite("app.db"),
//!     RetryConfig::default(),
//! )?;
//!
//! let rows = client.scoped(|c| c.query("SELECT 1", &[]))?;
//! assert_eq!(rows[0]["1"], 1);
//! # Ok(())
//! # }
//! # #[cfg(not(feature = "sqlite"))]
//! # fn main() {}
//! ```

pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod output;
pub mod retry;

// Re-export commonly used types for convenience
pub use client::{Client, ClientGuard};
pub use config::{
    list_profiles, load_with_precedence, resolve_settings, save_profile, ConfigLocation,
    Overrides, ProfileRegistry, RetrySettings, StoredProfile,
};
pub use engine::{
    BindValue, ConnectionParams, ConnectionState, DatabaseType, Driver, Row, Session,
};
pub use error::{ClientError, DriverError, ErrorKind, Operation, Result};
pub use output::{ErrorEnvelope, ErrorInfo, Metadata, SuccessEnvelope};
pub use retry::{RetryConfig, RetryPolicy, Sleeper, ThreadSleeper};
