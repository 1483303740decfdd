//! `SQLite` Database Driver Implementation
//!
//! This module implements the [`Driver`] and [`Session`] traits for `SQLite`.
//!
//! # Features
//! - File-based connections (`/path/to/db.sqlite`)
//! - In-memory connections (`:memory:`)
//! - Lazily opened transactions (`BEGIN` before the first statement)
//! - Prepared statement cache, flushed before the connection closes
//!
//! # Implementation Notes
//! - Uses `rusqlite` (synchronous driver, no async needed)
//! - BLOB data is Base64-encoded for JSON safety
//! - Lock contention (`SQLITE_BUSY`/`SQLITE_LOCKED`) and I/O failures are
//!   transient; everything else is non-transient. An unopenable file is
//!   transient unless its parent directory is missing.
//! - Multi-statement text runs statement by statement in one transaction

use std::path::Path;
use std::time::Duration;

use rusqlite::types::{Value as SqliteValue, ValueRef};
use rusqlite::{Batch, Connection, ErrorCode, Statement};

use crate::engine::{BindValue, ConnectionParams, DatabaseType, Driver, Row, Session};
use crate::error::{DriverError, DriverResult, ErrorKind};

/// `SQLite` driver
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDriver {
    busy_timeout: Option<Duration>,
}

impl SqliteDriver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// How long `SQLite` itself waits on a locked database before reporting busy
    #[must_use]
    pub const fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = Some(timeout);
        self
    }
}

impl Driver for SqliteDriver {
    type Session = SqliteSession;

    fn engine(&self) -> DatabaseType {
        DatabaseType::SQLite
    }

    fn connect(&self, params: &ConnectionParams) -> DriverResult<SqliteSession> {
        let conn = Connection::open(&params.database).map_err(|e| {
            if parent_exists(&params.database) {
                return classify_sqlite_error(e, "Failed to open SQLite database");
            }
            // Waiting cannot create a missing parent directory
            let mut err = DriverError::non_transient(format!(
                "Failed to open SQLite database: {e} (parent directory does not exist)"
            ));
            if let rusqlite::Error::SqliteFailure(failure, _) = &e {
                err = err.with_code(failure.extended_code.to_string());
            }
            err.with_source(e)
        })?;

        if let Some(timeout) = self.busy_timeout {
            conn.busy_timeout(timeout)
                .map_err(|e| classify_sqlite_error(e, "Failed to set busy timeout"))?;
        }

        Ok(SqliteSession { conn })
    }
}

/// An open `SQLite` connection
#[derive(Debug)]
pub struct SqliteSession {
    conn: Connection,
}

impl SqliteSession {
    fn begin(&self) -> DriverResult<()> {
        if self.conn.is_autocommit() {
            self.conn
                .execute_batch("BEGIN")
                .map_err(|e| classify_sqlite_error(e, "Failed to begin transaction"))?;
        }
        Ok(())
    }

    /// Whether a transaction is currently open
    #[must_use]
    pub fn in_transaction(&self) -> bool {
        !self.conn.is_autocommit()
    }
}

impl Session for SqliteSession {
    /// Runs every statement in `statement` in order and returns the rows of
    /// the last one. Bind values are only accepted for single-statement text.
    fn execute(
        &mut self,
        statement: &str,
        params: &[BindValue],
        fetch: bool,
    ) -> DriverResult<Option<Vec<Row>>> {
        let mut batch = Batch::new(&self.conn, statement);
        let mut stmt = next_statement(&mut batch, "Failed to prepare query")?
            .ok_or_else(|| DriverError::non_transient("Empty statement"))?;

        self.begin()?;

        let values: Vec<SqliteValue> = params.iter().map(bind_value).collect();
        let mut result = run_statement(&mut stmt, &values, fetch)?;

        while let Some(mut stmt) = next_statement(&mut batch, "Failed to prepare query")? {
            if !values.is_empty() {
                return Err(DriverError::non_transient(
                    "Bind values require a single statement",
                ));
            }
            result = run_statement(&mut stmt, &[], fetch)?;
        }

        Ok(result)
    }

    fn execute_batch(&mut self, statement: &str, param_list: &[Vec<BindValue>]) -> DriverResult<()> {
        if param_list.is_empty() {
            return Ok(());
        }

        let mut batch = Batch::new(&self.conn, statement);
        if next_statement(&mut batch, "Failed to prepare batch statement")?.is_none() {
            return Err(DriverError::non_transient("Empty statement"));
        }
        if next_statement(&mut batch, "Failed to prepare batch statement")?.is_some() {
            return Err(DriverError::non_transient(
                "Batch execution takes a single statement",
            ));
        }

        self.begin()?;

        let mut stmt = self
            .conn
            .prepare_cached(statement)
            .map_err(|e| classify_sqlite_error(e, "Failed to prepare batch statement"))?;

        for params in param_list {
            let values: Vec<SqliteValue> = params.iter().map(bind_value).collect();
            let mut rows = stmt
                .query(rusqlite::params_from_iter(values.iter()))
                .map_err(|e| classify_sqlite_error(e, "Failed to execute batch statement"))?;
            while rows
                .next()
                .map_err(|e| classify_sqlite_error(e, "Failed to execute batch statement"))?
                .is_some()
            {}
        }

        Ok(())
    }

    fn commit(&mut self) -> DriverResult<()> {
        if self.in_transaction() {
            self.conn
                .execute_batch("COMMIT")
                .map_err(|e| classify_sqlite_error(e, "Failed to commit"))?;
        }
        Ok(())
    }

    fn rollback(&mut self) -> DriverResult<()> {
        if self.in_transaction() {
            self.conn
                .execute_batch("ROLLBACK")
                .map_err(|e| classify_sqlite_error(e, "Failed to roll back"))?;
        }
        Ok(())
    }

    fn close(self) -> DriverResult<()> {
        self.conn.flush_prepared_statement_cache();
        self.conn.close().map_err(|(_, e)| classify_sqlite_error(e, "Failed to close connection"))
    }
}

/// Whether the directory a database file would live in exists. In-memory and
/// URI databases have no parent to check.
fn parent_exists(database: &str) -> bool {
    if database == ":memory:" || database.starts_with("file:") {
        return true;
    }
    match Path::new(database).parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.is_dir(),
        _ => true,
    }
}

/// Next non-empty statement of a multi-statement string
fn next_statement<'conn>(
    batch: &mut Batch<'conn, '_>,
    context: &str,
) -> DriverResult<Option<Statement<'conn>>> {
    batch.next().map_err(|e| classify_sqlite_error(e, context))
}

/// Step a prepared statement to completion, collecting rows when asked
fn run_statement(
    stmt: &mut Statement<'_>,
    values: &[SqliteValue],
    fetch: bool,
) -> DriverResult<Option<Vec<Row>>> {
    let column_names: Vec<String> =
        stmt.column_names().iter().map(|s| (*s).to_string()).collect();

    // Stepping through the rows is what runs the statement, so the loop
    // also covers statements without a result set
    let mut rows = stmt
        .query(rusqlite::params_from_iter(values.iter()))
        .map_err(|e| classify_sqlite_error(e, "Failed to execute query"))?;

    let mut collected = Vec::new();
    while let Some(row) = rows
        .next()
        .map_err(|e| classify_sqlite_error(e, "Failed to fetch row"))?
    {
        if fetch {
            let mapped = row_to_json(&column_names, row)
                .map_err(|e| classify_sqlite_error(e, "Failed to convert row"))?;
            collected.push(mapped);
        }
    }

    Ok(fetch.then_some(collected))
}

/// Map an `SQLite` result code to a retry classification
#[must_use]
pub const fn kind_for_code(code: ErrorCode) -> ErrorKind {
    match code {
        ErrorCode::DatabaseBusy
        | ErrorCode::DatabaseLocked
        | ErrorCode::SystemIoFailure
        | ErrorCode::CannotOpen
        | ErrorCode::FileLockingProtocolFailed => ErrorKind::Transient,
        _ => ErrorKind::NonTransient,
    }
}

/// Classify a `rusqlite` error, keeping it as the source
fn classify_sqlite_error(err: rusqlite::Error, context: &str) -> DriverError {
    let message = format!("{context}: {err}");
    match &err {
        rusqlite::Error::SqliteFailure(failure, _) => {
            let code = failure.extended_code.to_string();
            DriverError::new(kind_for_code(failure.code), message).with_code(code).with_source(err)
        }
        _ => DriverError::non_transient(message).with_source(err),
    }
}

/// Convert a bind value to an `SQLite` value by its JSON type
fn bind_value(value: &BindValue) -> SqliteValue {
    use serde_json::Value;

    match value {
        Value::Null => SqliteValue::Null,
        Value::Bool(b) => SqliteValue::Integer(i64::from(*b)),
        Value::Number(n) => n.as_i64().map_or_else(
            || SqliteValue::Real(n.as_f64().unwrap_or(f64::NAN)),
            SqliteValue::Integer,
        ),
        Value::String(s) => SqliteValue::Text(s.clone()),
        // Nested JSON is stored as its text form (usable with SQLite's json functions)
        Value::Array(_) | Value::Object(_) => SqliteValue::Text(value.to_string()),
    }
}

/// Convert a `SQLite` row to a column-ordered map
fn row_to_json(
    column_names: &[String],
    row: &rusqlite::Row<'_>,
) -> std::result::Result<Row, rusqlite::Error> {
    let mut map = Row::new();
    for (idx, name) in column_names.iter().enumerate() {
        map.insert(name.clone(), sqlite_value_to_json(row, idx)?);
    }
    Ok(map)
}

fn sqlite_value_to_json(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> std::result::Result<serde_json::Value, rusqlite::Error> {
    let value_ref = row.get_ref(idx)?;

    Ok(match value_ref {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => serde_json::Value::Number(i.into()),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map_or(serde_json::Value::Null, serde_json::Value::Number), // Handle NaN/Infinity as null
        ValueRef::Text(s) => {
            let text = std::str::from_utf8(s).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    idx,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })?;
            serde_json::Value::String(text.to_string())
        }
        ValueRef::Blob(b) => {
            use base64::Engine;
            serde_json::Value::String(base64::engine::general_purpose::STANDARD.encode(b))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_db(name: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir()
            .join(format!("rebound_sqlite_{name}_{}.db", std::process::id()));
        let _ = std::fs::remove_file(&path);
        path
    }

    fn open(path: &std::path::Path) -> SqliteSession {
        SqliteDriver::new()
            .connect(&ConnectionParams::sqlite(path.to_string_lossy()))
            .expect("open sqlite session")
    }

    #[test]
    fn test_select_one_in_memory() {
        let mut session = open(std::path::Path::new(":memory:"));
        let rows = session.execute("SELECT 1", &[], true).unwrap().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("1"), Some(&json!(1)));
        session.commit().unwrap();
        assert!(!session.in_transaction());
        session.close().unwrap();
    }

    #[test]
    fn test_execute_without_fetch_returns_none() {
        let mut session = open(std::path::Path::new(":memory:"));
        session.execute("CREATE TABLE t (id INTEGER)", &[], false).unwrap();
        let result = session.execute("SELECT * FROM t", &[], false).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_columns_keep_result_order() {
        let mut session = open(std::path::Path::new(":memory:"));
        let rows = session
            .execute("SELECT 3 AS zeta, 'a' AS alpha, NULL AS mid", &[], true)
            .unwrap()
            .unwrap();
        let keys: Vec<&str> = rows[0].keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["zeta", "alpha", "mid"]);
        assert_eq!(rows[0]["mid"], serde_json::Value::Null);
    }

    #[test]
    fn test_bind_values_by_json_type() {
        let mut session = open(std::path::Path::new(":memory:"));
        let rows = session
            .execute(
                "SELECT ?1 AS i, ?2 AS f, ?3 AS s, ?4 AS b, ?5 AS n, ?6 AS j",
                &[json!(42), json!(1.5), json!("text"), json!(true), json!(null), json!({"k": 1})],
                true,
            )
            .unwrap()
            .unwrap();
        let row = &rows[0];
        assert_eq!(row["i"], json!(42));
        assert_eq!(row["f"], json!(1.5));
        assert_eq!(row["s"], json!("text"));
        assert_eq!(row["b"], json!(1));
        assert_eq!(row["n"], json!(null));
        assert_eq!(row["j"], json!(r#"{"k":1}"#));
    }

    #[test]
    fn test_blob_is_base64() {
        let mut session = open(std::path::Path::new(":memory:"));
        let rows = session.execute("SELECT x'DEADBEEF' AS data", &[], true).unwrap().unwrap();
        assert_eq!(rows[0]["data"], json!("3q2+7w=="));
    }

    #[test]
    fn test_rollback_discards_uncommitted_work() {
        let path = temp_db("rollback");
        let mut session = open(&path);
        session.execute("CREATE TABLE items (name TEXT)", &[], false).unwrap();
        session.commit().unwrap();

        session.execute("INSERT INTO items VALUES ('pending')", &[], false).unwrap();
        assert!(session.in_transaction());
        session.rollback().unwrap();

        let rows = session.execute("SELECT COUNT(*) AS n FROM items", &[], true).unwrap().unwrap();
        assert_eq!(rows[0]["n"], json!(0));
        session.close().unwrap();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_batch_inserts_every_tuple() {
        let mut session = open(std::path::Path::new(":memory:"));
        session.execute("CREATE TABLE kv (k TEXT, v INTEGER)", &[], false).unwrap();
        session
            .execute_batch(
                "INSERT INTO kv VALUES (?1, ?2)",
                &[vec![json!("a"), json!(1)], vec![json!("b"), json!(2)], vec![json!("c"), json!(3)]],
            )
            .unwrap();
        session.commit().unwrap();
        let rows = session.execute("SELECT SUM(v) AS total FROM kv", &[], true).unwrap().unwrap();
        assert_eq!(rows[0]["total"], json!(6));
    }

    #[test]
    fn test_empty_batch_is_noop() {
        let mut session = open(std::path::Path::new(":memory:"));
        session.execute_batch("INSERT INTO missing VALUES (?1)", &[]).unwrap();
        assert!(!session.in_transaction());
        session.commit().unwrap();
    }

    #[test]
    fn test_syntax_error_is_non_transient() {
        let mut session = open(std::path::Path::new(":memory:"));
        let err = session.execute("SELEC 1", &[], true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NonTransient);
        assert!(err.message().contains("Failed to prepare query"));
    }

    #[test]
    fn test_constraint_violation_is_non_transient() {
        let mut session = open(std::path::Path::new(":memory:"));
        session.execute("CREATE TABLE u (id INTEGER PRIMARY KEY)", &[], false).unwrap();
        session.execute("INSERT INTO u VALUES (1)", &[], false).unwrap();
        let err = session.execute("INSERT INTO u VALUES (1)", &[], false).unwrap_err();
        assert!(!err.is_transient());
        assert!(err.code().is_some());
    }

    #[test]
    fn test_lock_contention_is_transient() {
        let path = temp_db("busy");
        let mut writer = open(&path);
        writer.execute("CREATE TABLE t (id INTEGER)", &[], false).unwrap();
        writer.commit().unwrap();
        writer.execute("INSERT INTO t VALUES (1)", &[], false).unwrap();

        let mut contender = SqliteDriver::new()
            .with_busy_timeout(Duration::ZERO)
            .connect(&ConnectionParams::sqlite(path.to_string_lossy()))
            .unwrap();
        let err = contender.execute("INSERT INTO t VALUES (2)", &[], false).unwrap_err();
        assert!(err.is_transient(), "expected busy to be transient: {err}");

        contender.rollback().unwrap();
        writer.commit().unwrap();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_multiple_statements_all_run() {
        let mut session = open(std::path::Path::new(":memory:"));
        session.execute("CREATE TABLE t (id INTEGER)", &[], false).unwrap();

        session
            .execute("INSERT INTO t VALUES (1); INSERT INTO t VALUES (2);", &[], false)
            .unwrap();
        let rows = session.execute("SELECT COUNT(*) AS n FROM t", &[], true).unwrap().unwrap();
        assert_eq!(rows[0]["n"], json!(2));
    }

    #[test]
    fn test_multiple_statements_return_last_rows() {
        let mut session = open(std::path::Path::new(":memory:"));
        let rows = session.execute("SELECT 1 AS a; SELECT 2 AS b", &[], true).unwrap().unwrap();
        assert_eq!(rows, vec![json!({"b": 2}).as_object().unwrap().clone()]);
    }

    #[test]
    fn test_later_statement_sees_earlier_schema() {
        let mut session = open(std::path::Path::new(":memory:"));
        let rows = session
            .execute("CREATE TABLE s (v TEXT); INSERT INTO s VALUES ('x'); SELECT v FROM s", &[], true)
            .unwrap()
            .unwrap();
        assert_eq!(rows[0]["v"], json!("x"));
    }

    #[test]
    fn test_failing_later_statement_rolls_back_earlier_ones() {
        let path = temp_db("multi_rollback");
        let mut session = open(&path);
        session.execute("CREATE TABLE t (id INTEGER PRIMARY KEY)", &[], false).unwrap();
        session.commit().unwrap();

        let err = session
            .execute("INSERT INTO t VALUES (1); INSERT INTO t VALUES (1)", &[], false)
            .unwrap_err();
        assert!(!err.is_transient());
        session.rollback().unwrap();

        let rows = session.execute("SELECT COUNT(*) AS n FROM t", &[], true).unwrap().unwrap();
        assert_eq!(rows[0]["n"], json!(0));
        session.close().unwrap();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_bind_values_with_multiple_statements_rejected() {
        let mut session = open(std::path::Path::new(":memory:"));
        let err = session.execute("SELECT ?1; SELECT 2", &[json!(1)], true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NonTransient);
        assert!(err.message().contains("single statement"));
    }

    #[test]
    fn test_empty_statements_rejected() {
        let mut session = open(std::path::Path::new(":memory:"));
        for sql in ["", "   ", ";", "-- only a comment"] {
            let err = session.execute(sql, &[], true).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::NonTransient, "{sql:?}");
            assert_eq!(err.message(), "Empty statement", "{sql:?}");
        }
        assert!(!session.in_transaction());
    }

    #[test]
    fn test_trailing_comment_is_ignored() {
        let mut session = open(std::path::Path::new(":memory:"));
        let rows = session.execute("SELECT 1 AS one; -- done", &[], true).unwrap().unwrap();
        assert_eq!(rows[0]["one"], json!(1));
    }

    #[test]
    fn test_batch_rejects_multiple_statements() {
        let mut session = open(std::path::Path::new(":memory:"));
        session.execute("CREATE TABLE t (id INTEGER)", &[], false).unwrap();
        let err = session
            .execute_batch("INSERT INTO t VALUES (?1); DELETE FROM t", &[vec![json!(1)]])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NonTransient);

        let err = session.execute_batch("  ", &[vec![json!(1)]]).unwrap_err();
        assert_eq!(err.message(), "Empty statement");
    }

    #[test]
    fn test_missing_parent_directory_is_non_transient() {
        let err = SqliteDriver::new()
            .connect(&ConnectionParams::sqlite("/nonexistent/rebound/dir/app.db"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NonTransient);
        assert!(err.code().is_some());
    }

    #[test]
    fn test_parent_exists() {
        assert!(parent_exists(":memory:"));
        assert!(parent_exists("file:app.db?mode=memory"));
        assert!(parent_exists("relative.db"));
        assert!(parent_exists(&std::env::temp_dir().join("x.db").to_string_lossy()));
        assert!(!parent_exists("/nonexistent/rebound/dir/app.db"));
    }

    #[test]
    fn test_result_code_classification() {
        assert_eq!(kind_for_code(ErrorCode::DatabaseBusy), ErrorKind::Transient);
        assert_eq!(kind_for_code(ErrorCode::DatabaseLocked), ErrorKind::Transient);
        assert_eq!(kind_for_code(ErrorCode::SystemIoFailure), ErrorKind::Transient);
        assert_eq!(kind_for_code(ErrorCode::ConstraintViolation), ErrorKind::NonTransient);
        assert_eq!(kind_for_code(ErrorCode::PermissionDenied), ErrorKind::NonTransient);
        assert_eq!(kind_for_code(ErrorCode::ReadOnly), ErrorKind::NonTransient);
    }
}
