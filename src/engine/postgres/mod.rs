//! `PostgreSQL` Database Driver Implementation
//!
//! This module implements the [`Driver`] and [`Session`] traits for `PostgreSQL`.
//!
//! # Features
//! - Client-server connections via TCP
//! - Lazily opened transactions (`BEGIN` before the first statement)
//! - Parameters bound by the prepared statement's declared types
//! - Rich type support in results (JSON/JSONB, timestamps, UUID, BYTEA)
//!
//! # Implementation Notes
//! - Uses `tokio-postgres` (async driver, requires tokio runtime)
//! - Async operations are wrapped in a synchronous interface: the driver
//!   owns a one-worker runtime that also drives the connection task, so a
//!   session must not be used from inside another tokio runtime
//! - BYTEA data is Base64-encoded for JSON safety
//! - SQLSTATE classes 08, 40, 53, 57, 58 and lock-not-available are
//!   transient, as are I/O failures and closed connections

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Runtime;
use tokio::task::JoinHandle;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::{FromSql, ToSql, Type};
use tokio_postgres::{Client, Config, NoTls, Statement};

use crate::engine::{
    unsupported_param, BindValue, ConnectionParams, DatabaseType, Driver, Row, Session,
};
use crate::error::{DriverError, DriverResult, ErrorKind};

/// Default time allowed for establishing a TCP connection
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long `close` waits for the connection task to finish
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

type PgParam = Box<dyn ToSql + Sync>;

/// `PostgreSQL` driver
#[derive(Debug, Clone)]
pub struct PostgresDriver {
    runtime: Arc<Runtime>,
    connect_timeout: Option<Duration>,
}

impl PostgresDriver {
    /// Start the driver's runtime
    pub fn new() -> DriverResult<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("rebound-postgres")
            .enable_all()
            .build()
            .map_err(|e| {
                DriverError::non_transient(format!("Failed to start PostgreSQL runtime: {e}"))
                    .with_source(e)
            })?;

        Ok(Self { runtime: Arc::new(runtime), connect_timeout: Some(DEFAULT_CONNECT_TIMEOUT) })
    }

    /// Override the TCP connect timeout (`None` waits as long as the OS does)
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl Driver for PostgresDriver {
    type Session = PostgresSession;

    fn engine(&self) -> DatabaseType {
        DatabaseType::Postgres
    }

    fn connect(&self, params: &ConnectionParams) -> DriverResult<PostgresSession> {
        let pg_config = build_pg_config(params, self.connect_timeout)?;

        let (client, connection) = self
            .runtime
            .block_on(pg_config.connect(NoTls))
            .map_err(|e| classify_pg_error(e, "Failed to connect to PostgreSQL"))?;

        let connection_task = self.runtime.spawn(async move {
            if let Err(e) = connection.await {
                tracing::debug!(error = %e, "PostgreSQL connection task ended with error");
            }
        });

        Ok(PostgresSession {
            runtime: Arc::clone(&self.runtime),
            client,
            connection_task,
            in_transaction: false,
        })
    }
}

/// An open `PostgreSQL` connection
pub struct PostgresSession {
    runtime: Arc<Runtime>,
    client: Client,
    connection_task: JoinHandle<()>,
    in_transaction: bool,
}

impl std::fmt::Debug for PostgresSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresSession")
            .field("in_transaction", &self.in_transaction)
            .field("closed", &self.client.is_closed())
            .finish_non_exhaustive()
    }
}

impl PostgresSession {
    fn begin(&mut self) -> DriverResult<()> {
        if !self.in_transaction {
            self.runtime
                .block_on(self.client.batch_execute("BEGIN"))
                .map_err(|e| classify_pg_error(e, "Failed to begin transaction"))?;
            self.in_transaction = true;
        }
        Ok(())
    }

    /// Whether a transaction is currently open
    #[must_use]
    pub const fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    fn finish_transaction(&mut self, command: &str, context: &str) -> DriverResult<()> {
        if !self.in_transaction {
            return Ok(());
        }
        // The server ends the transaction whichever way the command goes
        self.in_transaction = false;
        self.runtime
            .block_on(self.client.batch_execute(command))
            .map_err(|e| classify_pg_error(e, context))
    }
}

impl Session for PostgresSession {
    fn execute(
        &mut self,
        statement: &str,
        params: &[BindValue],
        fetch: bool,
    ) -> DriverResult<Option<Vec<Row>>> {
        self.begin()?;
        self.runtime.block_on(execute_query(&self.client, statement, params, fetch))
    }

    fn execute_batch(&mut self, statement: &str, param_list: &[Vec<BindValue>]) -> DriverResult<()> {
        if param_list.is_empty() {
            return Ok(());
        }
        self.begin()?;
        self.runtime.block_on(execute_batch_query(&self.client, statement, param_list))
    }

    fn commit(&mut self) -> DriverResult<()> {
        self.finish_transaction("COMMIT", "Failed to commit")
    }

    fn rollback(&mut self) -> DriverResult<()> {
        self.finish_transaction("ROLLBACK", "Failed to roll back")
    }

    fn close(self) -> DriverResult<()> {
        let Self { runtime, client, connection_task, .. } = self;

        // Dropping the client sends Terminate; the task then ends on its own
        drop(client);
        let abort = connection_task.abort_handle();
        let finished = runtime
            .block_on(async move { tokio::time::timeout(CLOSE_TIMEOUT, connection_task).await });
        if finished.is_err() {
            abort.abort();
        }
        Ok(())
    }
}

/// Prepare and run one statement, collecting rows when `fetch` is set
async fn execute_query(
    client: &Client,
    statement: &str,
    params: &[BindValue],
    fetch: bool,
) -> DriverResult<Option<Vec<Row>>> {
    let stmt = client
        .prepare(statement)
        .await
        .map_err(|e| classify_pg_error(e, "Failed to prepare query"))?;

    let bound = bind_params(&stmt, params)?;
    let refs: Vec<&(dyn ToSql + Sync)> = bound.iter().map(|p| p.as_ref()).collect();

    if fetch {
        let rows = client
            .query(&stmt, &refs)
            .await
            .map_err(|e| classify_pg_error(e, "Failed to execute query"))?;
        let mapped = rows.iter().map(row_to_json).collect::<DriverResult<Vec<_>>>()?;
        Ok(Some(mapped))
    } else {
        client
            .execute(&stmt, &refs)
            .await
            .map_err(|e| classify_pg_error(e, "Failed to execute query"))?;
        Ok(None)
    }
}

/// Prepare once, then run the statement for every parameter tuple
async fn execute_batch_query(
    client: &Client,
    statement: &str,
    param_list: &[Vec<BindValue>],
) -> DriverResult<()> {
    let stmt = client
        .prepare(statement)
        .await
        .map_err(|e| classify_pg_error(e, "Failed to prepare batch statement"))?;

    for params in param_list {
        let bound = bind_params(&stmt, params)?;
        let refs: Vec<&(dyn ToSql + Sync)> = bound.iter().map(|p| p.as_ref()).collect();
        client
            .execute(&stmt, &refs)
            .await
            .map_err(|e| classify_pg_error(e, "Failed to execute batch statement"))?;
    }

    Ok(())
}

/// Build `PostgreSQL` connection config from `ConnectionParams`
fn build_pg_config(params: &ConnectionParams, connect_timeout: Option<Duration>) -> DriverResult<Config> {
    if params.host.is_empty() {
        return Err(DriverError::non_transient("PostgreSQL requires 'host' parameter"));
    }
    if params.database.is_empty() {
        return Err(DriverError::non_transient("PostgreSQL requires 'database' parameter"));
    }
    if params.user.is_empty() {
        return Err(DriverError::non_transient("PostgreSQL requires 'user' parameter"));
    }

    let mut pg_config = Config::new();
    pg_config
        .host(&params.host)
        .port(params.port)
        .user(&params.user)
        .password(&params.password)
        .dbname(&params.database);

    if let Some(timeout) = connect_timeout {
        pg_config.connect_timeout(timeout);
    }

    Ok(pg_config)
}

/// Map a SQLSTATE code to a retry classification
#[must_use]
pub fn kind_for_sqlstate(code: &str) -> ErrorKind {
    if code == SqlState::LOCK_NOT_AVAILABLE.code() {
        return ErrorKind::Transient;
    }
    match code.get(..2) {
        // connection exception, transaction rollback, insufficient resources,
        // operator intervention, system error
        Some("08" | "40" | "53" | "57" | "58") => ErrorKind::Transient,
        _ => ErrorKind::NonTransient,
    }
}

fn classify_kind(err: &tokio_postgres::Error) -> ErrorKind {
    if let Some(state) = err.code() {
        return kind_for_sqlstate(state.code());
    }
    if err.is_closed() || has_io_source(err) {
        ErrorKind::Transient
    } else {
        ErrorKind::NonTransient
    }
}

fn has_io_source(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut source = err.source();
    while let Some(inner) = source {
        if inner.is::<std::io::Error>() {
            return true;
        }
        source = inner.source();
    }
    false
}

/// Classify a `tokio-postgres` error, keeping it as the source
fn classify_pg_error(err: tokio_postgres::Error, context: &str) -> DriverError {
    let kind = classify_kind(&err);
    let mut classified = DriverError::new(kind, format!("{context}: {err}"));
    if let Some(state) = err.code() {
        classified = classified.with_code(state.code());
    }
    classified.with_source(err)
}

/// Convert bind values using the types the server inferred for each placeholder
fn bind_params(stmt: &Statement, params: &[BindValue]) -> DriverResult<Vec<PgParam>> {
    let types = stmt.params();
    if types.len() != params.len() {
        return Err(DriverError::non_transient(format!(
            "Statement expects {} parameters, got {}",
            types.len(),
            params.len()
        )));
    }

    params
        .iter()
        .zip(types)
        .enumerate()
        .map(|(idx, (value, ty))| bind_param(idx, value, ty))
        .collect()
}

fn bind_param(idx: usize, value: &BindValue, ty: &Type) -> DriverResult<PgParam> {
    use base64::Engine;
    use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
    use serde_json::Value;

    match *ty {
        Type::BOOL => typed(idx, value, ty, Value::as_bool),
        Type::INT2 => typed(idx, value, ty, |v| v.as_i64().and_then(|n| i16::try_from(n).ok())),
        Type::INT4 => typed(idx, value, ty, |v| v.as_i64().and_then(|n| i32::try_from(n).ok())),
        Type::INT8 => typed(idx, value, ty, Value::as_i64),
        Type::FLOAT4 => typed(idx, value, ty, |v| v.as_f64().map(|f| f as f32)),
        Type::FLOAT8 => typed(idx, value, ty, Value::as_f64),
        Type::JSON | Type::JSONB => typed(idx, value, ty, |v| Some(v.clone())),
        Type::BYTEA => typed(idx, value, ty, |v| {
            v.as_str().and_then(|s| base64::engine::general_purpose::STANDARD.decode(s).ok())
        }),
        Type::UUID => typed(idx, value, ty, |v| v.as_str().and_then(|s| uuid::Uuid::parse_str(s).ok())),
        Type::TIMESTAMP => typed(idx, value, ty, |v| {
            v.as_str().and_then(|s| {
                NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                    .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"))
                    .ok()
            })
        }),
        Type::TIMESTAMPTZ => typed(idx, value, ty, |v| {
            v.as_str()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|d| d.with_timezone(&Utc))
        }),
        Type::DATE => typed(idx, value, ty, |v| {
            v.as_str().and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
        }),
        Type::TIME => typed(idx, value, ty, |v| {
            v.as_str().and_then(|s| NaiveTime::parse_from_str(s, "%H:%M:%S%.f").ok())
        }),
        // Text and anything else: send the text form and let the driver check the type
        _ => typed(idx, value, ty, |v| match v {
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }),
    }
}

fn typed<T, F>(idx: usize, value: &BindValue, ty: &Type, convert: F) -> DriverResult<PgParam>
where
    T: ToSql + Sync + 'static,
    F: FnOnce(&BindValue) -> Option<T>,
{
    if value.is_null() {
        return Ok(Box::new(None::<T>));
    }
    convert(value)
        .map(|v| Box::new(Some(v)) as PgParam)
        .ok_or_else(|| unsupported_param(idx, value, ty.name()))
}

/// Convert a `PostgreSQL` row to a column-ordered map
fn row_to_json(row: &tokio_postgres::Row) -> DriverResult<Row> {
    let mut map = Row::new();
    for (idx, column) in row.columns().iter().enumerate() {
        map.insert(column.name().to_string(), postgres_value_to_json(row, idx)?);
    }
    Ok(map)
}

fn get<'a, T: FromSql<'a>>(row: &'a tokio_postgres::Row, idx: usize) -> DriverResult<Option<T>> {
    row.try_get::<_, Option<T>>(idx).map_err(|e| {
        let name = row.columns()[idx].type_().name().to_string();
        DriverError::non_transient(format!("Failed to convert PostgreSQL type '{name}' to JSON: {e}"))
            .with_source(e)
    })
}

/// Convert `PostgreSQL` value to JSON value
fn postgres_value_to_json(row: &tokio_postgres::Row, idx: usize) -> DriverResult<serde_json::Value> {
    use serde_json::Value;

    let col_type = row.columns()[idx].type_();

    let value = match *col_type {
        Type::BOOL => get::<bool>(row, idx)?.map(Value::Bool),
        Type::INT2 => get::<i16>(row, idx)?.map(Value::from),
        Type::INT4 => get::<i32>(row, idx)?.map(Value::from),
        Type::INT8 => get::<i64>(row, idx)?.map(Value::from),
        Type::OID => get::<u32>(row, idx)?.map(Value::from),
        Type::FLOAT4 => get::<f32>(row, idx)?
            .map(|v| serde_json::Number::from_f64(f64::from(v)).map_or(Value::Null, Value::Number)),
        Type::FLOAT8 => {
            get::<f64>(row, idx)?.map(|v| serde_json::Number::from_f64(v).map_or(Value::Null, Value::Number))
        }
        Type::JSON | Type::JSONB => get::<Value>(row, idx)?,
        Type::BYTEA => get::<Vec<u8>>(row, idx)?.map(|v| {
            use base64::Engine;
            Value::String(base64::engine::general_purpose::STANDARD.encode(v))
        }),
        Type::TIMESTAMP => get::<chrono::NaiveDateTime>(row, idx)?
            .map(|v| Value::String(v.format("%Y-%m-%dT%H:%M:%S%.f").to_string())),
        Type::TIMESTAMPTZ => {
            get::<chrono::DateTime<chrono::Utc>>(row, idx)?.map(|v| Value::String(v.to_rfc3339()))
        }
        Type::DATE => {
            get::<chrono::NaiveDate>(row, idx)?.map(|v| Value::String(v.format("%Y-%m-%d").to_string()))
        }
        Type::TIME => {
            get::<chrono::NaiveTime>(row, idx)?.map(|v| Value::String(v.format("%H:%M:%S%.f").to_string()))
        }
        Type::UUID => get::<uuid::Uuid>(row, idx)?.map(|v| Value::String(v.to_string())),
        // Default: try to get as string
        _ => get::<String>(row, idx)?.map(Value::String),
    };

    Ok(value.unwrap_or(Value::Null))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::DEFAULT_PORT;
    use serde_json::json;

    fn local_params() -> ConnectionParams {
        ConnectionParams::new("localhost", "postgres", "postgres", "postgres", DEFAULT_PORT)
    }

    #[test]
    fn test_build_config_from_params() {
        let config = build_pg_config(&local_params(), Some(Duration::from_secs(3))).unwrap();
        assert_eq!(config.get_dbname(), Some("postgres"));
        assert_eq!(config.get_user(), Some("postgres"));
        assert_eq!(config.get_ports(), &[5432]);
        assert_eq!(config.get_connect_timeout(), Some(&Duration::from_secs(3)));
    }

    #[test]
    fn test_missing_host_is_non_transient() {
        let mut params = local_params();
        params.host.clear();
        let err = build_pg_config(&params, None).unwrap_err();
        assert!(!err.is_transient());
        assert!(err.message().contains("PostgreSQL requires 'host' parameter"));
    }

    #[test]
    fn test_missing_database_error() {
        let mut params = local_params();
        params.database.clear();
        let err = build_pg_config(&params, None).unwrap_err();
        assert!(err.message().contains("PostgreSQL requires 'database' parameter"));
    }

    #[test]
    fn test_sqlstate_classification() {
        // connection exceptions and operator intervention
        assert_eq!(kind_for_sqlstate("08006"), ErrorKind::Transient);
        assert_eq!(kind_for_sqlstate("08001"), ErrorKind::Transient);
        assert_eq!(kind_for_sqlstate("57P01"), ErrorKind::Transient);
        assert_eq!(kind_for_sqlstate("57P03"), ErrorKind::Transient);
        // serialization failure / deadlock
        assert_eq!(kind_for_sqlstate("40001"), ErrorKind::Transient);
        assert_eq!(kind_for_sqlstate("40P01"), ErrorKind::Transient);
        // too many connections
        assert_eq!(kind_for_sqlstate("53300"), ErrorKind::Transient);
        assert_eq!(kind_for_sqlstate("55P03"), ErrorKind::Transient);

        assert_eq!(kind_for_sqlstate("42601"), ErrorKind::NonTransient); // syntax error
        assert_eq!(kind_for_sqlstate("23505"), ErrorKind::NonTransient); // unique violation
        assert_eq!(kind_for_sqlstate("28P01"), ErrorKind::NonTransient); // bad password
        assert_eq!(kind_for_sqlstate("42501"), ErrorKind::NonTransient); // permission denied
        assert_eq!(kind_for_sqlstate("55000"), ErrorKind::NonTransient);
    }

    #[test]
    fn test_bind_param_accepts_matching_json() {
        assert!(bind_param(0, &json!(7), &Type::INT4).is_ok());
        assert!(bind_param(0, &json!(true), &Type::BOOL).is_ok());
        assert!(bind_param(0, &json!(2.5), &Type::FLOAT8).is_ok());
        assert!(bind_param(0, &json!({"a": 1}), &Type::JSONB).is_ok());
        assert!(bind_param(0, &json!("3q2+7w=="), &Type::BYTEA).is_ok());
        assert!(bind_param(0, &json!("2024-05-01"), &Type::DATE).is_ok());
        assert!(bind_param(0, &json!("2024-05-01T10:30:00Z"), &Type::TIMESTAMPTZ).is_ok());
        assert!(bind_param(0, &json!("text"), &Type::TEXT).is_ok());
        assert!(bind_param(0, &json!(null), &Type::INT8).is_ok());
    }

    #[test]
    fn test_bind_param_rejects_mismatched_json() {
        let err = bind_param(1, &json!("seven"), &Type::INT4).unwrap_err();
        assert!(!err.is_transient());
        assert!(err.message().contains("$2"));

        assert!(bind_param(0, &json!(70_000), &Type::INT2).is_err());
        assert!(bind_param(0, &json!("not-a-uuid"), &Type::UUID).is_err());
        assert!(bind_param(0, &json!("05/01/2024"), &Type::DATE).is_err());
    }

    fn live_session() -> PostgresSession {
        PostgresDriver::new().unwrap().connect(&local_params()).expect("running PostgreSQL")
    }

    #[test]
    #[ignore = "Requires running PostgreSQL instance"]
    fn test_select_one_shape() {
        let mut session = live_session();
        let rows = session.execute("SELECT 1", &[], true).unwrap().unwrap();
        assert_eq!(rows, vec![json!({"?column?": 1}).as_object().unwrap().clone()]);
        session.commit().unwrap();
        assert!(!session.in_transaction());
        session.close().unwrap();
    }

    #[test]
    #[ignore = "Requires running PostgreSQL instance"]
    fn test_typed_parameters_roundtrip_through_server() {
        let mut session = live_session();
        let rows = session
            .execute(
                "SELECT $1::int4 AS n, $2::text AS t, $3::jsonb AS j, $4::bool AS b",
                &[json!(5), json!("x"), json!({"k": [1, 2]}), json!(null)],
                true,
            )
            .unwrap()
            .unwrap();
        assert_eq!(rows[0]["n"], json!(5));
        assert_eq!(rows[0]["t"], json!("x"));
        assert_eq!(rows[0]["j"], json!({"k": [1, 2]}));
        assert_eq!(rows[0]["b"], json!(null));
        session.rollback().unwrap();
        session.close().unwrap();
    }

    #[test]
    #[ignore = "Requires running PostgreSQL instance"]
    fn test_syntax_error_classified_non_transient() {
        let mut session = live_session();
        let err = session.execute("SELEC 1", &[], true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NonTransient);
        assert_eq!(err.code(), Some("42601"));
        session.rollback().unwrap();
        session.close().unwrap();
    }

    #[test]
    #[ignore = "Requires running PostgreSQL instance"]
    fn test_admin_shutdown_classified_transient() {
        let mut victim = live_session();
        let pid = victim.execute("SELECT pg_backend_pid() AS pid", &[], true).unwrap().unwrap()[0]
            ["pid"]
            .clone();
        victim.commit().unwrap();

        let mut admin = live_session();
        admin.execute("SELECT pg_terminate_backend($1)", &[pid], false).unwrap();
        admin.commit().unwrap();

        let err = victim.execute("SELECT 1", &[], true).unwrap_err();
        assert!(err.is_transient(), "terminated backend should be transient: {err}");
        admin.close().unwrap();
    }

    #[test]
    fn test_unreachable_server_is_transient() {
        // Port 1 on localhost refuses connections on any sane host
        let params = ConnectionParams::new("127.0.0.1", "postgres", "postgres", "postgres", 1);
        let driver = PostgresDriver::new().unwrap().with_connect_timeout(Some(Duration::from_secs(2)));
        let err = driver.connect(&params).unwrap_err();
        assert!(err.is_transient(), "connection refused should be transient: {err}");
    }
}
