//! Rebound CLI Entry Point
//!
//! Subcommands:
//! - `exec` - run one statement through the retrying client
//! - `batch` - run one statement over a list of parameter tuples
//! - `shell` - read statements from stdin and run each one
//! - `profile` - list or save connection profiles
//!
//! All output to stdout is JSON-only, one envelope per result. Logs go to
//! stderr or `--log-file`.

use std::io::{self, BufRead, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;

#[cfg(feature = "postgres")]
use rebound::engine::postgres::PostgresDriver;
#[cfg(feature = "sqlite")]
use rebound::engine::sqlite::SqliteDriver;

use rebound::config::{self, ConfigLocation, Overrides, ResolvedSettings, RetrySettings, StoredProfile};
use rebound::logging;
use rebound::output::{BatchResult, StatementResult};
use rebound::{
    BindValue, Client, ClientError, DatabaseType, Driver, ErrorEnvelope, Metadata, SuccessEnvelope,
};

/// Rebound - resilient database client
#[derive(Parser)]
#[command(name = "rebound")]
#[command(about = "Run SQL through a connection that retries, reconnects and resubmits on transient failures")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    connection: ConnectionArgs,

    /// Append logs to this file instead of stderr
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// Debug-level logging (overridden by RUST_LOG)
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct ConnectionArgs {
    /// Database engine (postgres, sqlite)
    #[arg(long)]
    engine: Option<DatabaseType>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    /// Database name, or file path for SQLite
    #[arg(long)]
    database: Option<String>,

    #[arg(long)]
    user: Option<String>,

    #[arg(long, env = "REBOUND_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Named connection profile (defaults to the configured default)
    #[arg(long)]
    profile: Option<String>,

    /// Attempts per operation, including the first
    #[arg(long)]
    max_retries: Option<u32>,

    /// Backoff before the first retry, in seconds
    #[arg(long, value_name = "SECS")]
    initial_delay: Option<f64>,

    /// Backoff cap, in seconds
    #[arg(long, value_name = "SECS")]
    max_delay: Option<f64>,

    #[arg(long)]
    exponential_base: Option<f64>,
}

impl ConnectionArgs {
    fn retry_settings(&self) -> RetrySettings {
        RetrySettings {
            max_retries: self.max_retries,
            initial_delay_secs: self.initial_delay,
            max_delay_secs: self.max_delay,
            exponential_base: self.exponential_base,
        }
    }

    fn overrides(&self) -> Overrides {
        Overrides {
            engine: self.engine,
            host: self.host.clone(),
            port: self.port,
            user: self.user.clone(),
            password: self.password.clone(),
            database: self.database.clone(),
            retry: self.retry_settings(),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Execute one statement and commit
    Exec {
        sql: String,

        /// Bind parameter as JSON; non-JSON text binds as a string. Repeatable.
        #[arg(long = "param", value_name = "JSON")]
        params: Vec<String>,

        /// Do not fetch result rows
        #[arg(long)]
        no_fetch: bool,
    },

    /// Execute one statement per parameter tuple and commit once
    Batch {
        sql: String,

        /// Parameter tuples as a JSON array of arrays
        #[arg(long, value_name = "JSON", required_unless_present = "params_file", conflicts_with = "params_file")]
        params: Option<String>,

        /// File holding the parameter tuples
        #[arg(long, value_name = "PATH")]
        params_file: Option<PathBuf>,
    },

    /// Read statements from stdin (ending in `;` or a blank line) and run each
    Shell,

    /// Manage connection profiles
    Profile {
        #[command(subcommand)]
        action: ProfileAction,
    },
}

impl Commands {
    const fn name(&self) -> &'static str {
        match self {
            Self::Exec { .. } => "exec",
            Self::Batch { .. } => "batch",
            Self::Shell => "shell",
            Self::Profile { .. } => "profile",
        }
    }
}

#[derive(Subcommand)]
enum ProfileAction {
    /// List profiles from the local and global config files
    List,

    /// Save the connection and retry flags as a profile
    Save {
        name: String,

        /// Write to the per-user config instead of `.rebound/config.json`
        #[arg(long)]
        global: bool,

        /// Make this the default profile
        #[arg(long)]
        default: bool,

        /// Read the password from this environment variable at connect time
        #[arg(long, value_name = "VAR")]
        password_env: Option<String>,

        /// Store the --password value in the file in clear text
        #[arg(long)]
        store_password: bool,
    },
}

#[derive(Serialize)]
struct SavedProfile {
    name: String,
    path: String,
    default: bool,
}

fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    if let Err(err) = logging::init_logging(cli.log_file.as_deref(), cli.verbose) {
        logging::init_logging_stderr(cli.verbose);
        tracing::warn!("{err}; logging to stderr");
    }

    let ok = match &cli.command {
        Commands::Profile { action } => run_profile(action, &cli.connection)?,
        command => run_database_command(&cli.connection, command)?,
    };

    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

/// Print one value as a JSON line on stdout
fn emit<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer(&mut stdout, value).context("Could not serialize output")?;
    writeln!(stdout).context("Could not write to stdout")?;
    stdout.flush().context("Could not write to stdout")
}

/// Print the envelope for `result`; returns whether it was a success
fn finish<T: Serialize>(
    engine: &str,
    command: &str,
    result: rebound::Result<SuccessEnvelope<T>>,
) -> anyhow::Result<bool> {
    match result {
        Ok(envelope) => {
            emit(&envelope)?;
            Ok(true)
        }
        Err(err) => {
            emit(&ErrorEnvelope::from_error(engine, command, &err))?;
            Ok(false)
        }
    }
}

fn fail(engine: &str, command: &str, err: ClientError) -> anyhow::Result<bool> {
    finish::<()>(engine, command, Err(err))
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn resolve_connection(conn: &ConnectionArgs) -> rebound::Result<ResolvedSettings> {
    let registry = config::load_with_precedence()?;
    let profile = registry.resolve(conn.profile.as_deref())?;
    if let Some((name, _)) = profile {
        tracing::debug!(profile = name, "Using connection profile");
    }
    config::resolve_settings(profile.map(|(_, p)| p), conn.overrides())
}

/// Ask for a missing `PostgreSQL` password when someone is at the terminal
fn prompt_password(settings: &mut ResolvedSettings) -> anyhow::Result<()> {
    if settings.engine != DatabaseType::Postgres
        || !settings.params.password.is_empty()
        || !io::stdin().is_terminal()
    {
        return Ok(());
    }

    let prompt = format!("Password for {}@{}", settings.params.user, settings.params.host);
    settings.params.password = dialoguer::Password::new()
        .with_prompt(prompt)
        .allow_empty_password(true)
        .interact()
        .context("Could not read password")?;
    Ok(())
}

fn run_database_command(conn: &ConnectionArgs, command: &Commands) -> anyhow::Result<bool> {
    let name = command.name();
    let mut settings = match resolve_connection(conn) {
        Ok(settings) => settings,
        Err(err) => return fail("", name, err),
    };
    prompt_password(&mut settings)?;

    let engine = settings.engine.as_str();
    match settings.engine {
        #[cfg(feature = "postgres")]
        DatabaseType::Postgres => match PostgresDriver::new() {
            Ok(driver) => run_with(driver, settings, command),
            Err(source) => {
                fail(engine, name, ClientError::Failed { operation: rebound::Operation::Connect, source })
            }
        },
        #[cfg(feature = "sqlite")]
        DatabaseType::SQLite => run_with(SqliteDriver::default(), settings, command),
        #[allow(unreachable_patterns)]
        _ => fail(
            engine,
            name,
            ClientError::invalid_input(format!("rebound was built without {engine} support")),
        ),
    }
}

fn run_with<D: Driver>(
    driver: D,
    settings: ResolvedSettings,
    command: &Commands,
) -> anyhow::Result<bool> {
    let engine = settings.engine.as_str();
    let name = command.name();

    let mut client = match Client::new(driver, settings.params, settings.retry) {
        Ok(client) => client,
        Err(err) => return fail(engine, name, err),
    };
    let mut guard = match client.acquire() {
        Ok(guard) => guard,
        Err(err) => return fail(engine, name, err),
    };

    match command {
        Commands::Exec { sql, params, no_fetch } => {
            let values = parse_bind_values(params);
            let result = run_statement(&mut guard, engine, name, sql, &values, !*no_fetch);
            finish(engine, name, result)
        }
        Commands::Batch { sql, params, params_file } => {
            let result = load_param_list(params.as_deref(), params_file.as_deref())
                .and_then(|param_list| run_batch(&mut guard, engine, sql, &param_list));
            finish(engine, name, result)
        }
        Commands::Shell => run_shell(&mut guard, engine),
        Commands::Profile { .. } => bail!("profile commands do not open a connection"),
    }
}

/// JSON values bind as-is; anything that does not parse binds as a string
fn parse_bind_values(raw: &[String]) -> Vec<BindValue> {
    raw.iter()
        .map(|value| {
            serde_json::from_str(value).unwrap_or_else(|_| BindValue::String(value.clone()))
        })
        .collect()
}

fn load_param_list(inline: Option<&str>, file: Option<&Path>) -> rebound::Result<Vec<Vec<BindValue>>> {
    let contents = match (inline, file) {
        (Some(json), _) => json.to_string(),
        (None, Some(path)) => std::fs::read_to_string(path).map_err(|e| {
            ClientError::invalid_input(format!("Could not read {}: {e}", path.display()))
        })?,
        (None, None) => return Err(ClientError::invalid_input("Pass --params or --params-file")),
    };

    serde_json::from_str(&contents).map_err(|e| {
        ClientError::invalid_input(format!("Batch parameters must be a JSON array of arrays: {e}"))
    })
}

fn run_statement<D: Driver>(
    client: &mut Client<D>,
    engine: &str,
    command: &str,
    sql: &str,
    values: &[BindValue],
    fetch: bool,
) -> rebound::Result<SuccessEnvelope<StatementResult>> {
    let start = Instant::now();
    let rows = client.execute(sql, values, fetch)?;
    let elapsed = elapsed_ms(start);

    let meta = match &rows {
        Some(rows) => Metadata::with_rows(elapsed, rows.len()),
        None => Metadata::new(elapsed),
    };
    Ok(SuccessEnvelope::new(engine, command, StatementResult { rows }, meta))
}

fn run_batch<D: Driver>(
    client: &mut Client<D>,
    engine: &str,
    sql: &str,
    param_list: &[Vec<BindValue>],
) -> rebound::Result<SuccessEnvelope<BatchResult>> {
    let start = Instant::now();
    client.execute_batch(sql, param_list)?;
    let meta = Metadata::new(elapsed_ms(start));
    Ok(SuccessEnvelope::new(engine, "batch", BatchResult { tuples: param_list.len() }, meta))
}

/// Statement loop over stdin. A failed statement prints its error envelope
/// and the loop moves on; a lost connection is reopened before the next one.
fn run_shell<D: Driver>(client: &mut Client<D>, engine: &str) -> anyhow::Result<bool> {
    let stdin = io::stdin();
    let interactive = stdin.is_terminal();
    let mut all_ok = true;
    let mut buffer = String::new();

    let mut run = |client: &mut Client<D>, statement: &str| -> anyhow::Result<()> {
        if !client.is_open() {
            if let Err(err) = client.connect() {
                all_ok = false;
                return fail(engine, "shell", err).map(drop);
            }
        }
        let result = run_statement(client, engine, "shell", statement, &[], true);
        all_ok &= finish(engine, "shell", result)?;
        Ok(())
    };

    if interactive {
        eprint!("rebound> ");
    }
    for line in stdin.lock().lines() {
        let line = line.context("Could not read from stdin")?;
        let trimmed = line.trim();

        if buffer.is_empty() && matches!(trimmed, "\\q" | "exit" | "quit") {
            break;
        }

        if !trimmed.is_empty() {
            buffer.push_str(&line);
            buffer.push('\n');
        }
        if !buffer.is_empty() && (trimmed.is_empty() || trimmed.ends_with(';')) {
            run(client, buffer.trim())?;
            buffer.clear();
        }

        if interactive {
            eprint!("{}", if buffer.is_empty() { "rebound> " } else { "     ...> " });
        }
    }

    if !buffer.trim().is_empty() {
        run(client, buffer.trim())?;
    }

    Ok(all_ok)
}

fn run_profile(action: &ProfileAction, conn: &ConnectionArgs) -> anyhow::Result<bool> {
    let start = Instant::now();
    match action {
        ProfileAction::List => {
            let result = config::list_profiles().map(|profiles| {
                SuccessEnvelope::new("", "profile", profiles, Metadata::new(elapsed_ms(start)))
            });
            finish("", "profile", result)
        }
        ProfileAction::Save { name, global, default, password_env, store_password } => {
            let location = if *global { ConfigLocation::Global } else { ConfigLocation::Local };
            let result = build_profile(conn, password_env.clone(), *store_password).and_then(|profile| {
                let engine = profile.engine;
                let path = config::save_profile(name, profile, location, *default)?;
                tracing::info!(profile = %name, path = %path.display(), "Saved connection profile");
                Ok(SuccessEnvelope::new(
                    engine.as_str(),
                    "profile",
                    SavedProfile { name: name.clone(), path: path.display().to_string(), default: *default },
                    Metadata::new(elapsed_ms(start)),
                ))
            });
            finish("", "profile", result)
        }
    }
}

fn build_profile(
    conn: &ConnectionArgs,
    password_env: Option<String>,
    store_password: bool,
) -> rebound::Result<StoredProfile> {
    let engine = conn
        .engine
        .ok_or_else(|| ClientError::invalid_input("--engine is required to save a profile"))?;
    let database = conn
        .database
        .clone()
        .ok_or_else(|| ClientError::invalid_input("--database is required to save a profile"))?;

    let password = match (store_password, &conn.password) {
        (true, Some(password)) => Some(password.clone()),
        (true, None) => {
            return Err(ClientError::invalid_input("--store-password needs --password"));
        }
        (false, _) => None,
    };

    Ok(StoredProfile {
        engine,
        host: conn.host.clone(),
        port: conn.port,
        user: conn.user.clone(),
        password,
        password_env,
        database,
        retry: conn.retry_settings(),
    })
}
