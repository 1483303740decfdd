//! Connection Profiles
//!
//! Named connection profiles so the CLI does not need every connection and
//! retry flag on every invocation.
//!
//! # Configuration Locations
//! - Local: `.rebound/config.json` (per-project, team-shareable)
//! - Global: `<config_dir>/rebound/profiles.json` (per-user)
//!
//! # Resolution Precedence
//! 1. Explicit CLI flags (highest priority)
//! 2. Local config file
//! 3. Global config file
//!
//! Passwords can be kept out of the files with `password_env`, which names an
//! environment variable read at resolve time.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::engine::{ConnectionParams, DatabaseType, DEFAULT_PORT};
use crate::error::{ClientError, Result};
use crate::retry::RetryConfig;

/// Retry overrides. Unset fields keep the value they are applied over.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_delay_secs: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay_secs: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exponential_base: Option<f64>,
}

impl RetrySettings {
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.max_retries.is_none()
            && self.initial_delay_secs.is_none()
            && self.max_delay_secs.is_none()
            && self.exponential_base.is_none()
    }

    /// Field-wise merge; values set in `overrides` win
    #[must_use]
    pub fn merged_with(&self, overrides: &Self) -> Self {
        Self {
            max_retries: overrides.max_retries.or(self.max_retries),
            initial_delay_secs: overrides.initial_delay_secs.or(self.initial_delay_secs),
            max_delay_secs: overrides.max_delay_secs.or(self.max_delay_secs),
            exponential_base: overrides.exponential_base.or(self.exponential_base),
        }
    }

    /// Apply the set fields over `base`
    ///
    /// Only converts units; range checks happen when the policy is built.
    pub fn apply(&self, base: RetryConfig) -> Result<RetryConfig> {
        Ok(RetryConfig {
            max_retries: self.max_retries.unwrap_or(base.max_retries),
            initial_delay: match self.initial_delay_secs {
                Some(secs) => secs_to_duration("initial_delay", secs)?,
                None => base.initial_delay,
            },
            max_delay: match self.max_delay_secs {
                Some(secs) => secs_to_duration("max_delay", secs)?,
                None => base.max_delay,
            },
            exponential_base: self.exponential_base.unwrap_or(base.exponential_base),
        })
    }
}

fn secs_to_duration(field: &str, secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs).map_err(|_| {
        ClientError::invalid_input(format!("{field} must be a non-negative number of seconds, got {secs}"))
    })
}

/// A connection profile as stored in a config file
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredProfile {
    pub engine: DatabaseType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// Stored in clear text; prefer `password_env`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Environment variable holding the password
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_env: Option<String>,

    /// Database name, or file path for `SQLite`
    pub database: String,

    #[serde(default, skip_serializing_if = "RetrySettings::is_empty")]
    pub retry: RetrySettings,
}

impl StoredProfile {
    /// Password from `password_env` if set, otherwise the stored one
    pub fn resolve_password(&self) -> Result<Option<String>> {
        if let Some(env_var) = &self.password_env {
            return std::env::var(env_var).map(Some).map_err(|_| {
                ClientError::config_error(format!("Environment variable {env_var} not found for password"))
            });
        }
        Ok(self.password.clone())
    }
}

impl fmt::Debug for StoredProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredProfile")
            .field("engine", &self.engine)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("password_env", &self.password_env)
            .field("database", &self.database)
            .field("retry", &self.retry)
            .finish()
    }
}

/// Profile registry (the contents of one config file)
///
/// ```json
/// {
///   "profiles": {
///     "local": { "engine": "sqlite", "database": "./app.db" },
///     "staging": { "engine": "postgres", "host": "db.staging", "user": "svc",
///                  "password_env": "STAGING_PW", "database": "orders",
///                  "retry": { "max_retries": 5 } }
///   },
///   "default": "local"
/// }
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileRegistry {
    #[serde(default)]
    pub profiles: BTreeMap<String, StoredProfile>,

    /// Name of the default profile (must exist in `profiles`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

impl ProfileRegistry {
    /// Overlay `local` on `self`: local profiles replace same-named ones and a
    /// local default wins
    #[must_use]
    pub fn merged_with(mut self, local: Self) -> Self {
        self.profiles.extend(local.profiles);
        if local.default.is_some() {
            self.default = local.default;
        }
        self
    }

    /// Look up `name`, or the default profile when `name` is `None`.
    ///
    /// `Ok(None)` means no name was asked for and no default is set.
    pub fn resolve(&self, name: Option<&str>) -> Result<Option<(&str, &StoredProfile)>> {
        let Some(name) = name.or(self.default.as_deref()) else {
            return Ok(None);
        };

        self.profiles
            .get_key_value(name)
            .map(|(key, profile)| Some((key.as_str(), profile)))
            .ok_or_else(|| {
                let available: Vec<_> = self.profiles.keys().collect();
                ClientError::config_error(format!(
                    "Profile '{name}' not found. Available profiles: {available:?}"
                ))
            })
    }
}

/// Configuration file location
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigLocation {
    Local,
    Global,
}

/// Get path to local config file (`.rebound/config.json`)
pub fn local_config_path() -> Result<PathBuf> {
    let current_dir = std::env::current_dir().map_err(|e| {
        ClientError::config_error(format!("Could not determine current directory: {e}"))
    })?;

    Ok(current_dir.join(".rebound").join("config.json"))
}

/// Get path to global config file (`<config_dir>/rebound/profiles.json`)
pub fn global_config_path() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| ClientError::config_error("Could not determine user config directory"))?;

    Ok(config_dir.join("rebound").join("profiles.json"))
}

fn config_path(location: ConfigLocation) -> Result<PathBuf> {
    match location {
        ConfigLocation::Local => local_config_path(),
        ConfigLocation::Global => global_config_path(),
    }
}

/// Load a registry; a missing file is an empty registry
pub fn load_registry(path: &Path) -> Result<ProfileRegistry> {
    if !path.exists() {
        return Ok(ProfileRegistry::default());
    }

    let contents = fs::read_to_string(path)
        .map_err(|e| ClientError::config_error(format!("Could not read config file: {e}")))?;

    serde_json::from_str(&contents).map_err(|e| {
        ClientError::config_error(format!("Invalid config file format in {}: {e}", path.display()))
    })
}

/// Save a registry, creating the parent directory if needed
pub fn save_registry(path: &Path, registry: &ProfileRegistry) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            ClientError::config_error(format!("Could not create config directory: {e}"))
        })?;
    }

    let contents = serde_json::to_string_pretty(registry)
        .map_err(|e| ClientError::config_error(format!("Could not serialize config: {e}")))?;

    fs::write(path, contents)
        .map_err(|e| ClientError::config_error(format!("Could not write config file: {e}")))
}

/// Load the global registry with the local one overlaid
pub fn load_with_precedence() -> Result<ProfileRegistry> {
    let global = load_registry(&global_config_path()?)?;
    let local = load_registry(&local_config_path()?)?;
    Ok(global.merged_with(local))
}

/// Insert or replace a profile in the registry at `path`.
///
/// The first profile saved to a file becomes its default, as does any
/// profile saved with `make_default`.
pub fn save_profile_to(
    path: &Path,
    name: &str,
    profile: StoredProfile,
    make_default: bool,
) -> Result<()> {
    let mut registry = load_registry(path)?;
    let is_first = registry.profiles.is_empty();

    registry.profiles.insert(name.to_string(), profile);
    if is_first || make_default {
        registry.default = Some(name.to_string());
    }

    save_registry(path, &registry)
}

/// Insert or replace a profile at `location`, returning the file written
pub fn save_profile(
    name: &str,
    profile: StoredProfile,
    location: ConfigLocation,
    make_default: bool,
) -> Result<PathBuf> {
    let path = config_path(location)?;
    save_profile_to(&path, name, profile, make_default)?;
    Ok(path)
}

/// What `profile list` reports for each profile. Never carries a password.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProfileSummary {
    pub name: String,
    pub engine: DatabaseType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    pub database: String,
    pub is_default: bool,
}

/// Summaries of every profile in `registry`, sorted by name
#[must_use]
pub fn summarize(registry: &ProfileRegistry) -> Vec<ProfileSummary> {
    registry
        .profiles
        .iter()
        .map(|(name, profile)| ProfileSummary {
            name: name.clone(),
            engine: profile.engine,
            host: profile.host.clone(),
            port: profile.port,
            user: profile.user.clone(),
            database: profile.database.clone(),
            is_default: registry.default.as_deref() == Some(name.as_str()),
        })
        .collect()
}

/// List profiles from both config files
pub fn list_profiles() -> Result<Vec<ProfileSummary>> {
    Ok(summarize(&load_with_precedence()?))
}

/// Explicit connection values, typically from CLI flags
#[derive(Clone, Default)]
pub struct Overrides {
    pub engine: Option<DatabaseType>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub database: Option<String>,
    pub retry: RetrySettings,
}

/// Fully resolved connection settings
#[derive(Debug, Clone)]
pub struct ResolvedSettings {
    pub engine: DatabaseType,
    pub params: ConnectionParams,
    pub retry: RetryConfig,
}

/// Combine an optional profile with explicit overrides.
///
/// Overrides win field by field. A missing host defaults to `localhost` and a
/// missing port to 5432; engine and database must come from one side or the
/// other. An unresolved password is left empty.
pub fn resolve_settings(
    profile: Option<&StoredProfile>,
    overrides: Overrides,
) -> Result<ResolvedSettings> {
    let engine = overrides.engine.or(profile.map(|p| p.engine)).ok_or_else(|| {
        ClientError::invalid_input("No engine given: pass --engine or select a profile")
    })?;

    let database = overrides
        .database
        .or_else(|| profile.map(|p| p.database.clone()))
        .ok_or_else(|| {
            ClientError::invalid_input("No database given: pass --database or select a profile")
        })?;

    let password = match overrides.password {
        Some(password) => Some(password),
        None => match profile {
            Some(p) => p.resolve_password()?,
            None => None,
        },
    };

    let retry_settings = match profile {
        Some(p) => p.retry.merged_with(&overrides.retry),
        None => overrides.retry,
    };
    let retry = retry_settings.apply(RetryConfig::default())?;

    let params = match engine {
        DatabaseType::SQLite => ConnectionParams::sqlite(database),
        DatabaseType::Postgres => ConnectionParams::new(
            overrides
                .host
                .or_else(|| profile.and_then(|p| p.host.clone()))
                .unwrap_or_else(|| "localhost".to_string()),
            database,
            overrides.user.or_else(|| profile.and_then(|p| p.user.clone())).unwrap_or_default(),
            password.unwrap_or_default(),
            overrides.port.or(profile.and_then(|p| p.port)).unwrap_or(DEFAULT_PORT),
        ),
    };

    Ok(ResolvedSettings { engine, params, retry })
}
