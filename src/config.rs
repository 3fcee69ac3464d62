//! Configuration module for store-probe.
//!
//! Process options (log level, probe interval) come from the command line
//! or their environment variables. Store settings come only from the
//! environment and are validated once at startup into a [`Mode`].

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// Selects the run mode
pub const MODE_VAR: &str = "DB_TYPE";

/// Re-read on every relational iteration, so it is not part of [`Settings`]
pub const PG_WRITE_VAR: &str = "PG_WRITE";

/// Command-line arguments for the prober
#[derive(Parser, Debug)]
#[command(name = "store-probe")]
#[command(version = "0.1.0")]
#[command(about = "Periodically probes a PostgreSQL or Redis backing store", long_about = None)]
pub struct CliArgs {
    /// Seconds to sleep between probe iterations
    #[arg(long, env = "PROBE_INTERVAL_SECS", default_value_t = 10)]
    pub interval_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "PROBE_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

/// TLS behavior for the PostgreSQL connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlsMode {
    /// Encrypted, server certificate not checked against a CA
    Require,
    /// Encrypted, server certificate must chain to this root
    VerifyCa(PathBuf),
}

impl TlsMode {
    /// libpq name of the mode
    pub fn as_str(&self) -> &'static str {
        match self {
            TlsMode::Require => "require",
            TlsMode::VerifyCa(_) => "verify-ca",
        }
    }

    pub fn root_cert(&self) -> Option<&PathBuf> {
        match self {
            TlsMode::Require => None,
            TlsMode::VerifyCa(path) => Some(path),
        }
    }
}

/// Validated PostgreSQL settings
#[derive(Debug, Clone)]
pub struct PgConfig {
    pub user: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub tls: TlsMode,
}

impl PgConfig {
    /// Connection URL with the password masked, for logging
    pub fn redacted_url(&self) -> String {
        let mut url = format!(
            "postgres://{}:***@{}:{}/{}?sslmode={}",
            self.user,
            self.host,
            self.port,
            self.dbname,
            self.tls.as_str()
        );
        if let Some(cert) = self.tls.root_cert() {
            url.push_str(&format!("&sslrootcert={}", cert.display()));
        }
        url
    }
}

/// Redis settings. Nothing here is validated; see [`Settings::from_lookup`].
#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub username: Option<String>,
    pub password: Option<String>,
    pub host: String,
    pub port: String,
    /// Attempts per command for transient failures
    pub max_retries: u32,
    /// Connections kept by the client
    pub pool_size: usize,
    /// Name registered with `CLIENT SETNAME` after each connect
    pub client_name: String,
}

impl RedisConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// The two run modes, each with its own configuration
#[derive(Debug, Clone)]
pub enum Mode {
    Postgres(PgConfig),
    Redis(RedisConfig),
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Settings {
    pub mode: Mode,
    pub interval: Duration,
    pub log_level: String,
}

impl Settings {
    /// Build settings from the process environment.
    pub fn from_env(cli: CliArgs) -> Result<Self, ConfigError> {
        Self::from_lookup(cli, |name| std::env::var(name).ok())
    }

    /// Build settings from an arbitrary variable lookup.
    /// Empty values count as unset.
    pub fn from_lookup<F>(cli: CliArgs, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.is_empty());

        let mode = match get(MODE_VAR).as_deref() {
            None => return Err(ConfigError::MissingMode),
            Some("pg") => Mode::Postgres(pg_config(&get)?),
            Some("redis") => Mode::Redis(redis_config(&get)),
            Some(other) => return Err(ConfigError::UnknownMode(other.to_string())),
        };

        Ok(Settings {
            mode,
            interval: Duration::from_secs(cli.interval_secs),
            log_level: cli.log_level,
        })
    }
}

fn pg_config<F>(get: &F) -> Result<PgConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let require = |name: &'static str| get(name).ok_or(ConfigError::Missing(name));

    let user = require("PG_USER")?;
    let password = require("PG_PASSWORD")?;
    let host = require("PG_HOST")?;
    let port = require("PG_PORT")?;
    let dbname = require("PG_DBNAME")?;

    let port = port
        .parse::<u16>()
        .map_err(|_| ConfigError::InvalidPort("PG_PORT", port))?;

    let tls = match get("PG_SSL_CA_CERT") {
        Some(path) => TlsMode::VerifyCa(PathBuf::from(path)),
        None => TlsMode::Require,
    };

    Ok(PgConfig {
        user,
        password,
        host,
        port,
        dbname,
        tls,
    })
}

fn redis_config<F>(get: &F) -> RedisConfig
where
    F: Fn(&str) -> Option<String>,
{
    RedisConfig {
        username: get("REDIS_USER"),
        password: get("REDIS_PASSWORD"),
        host: get("REDIS_HOST").unwrap_or_default(),
        port: get("REDIS_PORT").unwrap_or_default(),
        max_retries: 10,
        pool_size: 3,
        client_name: "testclient".to_string(),
    }
}

/// Read the relational write toggle from the environment.
pub fn write_enabled() -> bool {
    std::env::var(PG_WRITE_VAR)
        .ok()
        .and_then(|v| parse_bool(&v))
        .unwrap_or(false)
}

/// Boolean parsing with the spellings operators already use for `PG_WRITE`.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}

/// Configuration errors. All of them end the process with status 1.
#[derive(Debug, PartialEq, Eq)]
pub enum ConfigError {
    MissingMode,
    UnknownMode(String),
    Missing(&'static str),
    InvalidPort(&'static str, String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::MissingMode => write!(f, "{} is not set", MODE_VAR),
            ConfigError::UnknownMode(mode) => {
                write!(f, "{} '{}' is not supported (expected 'pg' or 'redis')", MODE_VAR, mode)
            }
            ConfigError::Missing(name) => write!(f, "{} is not set", name),
            ConfigError::InvalidPort(name, value) => {
                write!(f, "{} '{}' is not a valid port", name, value)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
