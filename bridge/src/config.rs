//! Configuration management for the bridge.

use parcel_engine::RetryPolicy;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Which backend commands are executed against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// A Parse-compatible REST server.
    Rest,
    /// The in-process backend, for local development.
    Memory,
}

/// Bridge configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Channel host address
    pub host: String,
    /// Channel port
    pub port: u16,
    /// SQLite URL of the durable log
    pub database_url: String,
    pub backend: BackendKind,
    /// Base URL of the REST API, e.g. `https://api.example.com/parse`
    pub server_url: Option<String>,
    pub application_id: Option<String>,
    pub client_key: Option<String>,
    /// When set, channel calls must carry `Authorization: Bearer <token>`
    pub channel_token: Option<String>,
    /// Budget for one network attempt
    pub request_timeout: Duration,
    /// Period of the background drain
    pub drain_interval: Duration,
    /// Maximum number of commands executing at once
    pub drain_parallelism: usize,
    pub retry: RetryPolicy,
    /// Reported on the installation object
    pub device_type: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            database_url: "sqlite://parcel.db".to_string(),
            backend: BackendKind::Memory,
            server_url: None,
            application_id: None,
            client_key: None,
            channel_token: None,
            request_timeout: Duration::from_millis(15_000),
            drain_interval: Duration::from_secs(30),
            drain_parallelism: 4,
            retry: RetryPolicy::default(),
            device_type: env::consts::OS.to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Config::default();

        let host = env::var("HOST").unwrap_or(defaults.host);
        let port = env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;
        let database_url = env::var("DATABASE_URL").unwrap_or(defaults.database_url);

        let backend = match env::var("PARCEL_BACKEND").as_deref() {
            Err(_) | Ok("rest") => BackendKind::Rest,
            Ok("memory") => BackendKind::Memory,
            Ok(other) => return Err(ConfigError::UnknownBackend(other.to_string())),
        };

        let server_url = env::var("PARSE_SERVER_URL").ok();
        let application_id = env::var("PARSE_APPLICATION_ID").ok();
        if backend == BackendKind::Rest {
            if server_url.is_none() {
                return Err(ConfigError::Missing("PARSE_SERVER_URL"));
            }
            if application_id.is_none() {
                return Err(ConfigError::Missing("PARSE_APPLICATION_ID"));
            }
        }

        let retry = RetryPolicy {
            initial_backoff_ms: parse_var("RETRY_INITIAL_BACKOFF_MS", defaults.retry.initial_backoff_ms)?,
            max_backoff_ms: parse_var("RETRY_MAX_BACKOFF_MS", defaults.retry.max_backoff_ms)?,
            max_attempts: match env::var("RETRY_MAX_ATTEMPTS") {
                Ok(value) => Some(parse_value("RETRY_MAX_ATTEMPTS", &value)?),
                Err(_) => None,
            },
        };

        Ok(Self {
            host,
            port,
            database_url,
            backend,
            server_url,
            application_id,
            client_key: env::var("PARSE_CLIENT_KEY").ok(),
            channel_token: env::var("CHANNEL_TOKEN").ok().filter(|t| !t.is_empty()),
            request_timeout: Duration::from_millis(parse_var("REQUEST_TIMEOUT_MS", 15_000u64)?),
            drain_interval: Duration::from_secs(parse_var("DRAIN_INTERVAL_SECS", 30u64)?),
            drain_parallelism: parse_var("DRAIN_PARALLELISM", defaults.drain_parallelism)?.max(1),
            retry,
            device_type: env::var("DEVICE_TYPE").unwrap_or(defaults.device_type),
        })
    }
}

fn parse_var<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(value) => parse_value(name, &value),
        Err(_) => Ok(default),
    }
}

fn parse_value<T: FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        name,
        value: value.to_string(),
    })
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} environment variable is required")]
    Missing(&'static str),

    #[error("Invalid PORT value")]
    InvalidPort,

    #[error("Invalid value for {name}: '{value}'")]
    Invalid { name: &'static str, value: String },

    #[error("Unknown PARCEL_BACKEND '{0}' (expected 'rest' or 'memory')")]
    UnknownBackend(String),
}
