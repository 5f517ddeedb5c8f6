//! Typed configuration from environment variables.
//!
//! Loads once at startup and fails fast on missing or malformed values.
//! The database URL is wrapped in `secrecy::SecretString` so it never
//! shows up in logs.

use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::engine::EngineConfig;
use crate::error::{Error, Result};

#[derive(Debug)]
pub struct Config {
    /// Postgres URL. `None` only when the in-memory broker is used.
    pub database_url: Option<SecretString>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    /// Port for the submission service.
    pub port: u16,
    /// Port for the observer relay.
    pub dashboard_port: u16,
    /// Origin allowed by CORS on the submission service.
    pub allowed_origin: String,
    pub stream: String,
    pub group: String,
    pub status_channel: String,
    pub dead_letter_stream: String,
    pub pool_size: usize,
    /// Retry budget for tasks created without one.
    pub max_retries: u32,
    pub visibility_timeout: Duration,
    pub reclaim_interval: Duration,
    pub max_deliveries: u32,
    pub handler_timeout: Option<Duration>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let config = Self::from_env_allow_memory()?;
        if config.database_url.is_none() {
            return Err(Error::Config(
                "required environment variable DATABASE_URL is not set".to_string(),
            ));
        }
        Ok(config)
    }

    /// Like [`Config::from_env`] but `DATABASE_URL` may be absent.
    pub fn from_env_allow_memory() -> Result<Self> {
        let stream = var_or("TASK_STREAM", "task_stream");
        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .ok()
                .map(|url| strip_quotes(&url).to_string())
                .filter(|url| !url.is_empty())
                .map(SecretString::from),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: var_or("LOG_LEVEL", "info"),
            port: parse_var("PORT", 8080)?,
            dashboard_port: parse_var("DASHBOARD_PORT", 8081)?,
            allowed_origin: var_or("ALLOWED_ORIGIN", "http://localhost:3000"),
            dead_letter_stream: var_or("DEAD_LETTER_STREAM", &format!("{stream}:dead")),
            stream,
            group: var_or("CONSUMER_GROUP", "worker_group"),
            status_channel: var_or("STATUS_CHANNEL", crate::broadcast::DEFAULT_CHANNEL),
            pool_size: parse_var("POOL_SIZE", 3)?,
            max_retries: parse_var("MAX_RETRIES", crate::model::DEFAULT_MAX_RETRIES)?,
            visibility_timeout: Duration::from_secs(parse_var("VISIBILITY_TIMEOUT_SECS", 60)?),
            reclaim_interval: Duration::from_secs(parse_var("RECLAIM_INTERVAL_SECS", 15)?),
            max_deliveries: parse_var("MAX_DELIVERIES", 5)?,
            handler_timeout: handler_timeout()?,
        })
    }

    /// Engine settings derived from this configuration.
    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            stream: self.stream.clone(),
            group: self.group.clone(),
            dead_letter_stream: self.dead_letter_stream.clone(),
            pool_size: self.pool_size,
            visibility_timeout: self.visibility_timeout,
            reclaim_interval: self.reclaim_interval,
            max_deliveries: self.max_deliveries,
            handler_timeout: self.handler_timeout,
            ..EngineConfig::default()
        }
    }
}

/// `HANDLER_TIMEOUT_SECS` unset means no limit; a zero limit would fail
/// every attempt, so it is refused.
fn handler_timeout() -> Result<Option<Duration>> {
    if std::env::var("HANDLER_TIMEOUT_SECS").is_err() {
        return Ok(None);
    }
    match parse_var::<u64>("HANDLER_TIMEOUT_SECS", 0)? {
        0 => Err(Error::Config(
            "HANDLER_TIMEOUT_SECS must be greater than 0 (unset it for no limit)".to_string(),
        )),
        secs => Ok(Some(Duration::from_secs(secs))),
    }
}

fn var_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("{name}={raw:?} is invalid: {e}"))),
        Err(_) => Ok(default),
    }
}

/// Hosting platforms sometimes wrap values in quotes.
fn strip_quotes(s: &str) -> &str {
    s.trim().trim_matches(|c| c == '"' || c == '\'')
}
