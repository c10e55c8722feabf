//! Typed configuration from environment variables.
//!
//! Loads once at startup and fails fast on malformed values. Sensitive
//! values are wrapped in `secrecy::SecretString` to keep them out of logs.

pub mod secrets;

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::event::DEFAULT_TOPIC;
use secrecy::SecretString;

#[derive(Debug)]
pub struct Config {
    /// Postgres URL. `None` runs against the in-memory store.
    pub database_url: Option<SecretString>,
    /// Directory of workflow TOML specs.
    pub workflows_dir: PathBuf,
    /// Scratch space for runner attempts.
    pub work_dir: PathBuf,
    /// Event log topic terminal events are appended to.
    pub event_topic: String,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    /// Upper bound on how long a dedup entry survives a crashed task.
    pub dedup_ttl: Duration,
    /// Minimum time terminal records are kept; entries expiring later
    /// extend it to their expiration date.
    pub retention: Duration,
    /// Live records untouched for this long are considered abandoned.
    pub stale_after: Duration,
    /// Default cap for `retry_failed`.
    pub max_retry_attempts: u32,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: optional_var("DATABASE_URL").map(SecretString::from),
            workflows_dir: PathBuf::from(
                optional_var("WORKFLOWS_DIR").unwrap_or_else(|| "workflows".to_string()),
            ),
            work_dir: PathBuf::from(
                optional_var("WORK_DIR").unwrap_or_else(|| "/tmp/portalflow".to_string()),
            ),
            event_topic: optional_var("EVENT_TOPIC").unwrap_or_else(|| DEFAULT_TOPIC.to_string()),
            otel_endpoint: optional_var("OTEL_ENDPOINT"),
            log_level: optional_var("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            dedup_ttl: Duration::from_secs(number_var("DEDUP_TTL_SECS", 2 * 60 * 60)?),
            retention: Duration::from_secs(number_var("RETENTION_SECS", 5 * 60)?),
            stale_after: Duration::from_secs(number_var("STALE_AFTER_SECS", 60 * 60)?),
            max_retry_attempts: number_var("MAX_RETRY_ATTEMPTS", 3)?,
        })
    }
}

/// Unset and empty are the same thing.
fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn number_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match optional_var(name) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| {
            Error::Config(format!("environment variable {name} must be a number, got {raw:?}"))
        }),
    }
}
