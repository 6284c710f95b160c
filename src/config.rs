// src/config.rs
//! Service configuration, read from the environment (and `.env` if present)

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::broadcast::DEFAULT_TOPIC_BUFFER;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("{name} has an invalid value '{value}': {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    /// Absent means the in-memory store
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub stage_timeout: Duration,
    pub subscription_idle_timeout: Duration,
    pub topic_buffer_size: usize,
    pub pipeline_retention: chrono::Duration,
    pub cleanup_interval: Duration,
    /// Artificial delay per generated stage
    pub simulated_stage_latency: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            database_url: None,
            db_max_connections: 5,
            stage_timeout: Duration::from_secs(300),
            subscription_idle_timeout: Duration::from_secs(30),
            topic_buffer_size: DEFAULT_TOPIC_BUFFER,
            pipeline_retention: chrono::Duration::hours(24),
            cleanup_interval: Duration::from_secs(600),
            simulated_stage_latency: Duration::ZERO,
        }
    }
}

impl Config {
    /// Load `.env` (optional) and read the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source. Unset or blank variables
    /// fall back to defaults; malformed ones are rejected.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Self::default();

        let bind_addr = match get("BIND_ADDR") {
            Some(raw) => raw.parse().map_err(|e: std::net::AddrParseError| ConfigError::Invalid {
                name: "BIND_ADDR",
                value: raw.clone(),
                reason: e.to_string(),
            })?,
            None => defaults.bind_addr,
        };

        let retention_hours = parse_number("PIPELINE_RETENTION_HOURS", get("PIPELINE_RETENTION_HOURS"), 24i64)?;
        if retention_hours < 0 {
            return Err(ConfigError::Invalid {
                name: "PIPELINE_RETENTION_HOURS",
                value: retention_hours.to_string(),
                reason: "must not be negative".to_string(),
            });
        }

        Ok(Self {
            bind_addr,
            database_url: get("DATABASE_URL"),
            db_max_connections: positive("DB_MAX_CONNECTIONS", get("DB_MAX_CONNECTIONS"), defaults.db_max_connections)?,
            stage_timeout: Duration::from_secs(positive(
                "STAGE_TIMEOUT_SECS",
                get("STAGE_TIMEOUT_SECS"),
                defaults.stage_timeout.as_secs(),
            )?),
            subscription_idle_timeout: Duration::from_secs(positive(
                "SUBSCRIPTION_IDLE_TIMEOUT_SECS",
                get("SUBSCRIPTION_IDLE_TIMEOUT_SECS"),
                defaults.subscription_idle_timeout.as_secs(),
            )?),
            topic_buffer_size: positive("TOPIC_BUFFER_SIZE", get("TOPIC_BUFFER_SIZE"), defaults.topic_buffer_size)?,
            pipeline_retention: chrono::Duration::hours(retention_hours),
            cleanup_interval: Duration::from_secs(positive(
                "CLEANUP_INTERVAL_SECS",
                get("CLEANUP_INTERVAL_SECS"),
                defaults.cleanup_interval.as_secs(),
            )?),
            simulated_stage_latency: Duration::from_millis(parse_number(
                "SIMULATED_STAGE_LATENCY_MS",
                get("SIMULATED_STAGE_LATENCY_MS"),
                0u64,
            )?),
        })
    }
}

fn parse_number<T>(name: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        Some(raw) => raw.parse::<T>().map_err(|e| ConfigError::Invalid {
            name,
            reason: e.to_string(),
            value: raw,
        }),
        None => Ok(default),
    }
}

fn positive<T>(name: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr + PartialOrd + Default + ToString,
    T::Err: std::fmt::Display,
{
    let value = parse_number(name, raw, default)?;
    if value <= T::default() {
        return Err(ConfigError::Invalid {
            name,
            value: value.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}
