//! Engine configuration, read from the environment once at startup.

use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("DATABASE_URL must be set")]
    MissingDatabaseUrl,
    #[error("{name} is not a valid value: {value}")]
    InvalidValue { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database_url: String,
    /// Connection cap for the shared Postgres pool.
    pub pool_size: u32,
    /// How often in-memory state is mirrored to durable storage.
    pub snapshot_interval: Duration,
    /// Poll interval for the durable stream consumers.
    pub stream_poll: Duration,
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url =
            env::var("DATABASE_URL").map_err(|_| ConfigError::MissingDatabaseUrl)?;

        let pool_size = parse_var("DATABASE_POOL_SIZE", 5u32)?;
        let snapshot_secs = parse_var("SNAPSHOT_INTERVAL_SECS", 10u64)?;
        let poll_ms = parse_var("STREAM_POLL_MS", 250u64)?;

        Ok(Self {
            database_url,
            pool_size,
            snapshot_interval: Duration::from_secs(snapshot_secs),
            stream_poll: Duration::from_millis(poll_ms),
        })
    }
}

fn parse_var<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(value) => value
            .parse()
            .map_err(|_| ConfigError::InvalidValue { name, value }),
        Err(_) => Ok(default),
    }
}
