//! Server configuration parsed from environment variables.

use std::time::Duration;

use crate::hub::sweeper::{DEFAULT_CONN_IDLE_SECS, DEFAULT_ROOM_IDLE_SECS, DEFAULT_SWEEP_TICK_SECS, SweeperConfig};
use crate::services::auth::MIN_SECRET_LEN;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} required")]
    Missing(&'static str),
    #[error("JWT_SECRET too short (use 32+ chars)")]
    SecretTooShort,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    pub jwt_secret: String,
    pub db_max_connections: u32,
    pub sweeper: SweeperConfig,
}

impl Config {
    /// Build typed config from process environment variables.
    ///
    /// Required:
    /// - `DATABASE_URL`
    /// - `JWT_SECRET` (at least 32 chars)
    ///
    /// Optional:
    /// - `PORT`: default 3000
    /// - `DB_MAX_CONNECTIONS`: default 5
    /// - `WS_CONN_IDLE_SECS`: default 30
    /// - `WS_ROOM_IDLE_SECS`: default 600
    /// - `WS_SWEEP_TICK_SECS`: default 10
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` when a required variable is missing or invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env`, reading through `get`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` when a required variable is missing or invalid.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let database_url = get("DATABASE_URL")
            .filter(|v| !v.is_empty())
            .ok_or(ConfigError::Missing("DATABASE_URL"))?;
        let jwt_secret = get("JWT_SECRET")
            .filter(|v| !v.is_empty())
            .ok_or(ConfigError::Missing("JWT_SECRET"))?;
        if jwt_secret.len() < MIN_SECRET_LEN {
            return Err(ConfigError::SecretTooShort);
        }

        let sweeper = SweeperConfig {
            conn_idle_timeout: Duration::from_secs(env_parse(&get, "WS_CONN_IDLE_SECS", DEFAULT_CONN_IDLE_SECS)),
            room_idle_timeout: Duration::from_secs(env_parse(&get, "WS_ROOM_IDLE_SECS", DEFAULT_ROOM_IDLE_SECS)),
            tick: Duration::from_secs(env_parse(&get, "WS_SWEEP_TICK_SECS", DEFAULT_SWEEP_TICK_SECS).max(1)),
        };

        Ok(Self {
            database_url,
            port: env_parse(&get, "PORT", DEFAULT_PORT),
            jwt_secret,
            db_max_connections: env_parse(&get, "DB_MAX_CONNECTIONS", DEFAULT_DB_MAX_CONNECTIONS),
            sweeper,
        })
    }
}

/// Parse `key` through `get`, falling back to `default` when absent or
/// unparseable.
pub(crate) fn env_parse<T>(get: impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    get(key)
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
