//! Environment-driven configuration.
//!
//! DESIGN
//! ======
//! Every knob is an environment variable with a default; a `.env` file is
//! honored when present. Unparseable values fall back to the default rather
//! than aborting startup. Only `DATABASE_URL` is mandatory.

use std::time::Duration;

pub(crate) const DEFAULT_PORT: u16 = 3000;
pub(crate) const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;
pub(crate) const DEFAULT_SAVE_DEBOUNCE_MS: u64 = 1000;
pub(crate) const DEFAULT_CLIENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} required")]
    Missing(&'static str),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    /// Upper bound on pooled Postgres connections.
    pub db_max_connections: u32,
    /// Quiet period a document must see before its pending content is stored.
    pub save_debounce: Duration,
    /// Outbound event queue depth per socket.
    pub client_channel_capacity: usize,
}

impl Config {
    /// Load configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Missing` if `DATABASE_URL` is unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("DATABASE_URL").map_err(|_| ConfigError::Missing("DATABASE_URL"))?;

        Ok(Self {
            database_url,
            port: env_parse("PORT", DEFAULT_PORT),
            db_max_connections: env_parse("DB_MAX_CONNECTIONS", DEFAULT_DB_MAX_CONNECTIONS),
            save_debounce: Duration::from_millis(env_parse("SAVE_DEBOUNCE_MS", DEFAULT_SAVE_DEBOUNCE_MS)),
            client_channel_capacity: env_parse("CLIENT_CHANNEL_CAPACITY", DEFAULT_CLIENT_CHANNEL_CAPACITY).max(1),
        })
    }
}

pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}
