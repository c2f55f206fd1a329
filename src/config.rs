//! Configuration management for the FTP storage pool
//!
//! Pool configuration is immutable once captured: it is loaded at startup
//! from a TOML file with environment overrides and validated before any
//! connection is made.

use config::{Config, Environment, File};
use serde::Deserialize;

/// Immutable pool configuration, captured at construction.
#[derive(Debug, Deserialize, Clone)]
pub struct PoolConfig {
    /// FTP server hostname or address.
    pub host: String,

    /// Control-channel port; absent means the standard port 21.
    pub port: Option<u16>,

    /// Login credentials.
    pub username: String,
    pub password: String,

    /// Data-channel mode: true for passive (PASV), false for active (PORT).
    pub passive_mode: bool,

    /// Connections created eagerly at initialization.
    pub minimum_pool_size: usize,

    /// Hard cap on connections in existence; beyond it, `open_session`
    /// rejects with `PoolExhausted`.
    pub maximum_pool_size: usize,

    /// Idle connections older than this get a NOOP to stop the server's
    /// idle timeout from dropping them. Zero disables the keep-alive task.
    pub keep_alive_interval_secs: u64,

    /// Directory on the server all sessions operate under. Created on
    /// first connect if absent.
    pub base_storage_dir: String,
}

impl PoolConfig {
    /// Load configuration from `pool.toml` with `FTP_POOL_*` environment
    /// overrides.
    pub fn load() -> Result<Self, config::ConfigError> {
        Self::load_from("pool")
    }

    /// Load configuration from a named config file (extension resolved by
    /// the config crate), still honoring environment overrides.
    pub fn load_from(path: &str) -> Result<Self, config::ConfigError> {
        let settings = Config::builder()
            .add_source(File::with_name(path))
            .add_source(Environment::with_prefix("FTP_POOL"))
            .build()?;

        let config: PoolConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validation for all configuration values.
    pub fn validate(&self) -> Result<(), config::ConfigError> {
        if self.host.is_empty() {
            return Err(config::ConfigError::Message("host cannot be empty".into()));
        }

        if self.maximum_pool_size == 0 {
            return Err(config::ConfigError::Message(
                "maximum_pool_size must be greater than 0".into(),
            ));
        }

        if self.minimum_pool_size > self.maximum_pool_size {
            return Err(config::ConfigError::Message(
                "minimum_pool_size cannot exceed maximum_pool_size".into(),
            ));
        }

        if self.base_storage_dir.is_empty() {
            return Err(config::ConfigError::Message(
                "base_storage_dir cannot be empty".into(),
            ));
        }

        Ok(())
    }

    /// Control-channel address, with the standard port as default.
    pub fn control_addr(&self) -> String {
        format!("{}:{}", self.host, self.port.unwrap_or(21))
    }

    /// Keep-alive interval as a Duration.
    pub fn keep_alive_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.keep_alive_interval_secs)
    }
}
