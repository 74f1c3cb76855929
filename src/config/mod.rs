//! # Configuration Management Module
//!
//! Typed configuration for the collector, loaded from TOML with environment
//! overrides for the database and device settings.
//!
//! ## Configuration Structure
//!
//! - [`MeshtasticConfig`] - Device port and event queue settings
//! - [`DatabaseConfig`] - PostgreSQL/TimescaleDB connection and pool settings
//! - [`RetryConfig`] - Backoff schedule for transient store failures
//! - [`CollectorConfig`] - Stats interval, drain grace period and concurrency
//! - [`LoggingConfig`] - Log level and optional log file
//! - `hardware_models` - Extra or corrected hardware model labels keyed by code
//!
//! ## Configuration File Format
//!
//! ```toml
//! [meshtastic]
//! port = "/dev/ttyACM0"
//! baud_rate = 115200
//!
//! [database]
//! host = "localhost"
//! port = 5432
//! name = "meshtastic"
//! user = "postgres"
//! password = "secret"
//!
//! [hardware_models]
//! "99" = "MY_CUSTOM_BOARD"
//! ```
//!
//! Precedence: CLI args > Environment > Config file > Defaults. Recognised
//! environment variables are `DB_HOST`, `DB_PORT`, `DB_NAME`, `DB_USER`,
//! `DB_PASSWORD` and `MESHTASTIC_PORT`.

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::fs;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub meshtastic: MeshtasticConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub collector: CollectorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Hardware model labels that extend or override the built-in table.
    #[serde(default)]
    pub hardware_models: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshtasticConfig {
    pub port: String,
    pub baud_rate: u32,
    /// Capacity of the bounded channel between the device reader and the run-loop.
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,
    /// How long to wait for the device to finish the want_config exchange.
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    /// Interval between heartbeats that keep the serial API session alive.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
}

fn default_event_queue_capacity() -> usize {
    1024
}

fn default_handshake_timeout_secs() -> u64 {
    10
}

fn default_heartbeat_interval_secs() -> u64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_max_pool_size")]
    pub max_pool_size: usize,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_keepalives_idle_secs")]
    pub keepalives_idle_secs: u64,
}

fn default_max_pool_size() -> usize {
    20
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_keepalives_idle_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per statement, including the first one.
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 1000,
            max_delay_ms: 16_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    pub stats_interval_secs: u64,
    /// Grace period for in-flight persistence calls once draining starts.
    pub drain_grace_secs: u64,
    /// Maximum number of events processed concurrently.
    pub max_in_flight: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            stats_interval_secs: 60,
            drain_grace_secs: 10,
            max_in_flight: 64,
        }
    }
}

impl CollectorConfig {
    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_secs(self.drain_grace_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: Some("meshtastic-collector.log".to_string()),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        Ok(config)
    }

    /// Load a file, apply process environment overrides and validate.
    pub async fn load_with_env(path: &str) -> Result<Self> {
        let mut config = Self::load(path).await?;
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    /// Apply environment overrides. The lookup is injected so tests do not
    /// have to mutate the process environment.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("DB_HOST") {
            self.database.host = host;
        }
        if let Some(port) = lookup("DB_PORT") {
            self.database.port = port
                .trim()
                .parse()
                .map_err(|e| anyhow!("Invalid DB_PORT '{}': {}", port, e))?;
        }
        if let Some(name) = lookup("DB_NAME") {
            self.database.name = name;
        }
        if let Some(user) = lookup("DB_USER") {
            self.database.user = user;
        }
        if let Some(password) = lookup("DB_PASSWORD") {
            self.database.password = password;
        }
        if let Some(port) = lookup("MESHTASTIC_PORT") {
            self.meshtastic.port = port;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.database.max_pool_size == 0 {
            bail!("database.max_pool_size must be at least 1");
        }
        if self.meshtastic.event_queue_capacity == 0 {
            bail!("meshtastic.event_queue_capacity must be at least 1");
        }
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            bail!(
                "retry.initial_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                self.retry.initial_delay_ms,
                self.retry.max_delay_ms
            );
        }
        if self.collector.stats_interval_secs == 0 {
            bail!("collector.stats_interval_secs must be at least 1");
        }
        if self.collector.max_in_flight == 0 {
            bail!("collector.max_in_flight must be at least 1");
        }
        for code in self.hardware_models.keys() {
            if code.trim().parse::<i64>().is_err() {
                bail!("hardware_models key '{}' is not a numeric model code", code);
            }
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            meshtastic: MeshtasticConfig {
                port: "/dev/ttyACM0".to_string(),
                baud_rate: 115200,
                event_queue_capacity: default_event_queue_capacity(),
                handshake_timeout_secs: default_handshake_timeout_secs(),
                heartbeat_interval_secs: default_heartbeat_interval_secs(),
            },
            database: DatabaseConfig {
                host: "localhost".to_string(),
                port: 5432,
                name: "meshtastic".to_string(),
                user: "postgres".to_string(),
                password: String::new(),
                max_pool_size: default_max_pool_size(),
                connect_timeout_secs: default_connect_timeout_secs(),
                keepalives_idle_secs: default_keepalives_idle_secs(),
            },
            retry: RetryConfig::default(),
            collector: CollectorConfig::default(),
            logging: LoggingConfig::default(),
            hardware_models: HashMap::new(),
        }
    }
}
