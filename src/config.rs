use crate::model::{BusDescriptor, BusKind};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to find config directory")]
    NoConfigDir,

    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    /// Buses exposed through the API, addressed by `id`
    #[serde(default = "default_buses")]
    pub buses: Vec<BusDescriptor>,

    #[serde(default)]
    pub dbus: DbusConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub signals: SignalsConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            buses: default_buses(),
            dbus: DbusConfig::default(),
            cache: CacheConfig::default(),
            signals: SignalsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

fn default_buses() -> Vec<BusDescriptor> {
    vec![BusDescriptor::system(), BusDescriptor::session()]
}

/// HTTP server configuration.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ServerConfig {
    /// Bind address (default: 127.0.0.1:8080 - localhost only)
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Enable Swagger UI at /swagger-ui/
    #[serde(default = "default_true")]
    pub swagger_ui: bool,

    /// Allowed CORS origins (empty = same-origin only)
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            swagger_ui: true,
            cors_origins: vec![],
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_true() -> bool {
    true
}

/// Bus connection settings, applied to every configured bus.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct DbusConfig {
    /// Upper bound for one bus round-trip
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Concurrent calls per bus (1 = strictly serialized)
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

impl Default for DbusConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: default_call_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            max_in_flight: default_max_in_flight(),
        }
    }
}

impl DbusConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

fn default_call_timeout_ms() -> u64 {
    25_000
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_max_in_flight() -> usize {
    16
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Seconds an introspection result stays fresh
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

fn default_ttl_secs() -> u64 {
    30
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct SignalsConfig {
    /// Events kept per subscription; the oldest are dropped first
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

impl Default for SignalsConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
        }
    }
}

fn default_buffer_size() -> usize {
    256
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,

    /// Also write a daily-rolling log file into this directory
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            directory: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Bus ids appear as a URL path segment.
fn valid_bus_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

impl Config {
    /// Get the config directory path
    pub fn config_dir() -> Result<PathBuf, ConfigError> {
        ProjectDirs::from("org", "dbus-controller", "dbus-controller")
            .map(|dirs| dirs.config_dir().to_path_buf())
            .ok_or(ConfigError::NoConfigDir)
    }

    /// Get the default config file path
    pub fn config_path() -> Result<PathBuf, ConfigError> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load config from `path` (or the default location), creating a default
    /// file if none exists.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => Self::config_path()?,
        };

        if path.exists() {
            Self::load_from(&path)
        } else {
            let config = Config::default();
            config.save_to(&path)?;
            Ok(config)
        }
    }

    /// Load and validate an existing config file
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse and validate config text
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.bind.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::ValidationError(format!(
                "server bind address '{}' is not a socket address",
                self.server.bind
            )));
        }

        if self.buses.is_empty() {
            return Err(ConfigError::ValidationError(
                "at least one bus must be configured".into(),
            ));
        }

        let mut ids = HashSet::new();
        for bus in &self.buses {
            if !valid_bus_id(&bus.id) {
                return Err(ConfigError::ValidationError(format!(
                    "bus id '{}' may only contain letters, digits, '-' and '_'",
                    bus.id
                )));
            }
            if !ids.insert(bus.id.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate bus id '{}'",
                    bus.id
                )));
            }
            if bus.kind == BusKind::Custom && bus.address.as_deref().unwrap_or("").is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "custom bus '{}' needs an address",
                    bus.id
                )));
            }
        }

        if self.dbus.call_timeout_ms == 0 || self.dbus.connect_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "dbus timeouts must be greater than zero".into(),
            ));
        }

        if self.dbus.max_in_flight == 0 {
            return Err(ConfigError::ValidationError(
                "dbus max_in_flight must be at least 1".into(),
            ));
        }

        if self.cache.ttl_secs == 0 {
            return Err(ConfigError::ValidationError(
                "cache ttl_secs must be greater than zero".into(),
            ));
        }

        if self.signals.buffer_size == 0 {
            return Err(ConfigError::ValidationError(
                "signals buffer_size must be at least 1".into(),
            ));
        }

        Ok(())
    }

    /// Save config to file
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        // Create config directory if needed
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;

        info!("Config saved to: {}", path.display());
        Ok(())
    }
}

/// Show current configuration
pub fn show(path: Option<&Path>) -> anyhow::Result<()> {
    let config = Config::load(path)?;
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => Config::config_path()?,
    };

    println!("Config file: {}\n", path.display());
    println!("{}", toml::to_string_pretty(&config)?);

    Ok(())
}
