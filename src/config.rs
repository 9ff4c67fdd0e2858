//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and environment variable overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::hub::{DecodePolicy, HubConfig};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub hub: HubSettings,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP / WebSocket listener configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Route the WebSocket endpoint is served on
    #[serde(default = "default_path")]
    pub path: String,

    /// Origins allowed to open a WebSocket and make CORS requests
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,

    /// Outgoing WebSocket buffer in bytes
    #[serde(default = "default_buffer_size")]
    pub write_buffer_size: usize,

    /// What to do with a frame that is not a valid message
    #[serde(default)]
    pub decode_policy: DecodePolicy,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3030
}

fn default_path() -> String {
    "/v1/ws".to_string()
}

fn default_allowed_origins() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_buffer_size() -> usize {
    1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            path: default_path(),
            allowed_origins: default_allowed_origins(),
            write_buffer_size: default_buffer_size(),
            decode_policy: DecodePolicy::default(),
        }
    }
}

impl ServerConfig {
    /// Get the socket address string
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Whether every origin is allowed
    pub fn allows_any_origin(&self) -> bool {
        self.allowed_origins.is_empty() || self.allowed_origins.iter().any(|o| o == "*")
    }
}

/// Broadcast hub configuration
#[derive(Debug, Clone, Deserialize)]
pub struct HubSettings {
    #[serde(default = "default_send_timeout")]
    pub send_timeout_ms: u64,

    /// Inbound queue bound, 0 = unbounded
    #[serde(default)]
    pub queue_capacity: usize,

    /// Connection limit, 0 = unbounded
    #[serde(default)]
    pub max_connections: usize,
}

fn default_send_timeout() -> u64 {
    5000 // 5 seconds
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            send_timeout_ms: default_send_timeout(),
            queue_capacity: 0,
            max_connections: 0,
        }
    }
}

impl HubSettings {
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            send_timeout: Duration::from_millis(self.send_timeout_ms),
            queue_capacity: (self.queue_capacity > 0).then_some(self.queue_capacity),
            max_connections: (self.max_connections > 0).then_some(self.max_connections),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from default locations or environment.
    ///
    /// Logging is configured from the result, so nothing is logged here; the
    /// caller reports [`LoadedConfig::source`] and any skipped files.
    pub fn load_default() -> LoadedConfig {
        let config_paths: Vec<PathBuf> = [
            dirs::config_dir().map(|p| p.join("chathub").join("config.toml")),
            Some(PathBuf::from("/etc/chathub/config.toml")),
            Some(PathBuf::from("./chathub.toml")),
        ]
        .into_iter()
        .flatten()
        .collect();

        Self::load_first(&config_paths)
    }

    fn load_first(paths: &[PathBuf]) -> LoadedConfig {
        let mut skipped = Vec::new();

        for path in paths.iter().filter(|p| p.exists()) {
            match Self::load_with_env(path) {
                Ok(config) => {
                    return LoadedConfig {
                        config,
                        source: ConfigSource::File(path.clone()),
                        skipped,
                    }
                }
                Err(e) => skipped.push(e),
            }
        }

        LoadedConfig {
            config: Self::from_env(),
            source: ConfigSource::Defaults,
            skipped,
        }
    }

    /// Apply environment variable overrides to an existing config
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        // Server overrides
        if let Some(host) = lookup("CHATHUB_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("CHATHUB_PORT").and_then(|p| p.parse().ok()) {
            self.server.port = port;
        }
        if let Some(origins) = lookup("CHATHUB_ALLOWED_ORIGINS") {
            self.server.allowed_origins = origins
                .split(',')
                .map(str::trim)
                .filter(|o| !o.is_empty())
                .map(String::from)
                .collect();
        }

        // Hub overrides
        if let Some(ms) = lookup("CHATHUB_SEND_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.hub.send_timeout_ms = ms;
        }
        if let Some(cap) = lookup("CHATHUB_QUEUE_CAPACITY").and_then(|v| v.parse().ok()) {
            self.hub.queue_capacity = cap;
        }
        if let Some(max) = lookup("CHATHUB_MAX_CONNECTIONS").and_then(|v| v.parse().ok()) {
            self.hub.max_connections = max;
        }

        // Logging overrides
        if let Some(level) = lookup("CHATHUB_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("CHATHUB_LOG_FORMAT") {
            self.logging.format = format;
        }
    }
}

/// Where a loaded configuration came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    File(PathBuf),
    /// Built-in defaults with environment overrides
    Defaults,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::File(path) => write!(f, "{}", path.display()),
            ConfigSource::Defaults => f.write_str("defaults + environment"),
        }
    }
}

/// Result of [`Config::load_default`]
#[derive(Debug)]
pub struct LoadedConfig {
    pub config: Config,
    pub source: ConfigSource,
    /// Files that existed but failed to load, in search order
    pub skipped: Vec<ConfigError>,
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# Chathub Configuration
#
# Environment variables override these settings:
# - CHATHUB_HOST
# - CHATHUB_PORT
# - CHATHUB_ALLOWED_ORIGINS (comma separated)
# - CHATHUB_SEND_TIMEOUT_MS
# - CHATHUB_QUEUE_CAPACITY
# - CHATHUB_MAX_CONNECTIONS
# - CHATHUB_LOG_LEVEL
# - CHATHUB_LOG_FORMAT

[server]
# Listener host
host = "0.0.0.0"

# Listener port
port = 3030

# WebSocket endpoint
path = "/v1/ws"

# Origins allowed to connect ("*" allows all)
allowed_origins = ["*"]

# Outgoing WebSocket buffer size (bytes)
write_buffer_size = 1024

# Invalid message handling: "disconnect" or "skip"
decode_policy = "disconnect"

[hub]
# How long to wait on one client before dropping it (ms)
send_timeout_ms = 5000

# Inbound queue bound (0 = unbounded)
queue_capacity = 0

# Maximum concurrent connections (0 = unbounded)
max_connections = 0

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"
"#
    .to_string()
}
