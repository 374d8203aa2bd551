use crate::paths::AppDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

const CURRENT_CONFIG_VERSION: u32 = 1;

/// Environment variable carrying the peer host, set by the launcher.
pub const ENV_ENGINE_HOST: &str = "SGTK_HARMONY_ENGINE_HOST";
/// Environment variable carrying the peer port, set by the launcher.
pub const ENV_ENGINE_PORT: &str = "SGTK_HARMONY_ENGINE_PORT";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_config_version")]
    pub config_version: u32,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_version: default_config_version(),
            bridge: BridgeConfig::default(),
            cache: CacheConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Connection settings for the peer application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    /// How long `call_and_wait` waits for a reply.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Slice used while waiting, between host event pumps.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Fixed delay between connection attempts.
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
    /// `None` retries forever.
    #[serde(default)]
    pub max_connect_attempts: Option<u32>,
    #[serde(default = "default_result_ttl_secs")]
    pub result_ttl_secs: u64,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    #[serde(default = "default_outbound_encoding")]
    pub outbound_encoding: TextEncoding,
    #[serde(default = "default_inbound_encoding")]
    pub inbound_encoding: TextEncoding,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: None,
            connect_timeout_ms: default_connect_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            retry_interval_ms: default_retry_interval_ms(),
            max_connect_attempts: None,
            result_ttl_secs: default_result_ttl_secs(),
            max_frame_bytes: default_max_frame_bytes(),
            outbound_encoding: default_outbound_encoding(),
            inbound_encoding: default_inbound_encoding(),
        }
    }
}

/// Resolved peer address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl BridgeConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn result_ttl(&self) -> Duration {
        Duration::from_secs(self.result_ttl_secs)
    }

    /// Resolve the peer endpoint.
    ///
    /// Precedence: explicit overrides, then the launcher environment (read
    /// through `lookup`), then the configured values.
    pub fn resolve_endpoint<F>(
        &self,
        host_override: Option<&str>,
        port_override: Option<u16>,
        lookup: F,
    ) -> Result<Endpoint, ValidationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let host = match host_override {
            Some(host) => host.to_string(),
            None => lookup(ENV_ENGINE_HOST)
                .filter(|value| !value.trim().is_empty())
                .unwrap_or_else(|| self.host.clone()),
        };

        let port = match port_override {
            Some(port) => port,
            None => match lookup(ENV_ENGINE_PORT) {
                Some(raw) => raw
                    .trim()
                    .parse::<u16>()
                    .map_err(|_| ValidationError::InvalidPort { value: raw.clone() })?,
                None => self.port.ok_or(ValidationError::MissingPort)?,
            },
        };

        Ok(Endpoint { host, port })
    }
}

/// Text encoding of frame payloads.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TextEncoding {
    #[default]
    Utf8,
    /// Qt data stream string layout.
    Utf16Be,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Seconds before a cached result expires; 0 never expires.
    #[serde(default)]
    pub ttl_secs: u64,
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 0,
            capacity: default_cache_capacity(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Option<Duration> {
        (self.ttl_secs > 0).then(|| Duration::from_secs(self.ttl_secs))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: LogLevel,
    #[serde(default = "default_max_log_files")]
    pub max_log_files: usize,
    /// Mirror log output to stderr.
    #[serde(default = "default_console_enabled")]
    pub console: bool,
    #[serde(default)]
    pub file_name: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_log_files: default_max_log_files(),
            console: default_console_enabled(),
            file_name: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_filter_directive(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("config validation failed: {0}")]
    Validation(ValidationError),
    #[error("failed to prepare configuration directories: {0}")]
    Directories(#[from] crate::paths::DirsError),
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("unsupported config_version {found}, expected {expected}")]
    UnsupportedVersion { found: u32, expected: u32 },
    #[error("bridge.{field} must be greater than zero")]
    ZeroTimeout { field: &'static str },
    #[error("bridge.max_frame_bytes must be at least 4")]
    FrameLimitTooSmall,
    #[error("invalid peer port {value:?}")]
    InvalidPort { value: String },
    #[error("no peer port configured; set SGTK_HARMONY_ENGINE_PORT or bridge.port")]
    MissingPort,
}

impl Config {
    pub fn load_or_default(dirs: &AppDirs) -> Result<Self, ConfigError> {
        dirs.ensure_exists()?;
        let path = Self::config_path(dirs);
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        let config: Config = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;
        config.validate().map_err(ConfigError::Validation)?;
        Ok(config)
    }

    pub fn config_path(dirs: &AppDirs) -> PathBuf {
        dirs.config_dir().join("config.toml")
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.config_version != CURRENT_CONFIG_VERSION {
            return Err(ValidationError::UnsupportedVersion {
                found: self.config_version,
                expected: CURRENT_CONFIG_VERSION,
            });
        }
        for (field, value) in [
            ("connect_timeout_ms", self.bridge.connect_timeout_ms),
            ("write_timeout_ms", self.bridge.write_timeout_ms),
            ("read_timeout_ms", self.bridge.read_timeout_ms),
        ] {
            if value == 0 {
                return Err(ValidationError::ZeroTimeout { field });
            }
        }
        if self.bridge.max_frame_bytes < 4 {
            return Err(ValidationError::FrameLimitTooSmall);
        }
        Ok(())
    }
}

fn default_config_version() -> u32 {
    CURRENT_CONFIG_VERSION
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    1_500
}

fn default_write_timeout_ms() -> u64 {
    10_000
}

fn default_read_timeout_ms() -> u64 {
    10_000
}

fn default_poll_interval_ms() -> u64 {
    50
}

fn default_retry_interval_ms() -> u64 {
    500
}

fn default_result_ttl_secs() -> u64 {
    60
}

fn default_max_frame_bytes() -> usize {
    64 * 1024 * 1024
}

fn default_outbound_encoding() -> TextEncoding {
    TextEncoding::Utf16Be
}

fn default_inbound_encoding() -> TextEncoding {
    TextEncoding::Utf8
}

fn default_cache_capacity() -> usize {
    32
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

fn default_max_log_files() -> usize {
    7
}

fn default_console_enabled() -> bool {
    true
}
