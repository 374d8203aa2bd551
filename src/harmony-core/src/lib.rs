pub mod cache;
pub mod config;
pub mod logging;
pub mod paths;

pub use cache::TtlCache;
pub use config::{
    BridgeConfig, CacheConfig, Config, ConfigError, Endpoint, LogLevel, LoggingConfig,
    TextEncoding, ValidationError, ENV_ENGINE_HOST, ENV_ENGINE_PORT,
};
pub use logging::{init_logging, LoggingError, LoggingGuard};
pub use paths::{normalize_path, AppDirs, DirsError};

pub const APP_NAME: &str = "tk-harmony";
pub const APP_AUTHOR: &str = "tk-harmony";
pub const APP_QUALIFIER: &str = "io";
