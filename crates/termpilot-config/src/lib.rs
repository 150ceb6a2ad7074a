pub mod paths;
pub mod settings;

pub use paths::AppPaths;
pub use settings::{
    AiConfig, AppConfig, AppConfigLayer, ConfigError, ConfigManager, IdleConfig, LoggingConfig,
    MonitoringConfig, PoolConfig, SshDefaults, AI_KEY_ENV,
};
