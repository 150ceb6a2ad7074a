use crate::paths::AppPaths;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Environment variable that supplies `ai.api_key` without writing it to disk.
pub const AI_KEY_ENV: &str = "TERMPILOT_AI_API_KEY";

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct AppConfig {
    pub ssh: SshDefaults,
    pub pool: PoolConfig,
    pub monitoring: MonitoringConfig,
    pub idle: IdleConfig,
    pub ai: AiConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool.max_errors == 0 {
            return Err(ConfigError::Invalid("pool.max_errors must be at least 1".into()));
        }
        if self.monitoring.metrics_interval_ms == 0 || self.monitoring.heartbeat_interval_secs == 0 {
            return Err(ConfigError::Invalid("monitoring intervals must be positive".into()));
        }
        if self.idle.enabled && self.idle.warning_time_ms >= self.idle.idle_timeout_ms {
            return Err(ConfigError::Invalid(format!(
                "idle.warning_time_ms ({}) must be below idle.idle_timeout_ms ({})",
                self.idle.warning_time_ms, self.idle.idle_timeout_ms
            )));
        }
        if !(0.0..=2.0).contains(&self.ai.temperature) {
            return Err(ConfigError::Invalid("ai.temperature must be within 0.0..=2.0".into()));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct AppConfigLayer {
    pub ssh: Option<SshDefaultsLayer>,
    pub pool: Option<PoolConfigLayer>,
    pub monitoring: Option<MonitoringConfigLayer>,
    pub idle: Option<IdleConfigLayer>,
    pub ai: Option<AiConfigLayer>,
    pub logging: Option<LoggingConfigLayer>,
}

impl AppConfigLayer {
    pub fn apply_to(self, cfg: &mut AppConfig) {
        if let Some(layer) = self.ssh {
            cfg.ssh.apply(layer);
        }
        if let Some(layer) = self.pool {
            cfg.pool.apply(layer);
        }
        if let Some(layer) = self.monitoring {
            cfg.monitoring.apply(layer);
        }
        if let Some(layer) = self.idle {
            cfg.idle.apply(layer);
        }
        if let Some(layer) = self.ai {
            cfg.ai.apply(layer);
        }
        if let Some(layer) = self.logging {
            cfg.logging.apply(layer);
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SshDefaults {
    pub port: u16,
    pub connect_timeout_ms: u64,
    pub keepalive_interval_secs: u64,
    /// One of `strict`, `accept-new`, `insecure`.
    pub host_key_policy: String,
    pub known_hosts_path: Option<PathBuf>,
}

impl Default for SshDefaults {
    fn default() -> Self {
        Self {
            port: 22,
            connect_timeout_ms: 15000,
            keepalive_interval_secs: 15,
            host_key_policy: "accept-new".to_string(),
            known_hosts_path: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct SshDefaultsLayer {
    pub port: Option<u16>,
    pub connect_timeout_ms: Option<u64>,
    pub keepalive_interval_secs: Option<u64>,
    pub host_key_policy: Option<String>,
    pub known_hosts_path: Option<PathBuf>,
}

impl SshDefaults {
    fn apply(&mut self, layer: SshDefaultsLayer) {
        if let Some(v) = layer.port {
            self.port = v;
        }
        if let Some(v) = layer.connect_timeout_ms {
            self.connect_timeout_ms = v;
        }
        if let Some(v) = layer.keepalive_interval_secs {
            self.keepalive_interval_secs = v;
        }
        if let Some(v) = layer.host_key_policy {
            self.host_key_policy = v;
        }
        if layer.known_hosts_path.is_some() {
            self.known_hosts_path = layer.known_hosts_path;
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PoolConfig {
    pub max_errors: u32,
    pub idle_evict_secs: u64,
    pub cleanup_interval_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_errors: 3,
            idle_evict_secs: 300,
            cleanup_interval_secs: 60,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct PoolConfigLayer {
    pub max_errors: Option<u32>,
    pub idle_evict_secs: Option<u64>,
    pub cleanup_interval_secs: Option<u64>,
}

impl PoolConfig {
    fn apply(&mut self, layer: PoolConfigLayer) {
        if let Some(v) = layer.max_errors {
            self.max_errors = v;
        }
        if let Some(v) = layer.idle_evict_secs {
            self.idle_evict_secs = v;
        }
        if let Some(v) = layer.cleanup_interval_secs {
            self.cleanup_interval_secs = v;
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MonitoringConfig {
    pub heartbeat_interval_secs: u64,
    pub metrics_interval_ms: u64,
    pub heartbeat_command: String,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            metrics_interval_ms: 1000,
            heartbeat_command: "echo heartbeat".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct MonitoringConfigLayer {
    pub heartbeat_interval_secs: Option<u64>,
    pub metrics_interval_ms: Option<u64>,
    pub heartbeat_command: Option<String>,
}

impl MonitoringConfig {
    fn apply(&mut self, layer: MonitoringConfigLayer) {
        if let Some(v) = layer.heartbeat_interval_secs {
            self.heartbeat_interval_secs = v;
        }
        if let Some(v) = layer.metrics_interval_ms {
            self.metrics_interval_ms = v;
        }
        if let Some(v) = layer.heartbeat_command {
            self.heartbeat_command = v;
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IdleConfig {
    pub enabled: bool,
    pub idle_timeout_ms: u64,
    pub warning_time_ms: u64,
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            idle_timeout_ms: 600_000,
            warning_time_ms: 30_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct IdleConfigLayer {
    pub enabled: Option<bool>,
    pub idle_timeout_ms: Option<u64>,
    pub warning_time_ms: Option<u64>,
}

impl IdleConfig {
    fn apply(&mut self, layer: IdleConfigLayer) {
        if let Some(v) = layer.enabled {
            self.enabled = v;
        }
        if let Some(v) = layer.idle_timeout_ms {
            self.idle_timeout_ms = v;
        }
        if let Some(v) = layer.warning_time_ms {
            self.warning_time_ms = v;
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AiConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub history_max: usize,
    pub timeout_ms: u64,
    pub system_prompt: String,
    pub max_iterations: u32,
    pub tool_timeout_ms: u64,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: String::new(),
            temperature: 0.7,
            max_tokens: 2000,
            history_max: 20,
            timeout_ms: 60000,
            system_prompt: "You are an operations assistant working on a remote server over SSH. \
                            Prefer short, safe, non-interactive commands."
                .to_string(),
            max_iterations: 10,
            tool_timeout_ms: 30000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct AiConfigLayer {
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub history_max: Option<usize>,
    pub timeout_ms: Option<u64>,
    pub system_prompt: Option<String>,
    pub max_iterations: Option<u32>,
    pub tool_timeout_ms: Option<u64>,
}

impl AiConfig {
    fn apply(&mut self, layer: AiConfigLayer) {
        if let Some(v) = layer.endpoint {
            self.endpoint = v;
        }
        if layer.api_key.is_some() {
            self.api_key = layer.api_key;
        }
        if let Some(v) = layer.model {
            self.model = v;
        }
        if let Some(v) = layer.temperature {
            self.temperature = v;
        }
        if let Some(v) = layer.max_tokens {
            self.max_tokens = v;
        }
        if let Some(v) = layer.history_max {
            self.history_max = v;
        }
        if let Some(v) = layer.timeout_ms {
            self.timeout_ms = v;
        }
        if let Some(v) = layer.system_prompt {
            self.system_prompt = v;
        }
        if let Some(v) = layer.max_iterations {
            self.max_iterations = v;
        }
        if let Some(v) = layer.tool_timeout_ms {
            self.tool_timeout_ms = v;
        }
    }

    /// True when endpoint, key and model are all present.
    pub fn is_configured(&self) -> bool {
        !self.endpoint.trim().is_empty()
            && !self.model.trim().is_empty()
            && self
                .api_key
                .as_ref()
                .map(|v| !v.trim().is_empty())
                .unwrap_or(false)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
    pub stdout: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            stdout: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct LoggingConfigLayer {
    pub level: Option<String>,
    pub json: Option<bool>,
    pub stdout: Option<bool>,
}

impl LoggingConfig {
    fn apply(&mut self, layer: LoggingConfigLayer) {
        if let Some(v) = layer.level {
            self.level = v;
        }
        if let Some(v) = layer.json {
            self.json = v;
        }
        if let Some(v) = layer.stdout {
            self.stdout = v;
        }
    }
}

#[derive(Clone, Debug)]
pub struct ConfigManager {
    pub paths: AppPaths,
}

impl ConfigManager {
    pub fn new(paths: AppPaths) -> Self {
        Self { paths }
    }

    pub fn load(&self, cwd: Option<&Path>, overrides: Option<AppConfigLayer>) -> Result<AppConfig> {
        let mut cfg = AppConfig::default();

        if self.paths.config_file.exists() {
            debug!(path = %self.paths.config_file.display(), "loading user config");
            let layer = Self::load_layer(&self.paths.config_file)?;
            layer.apply_to(&mut cfg);
        }

        if let Some(dir) = cwd {
            let project_path = AppPaths::project_config_path(dir);
            if project_path.exists() {
                debug!(path = %project_path.display(), "loading project config");
                let layer = Self::load_layer(&project_path)?;
                layer.apply_to(&mut cfg);
            }
        }

        if let Some(layer) = overrides {
            layer.apply_to(&mut cfg);
        }

        if let Ok(key) = std::env::var(AI_KEY_ENV) {
            if !key.trim().is_empty() {
                cfg.ai.api_key = Some(key);
            }
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load_layer(path: &Path) -> Result<AppConfigLayer, ConfigError> {
        let content = fs::read_to_string(path)?;
        let layer: AppConfigLayer = toml::from_str(&content)?;
        Ok(layer)
    }

    pub fn save_default(&self) -> Result<()> {
        self.save_config(&AppConfig::default())
    }

    pub fn save_config(&self, cfg: &AppConfig) -> Result<()> {
        if let Some(parent) = self.paths.config_file.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(cfg).map_err(|e| anyhow::anyhow!(e))?;
        fs::write(&self.paths.config_file, content)?;
        Ok(())
    }
}
