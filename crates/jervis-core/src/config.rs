use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration loaded from `~/.jervis/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub staging: StagingConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub background: BackgroundConfig,
    #[serde(default)]
    pub qualifier: QualifierConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub weaviate: WeaviateConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            staging: StagingConfig::default(),
            polling: PollingConfig::default(),
            background: BackgroundConfig::default(),
            qualifier: QualifierConfig::default(),
            providers: ProvidersConfig::default(),
            weaviate: WeaviateConfig::default(),
            retry: RetryConfig::default(),
            rate_limit: RateLimitConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load config from `~/.jervis/config.toml`, falling back to defaults
    /// when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            Ok(Config::default())
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Sanity-check cross-field constraints not expressible via serde defaults.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.qualifier.initial_backoff_ms > self.qualifier.max_backoff_ms {
            return Err(ConfigError::Parse(
                "qualifier.initial_backoff_ms must not exceed qualifier.max_backoff_ms".into(),
            ));
        }
        if self.retry.http.initial_backoff_ms > self.retry.http.max_backoff_ms {
            return Err(ConfigError::Parse(
                "retry.http.initial_backoff_ms must not exceed retry.http.max_backoff_ms".into(),
            ));
        }
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".jervis")
            .join("config.toml")
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_project_name")]
    pub project_name: String,
    #[serde(default)]
    pub workspace_root: Option<String>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            project_name: default_project_name(),
            workspace_root: None,
        }
    }
}

fn default_project_name() -> String {
    "jervis".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingConfig {
    #[serde(default = "default_staging_path")]
    pub database_path: String,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            database_path: default_staging_path(),
        }
    }
}

fn default_staging_path() -> String {
    "~/.jervis/staging.db".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_polling_interval_ms")]
    pub polling_interval_ms: u64,
    #[serde(default = "default_http_interval_ms")]
    pub http_interval_ms: u64,
    #[serde(default = "default_imap_interval_ms")]
    pub imap_interval_ms: u64,
    #[serde(default = "default_pop3_interval_ms")]
    pub pop3_interval_ms: u64,
    #[serde(default = "default_max_concurrent_polls")]
    pub max_concurrent_polls: usize,
    #[serde(default = "default_startup_delay_ms")]
    pub startup_delay_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            polling_interval_ms: default_polling_interval_ms(),
            http_interval_ms: default_http_interval_ms(),
            imap_interval_ms: default_imap_interval_ms(),
            pop3_interval_ms: default_pop3_interval_ms(),
            max_concurrent_polls: default_max_concurrent_polls(),
            startup_delay_ms: default_startup_delay_ms(),
        }
    }
}

fn default_polling_interval_ms() -> u64 {
    60_000
}
fn default_http_interval_ms() -> u64 {
    300_000
}
fn default_imap_interval_ms() -> u64 {
    60_000
}
fn default_pop3_interval_ms() -> u64 {
    120_000
}
fn default_max_concurrent_polls() -> usize {
    4
}
fn default_startup_delay_ms() -> u64 {
    2_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackgroundConfig {
    #[serde(default = "default_wait_on_startup_secs")]
    pub wait_on_startup_secs: u64,
    #[serde(default = "default_wait_interval_secs")]
    pub wait_interval_secs: u64,
    #[serde(default = "default_wait_on_error_secs")]
    pub wait_on_error_secs: u64,
    #[serde(default = "default_stale_threshold_secs")]
    pub stale_threshold_secs: u64,
    #[serde(default = "default_qualification_concurrency")]
    pub qualification_concurrency: usize,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            wait_on_startup_secs: default_wait_on_startup_secs(),
            wait_interval_secs: default_wait_interval_secs(),
            wait_on_error_secs: default_wait_on_error_secs(),
            stale_threshold_secs: default_stale_threshold_secs(),
            qualification_concurrency: default_qualification_concurrency(),
        }
    }
}

fn default_wait_on_startup_secs() -> u64 {
    10
}
fn default_wait_interval_secs() -> u64 {
    30
}
fn default_wait_on_error_secs() -> u64 {
    30
}
fn default_stale_threshold_secs() -> u64 {
    900
}
fn default_qualification_concurrency() -> usize {
    8
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualifierConfig {
    #[serde(default = "default_qualifier_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_qualifier_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default)]
    pub model: Option<String>,
}

impl Default for QualifierConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_qualifier_initial_backoff_ms(),
            max_backoff_ms: default_qualifier_max_backoff_ms(),
            model: None,
        }
    }
}

fn default_qualifier_initial_backoff_ms() -> u64 {
    5_000
}
fn default_qualifier_max_backoff_ms() -> u64 {
    300_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub anthropic_key_env: Option<String>,
    #[serde(default)]
    pub openai_key_env: Option<String>,
    #[serde(default)]
    pub local_base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub default_max_tokens: u32,
    #[serde(default)]
    pub planner_base_url: Option<String>,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            anthropic_key_env: None,
            openai_key_env: None,
            local_base_url: None,
            default_max_tokens: default_max_tokens(),
            planner_base_url: None,
        }
    }
}

fn default_max_tokens() -> u32 {
    16384
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeaviateConfig {
    #[serde(default = "default_weaviate_url")]
    pub base_url: String,
    #[serde(default)]
    pub auto_migrate: AutoMigrateConfig,
}

impl Default for WeaviateConfig {
    fn default() -> Self {
        Self {
            base_url: default_weaviate_url(),
            auto_migrate: AutoMigrateConfig::default(),
        }
    }
}

fn default_weaviate_url() -> String {
    "http://127.0.0.1:8080".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoMigrateConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_migrate_countdown")]
    pub countdown_seconds: u64,
}

impl Default for AutoMigrateConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            countdown_seconds: default_migrate_countdown(),
        }
    }
}

fn default_migrate_countdown() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default)]
    pub http: HttpRetryConfig,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            http: HttpRetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpRetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for HttpRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_backoff_ms() -> u64 {
    500
}
fn default_max_backoff_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_rps")]
    pub max_requests_per_second: u32,
    #[serde(default = "default_rpm")]
    pub max_requests_per_minute: u32,
    #[serde(default = "default_bucket_ttl_secs")]
    pub bucket_ttl_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests_per_second: default_rps(),
            max_requests_per_minute: default_rpm(),
            bucket_ttl_secs: default_bucket_ttl_secs(),
        }
    }
}

fn default_rps() -> u32 {
    5
}
fn default_rpm() -> u32 {
    120
}
fn default_bucket_ttl_secs() -> u64 {
    600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_correct() {
        let cfg = Config::default();
        assert_eq!(cfg.general.project_name, "jervis");
        assert_eq!(cfg.polling.polling_interval_ms, 60_000);
        assert_eq!(cfg.polling.http_interval_ms, 300_000);
        assert_eq!(cfg.qualifier.initial_backoff_ms, 5_000);
        assert_eq!(cfg.qualifier.max_backoff_ms, 300_000);
        assert!(!cfg.weaviate.auto_migrate.enabled);
        assert_eq!(cfg.retry.http.max_attempts, 3);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let toml_str = r#"
[general]
project_name = "acme-jervis"
"#;
        let cfg: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.general.project_name, "acme-jervis");
        assert_eq!(cfg.polling.polling_interval_ms, 60_000);
    }

    #[test]
    fn invalid_backoff_ordering_rejected() {
        let mut cfg = Config::default();
        cfg.qualifier.initial_backoff_ms = 10_000;
        cfg.qualifier.max_backoff_ms = 1_000;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn roundtrip_toml() {
        let cfg = Config::default();
        let text = cfg.to_toml().unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.general.project_name, cfg.general.project_name);
    }
}
