//! Configuration loading from TOML files
//!
//! Config file is selected via the --config command line argument; a missing
//! or unparsable file falls back to defaults so the engine can always start.

use anyhow::Context;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use tracing::warn;

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    pub base_url: String,
    /// Bearer token sent on every request
    #[serde(default)]
    pub auth_token: String,
    #[serde(default = "default_backend_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_backend_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct PollingConfig {
    /// Fast sensor-and-state poll cadence
    #[serde(default = "default_sensor_interval_secs")]
    pub sensor_interval_secs: u64,
    /// Slow cadence used while the sensor network is offline
    #[serde(default = "default_fallback_interval_secs")]
    pub fallback_interval_secs: u64,
    /// Presentational countdown tick; no billing side effects
    #[serde(default = "default_countdown_interval_secs")]
    pub countdown_interval_secs: u64,
}

fn default_sensor_interval_secs() -> u64 {
    8
}

fn default_fallback_interval_secs() -> u64 {
    30
}

fn default_countdown_interval_secs() -> u64 {
    1
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            sensor_interval_secs: default_sensor_interval_secs(),
            fallback_interval_secs: default_fallback_interval_secs(),
            countdown_interval_secs: default_countdown_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GraceConfig {
    #[serde(default = "default_grace_secs")]
    pub duration_secs: u64,
}

fn default_grace_secs() -> u64 {
    20
}

impl Default for GraceConfig {
    fn default() -> Self {
        Self { duration_secs: default_grace_secs() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
}

fn default_cache_ttl_secs() -> u64 {
    30
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { ttl_secs: default_cache_ttl_secs() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_breaker_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_breaker_cooldown_secs")]
    pub cooldown_secs: u64,
}

fn default_breaker_threshold() -> u32 {
    5
}

fn default_breaker_cooldown_secs() -> u64 {
    60
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_breaker_threshold(),
            cooldown_secs: default_breaker_cooldown_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SensorConfig {
    /// Readings older than this are treated as no data
    #[serde(default = "default_staleness_cutoff_secs")]
    pub staleness_cutoff_secs: u64,
}

fn default_staleness_cutoff_secs() -> u64 {
    120
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self { staleness_cutoff_secs: default_staleness_cutoff_secs() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionLogConfig {
    /// File path for finished-session egress (JSONL format)
    #[serde(default = "default_session_log_file")]
    pub file: String,
}

fn default_session_log_file() -> String {
    "sessions.jsonl".to_string()
}

impl Default for SessionLogConfig {
    fn default() -> Self {
        Self { file: default_session_log_file() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval_secs")]
    pub interval_secs: u64,
}

fn default_metrics_interval_secs() -> u64 {
    60
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval_secs() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationsConfig {
    /// Bounded channel size for dispatcher requests
    #[serde(default = "default_notify_buffer")]
    pub buffer: usize,
}

fn default_notify_buffer() -> usize {
    64
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self { buffer: default_notify_buffer() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TomlConfig {
    pub backend: BackendConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub grace: GraceConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub sensor: SensorConfig,
    #[serde(default)]
    pub session_log: SessionLogConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
}

/// Main configuration struct used throughout the engine
#[derive(Debug, Clone)]
pub struct Config {
    backend_base_url: String,
    backend_auth_token: String,
    backend_timeout_ms: u64,
    sensor_poll_interval_secs: u64,
    fallback_poll_interval_secs: u64,
    countdown_interval_secs: u64,
    grace_period_secs: u64,
    cache_ttl_secs: u64,
    breaker_failure_threshold: u32,
    breaker_cooldown_secs: u64,
    sensor_staleness_cutoff_secs: u64,
    session_log_file: String,
    metrics_interval_secs: u64,
    notify_buffer: usize,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend_base_url: "http://localhost:8000/api".to_string(),
            backend_auth_token: String::new(),
            backend_timeout_ms: default_backend_timeout_ms(),
            sensor_poll_interval_secs: default_sensor_interval_secs(),
            fallback_poll_interval_secs: default_fallback_interval_secs(),
            countdown_interval_secs: default_countdown_interval_secs(),
            grace_period_secs: default_grace_secs(),
            cache_ttl_secs: default_cache_ttl_secs(),
            breaker_failure_threshold: default_breaker_threshold(),
            breaker_cooldown_secs: default_breaker_cooldown_secs(),
            sensor_staleness_cutoff_secs: default_staleness_cutoff_secs(),
            session_log_file: default_session_log_file(),
            metrics_interval_secs: default_metrics_interval_secs(),
            notify_buffer: default_notify_buffer(),
            config_file: "default".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Ok(Self {
            backend_base_url: toml_config.backend.base_url,
            backend_auth_token: toml_config.backend.auth_token,
            backend_timeout_ms: toml_config.backend.timeout_ms,
            sensor_poll_interval_secs: toml_config.polling.sensor_interval_secs,
            fallback_poll_interval_secs: toml_config.polling.fallback_interval_secs,
            countdown_interval_secs: toml_config.polling.countdown_interval_secs,
            grace_period_secs: toml_config.grace.duration_secs,
            cache_ttl_secs: toml_config.cache.ttl_secs,
            breaker_failure_threshold: toml_config.breaker.failure_threshold,
            breaker_cooldown_secs: toml_config.breaker.cooldown_secs,
            sensor_staleness_cutoff_secs: toml_config.sensor.staleness_cutoff_secs,
            session_log_file: toml_config.session_log.file,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            notify_buffer: toml_config.notifications.buffer,
            config_file: path.display().to_string(),
        })
    }

    /// Load from a path, falling back to defaults if the file is unusable
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Self {
        match Self::from_file(&path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    path = %path.as_ref().display(),
                    error = %e,
                    "config_load_failed_using_defaults"
                );
                Self::default()
            }
        }
    }

    pub fn backend_base_url(&self) -> &str {
        &self.backend_base_url
    }

    pub fn backend_auth_token(&self) -> &str {
        &self.backend_auth_token
    }

    pub fn backend_timeout_ms(&self) -> u64 {
        self.backend_timeout_ms
    }

    pub fn sensor_poll_interval_secs(&self) -> u64 {
        self.sensor_poll_interval_secs
    }

    pub fn fallback_poll_interval_secs(&self) -> u64 {
        self.fallback_poll_interval_secs
    }

    pub fn countdown_interval_secs(&self) -> u64 {
        self.countdown_interval_secs
    }

    pub fn grace_period_secs(&self) -> u64 {
        self.grace_period_secs
    }

    pub fn cache_ttl_secs(&self) -> u64 {
        self.cache_ttl_secs
    }

    pub fn breaker_failure_threshold(&self) -> u32 {
        self.breaker_failure_threshold
    }

    pub fn breaker_cooldown_secs(&self) -> u64 {
        self.breaker_cooldown_secs
    }

    pub fn sensor_staleness_cutoff_secs(&self) -> u64 {
        self.sensor_staleness_cutoff_secs
    }

    pub fn session_log_file(&self) -> &str {
        &self.session_log_file
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn notify_buffer(&self) -> usize {
        self.notify_buffer
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    #[cfg(test)]
    pub(crate) fn set_session_log_file(&mut self, path: &str) {
        self.session_log_file = path.to_string();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.sensor_poll_interval_secs(), 8);
        assert_eq!(config.fallback_poll_interval_secs(), 30);
        assert_eq!(config.countdown_interval_secs(), 1);
        assert_eq!(config.grace_period_secs(), 20);
        assert_eq!(config.cache_ttl_secs(), 30);
        assert_eq!(config.breaker_failure_threshold(), 5);
        assert_eq!(config.breaker_cooldown_secs(), 60);
        assert_eq!(config.session_log_file(), "sessions.jsonl");
    }

    #[test]
    fn test_partial_toml_uses_section_defaults() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
[backend]
base_url = "https://parking.example.com/api"
auth_token = "tok"
"#,
        )
        .unwrap();

        assert_eq!(toml_config.backend.timeout_ms, 10_000);
        assert_eq!(toml_config.polling.sensor_interval_secs, 8);
        assert_eq!(toml_config.grace.duration_secs, 20);
        assert_eq!(toml_config.breaker.failure_threshold, 5);
    }
}
