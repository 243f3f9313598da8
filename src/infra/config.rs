//! Configuration loading from TOML files
//!
//! Config file is selected via the `--config <path>` argument
//! (default: config/dev.toml). Missing sections fall back to defaults.

use anyhow::Context;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SiteConfig {
    /// Unique site identifier, used as the metrics label
    #[serde(default = "default_site_id")]
    pub id: String,
}

fn default_site_id() -> String {
    "gatepass".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
    /// Request body limit (images travel base64-encoded)
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_server_port() -> u16 {
    8080
}

fn default_max_body_bytes() -> usize {
    16 * 1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_server_port(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct StoreConfig {
    /// Pass journal (JSONL). Unset keeps passes in memory only.
    #[serde(default)]
    pub journal_file: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EntryCodeConfig {
    #[serde(default = "default_code_length")]
    pub length: usize,
    /// Consecutive collisions tolerated before giving up
    #[serde(default = "default_code_attempts")]
    pub max_generation_attempts: u32,
}

fn default_code_length() -> usize {
    6
}

fn default_code_attempts() -> u32 {
    64
}

impl Default for EntryCodeConfig {
    fn default() -> Self {
        Self { length: default_code_length(), max_generation_attempts: default_code_attempts() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecognitionConfig {
    /// Base URL of the plate recognition service (`/detect` is appended)
    #[serde(default = "default_recognizer_url")]
    pub url: String,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_inter_attempt_delay_ms")]
    pub inter_attempt_delay_ms: u64,
    #[serde(default = "default_per_attempt_timeout_ms")]
    pub per_attempt_timeout_ms: u64,
    /// Hits below this confidence count as misses (unset: first hit wins)
    #[serde(default)]
    pub min_confidence: Option<f32>,
}

fn default_recognizer_url() -> String {
    "http://127.0.0.1:5000".to_string()
}

fn default_max_attempts() -> u32 {
    5
}

fn default_inter_attempt_delay_ms() -> u64 {
    700
}

fn default_per_attempt_timeout_ms() -> u64 {
    10_000
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            url: default_recognizer_url(),
            max_attempts: default_max_attempts(),
            inter_attempt_delay_ms: default_inter_attempt_delay_ms(),
            per_attempt_timeout_ms: default_per_attempt_timeout_ms(),
            min_confidence: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    /// Snapshot URL of the checkpoint camera. Unset disables server-side scans.
    #[serde(default)]
    pub snapshot_url: Option<String>,
    #[serde(default = "default_camera_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_camera_timeout_ms() -> u64 {
    3000
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self { snapshot_url: None, timeout_ms: default_camera_timeout_ms() }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AuthConfig {
    /// Bearer tokens granted the checkpoint capability
    #[serde(default)]
    pub checkpoint_tokens: Vec<String>,
    /// Bearer tokens granted admin (and checkpoint) capability
    #[serde(default)]
    pub admin_tokens: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotifyConfig {
    /// Upper bound for a guest status long-poll
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_max_wait_ms() -> u64 {
    30_000
}

fn default_channel_capacity() -> usize {
    256
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self { max_wait_ms: default_max_wait_ms(), channel_capacity: default_channel_capacity() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_mqtt_host")]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Status changes go to `<topic_prefix>/<entry_code>`
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_topic_prefix() -> String {
    "gatepass/status".to_string()
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            username: None,
            password: None,
            topic_prefix: default_topic_prefix(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,
}

fn default_metrics_interval() -> u64 {
    60
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval() }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub entry_code: EntryCodeConfig,
    #[serde(default)]
    pub recognition: RecognitionConfig,
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    bind_address: String,
    server_port: u16,
    max_body_bytes: usize,
    journal_file: Option<String>,
    code_length: usize,
    code_max_attempts: u32,
    recognizer_url: String,
    recognition_max_attempts: u32,
    inter_attempt_delay_ms: u64,
    per_attempt_timeout_ms: u64,
    min_confidence: Option<f32>,
    camera_snapshot_url: Option<String>,
    camera_timeout_ms: u64,
    checkpoint_tokens: Vec<String>,
    admin_tokens: Vec<String>,
    status_max_wait_ms: u64,
    notify_capacity: usize,
    mqtt_enabled: bool,
    mqtt_host: String,
    mqtt_port: u16,
    mqtt_username: Option<String>,
    mqtt_password: Option<String>,
    mqtt_topic_prefix: String,
    metrics_interval_secs: u64,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default(), "default")
    }
}

impl Config {
    fn from_toml(toml_config: TomlConfig, config_file: &str) -> Self {
        Self {
            site_id: toml_config.site.id,
            bind_address: toml_config.server.bind_address,
            server_port: toml_config.server.port,
            max_body_bytes: toml_config.server.max_body_bytes,
            journal_file: toml_config.store.journal_file,
            code_length: toml_config.entry_code.length,
            code_max_attempts: toml_config.entry_code.max_generation_attempts,
            recognizer_url: toml_config.recognition.url,
            recognition_max_attempts: toml_config.recognition.max_attempts,
            inter_attempt_delay_ms: toml_config.recognition.inter_attempt_delay_ms,
            per_attempt_timeout_ms: toml_config.recognition.per_attempt_timeout_ms,
            min_confidence: toml_config.recognition.min_confidence,
            camera_snapshot_url: toml_config.camera.snapshot_url,
            camera_timeout_ms: toml_config.camera.timeout_ms,
            checkpoint_tokens: toml_config.auth.checkpoint_tokens,
            admin_tokens: toml_config.auth.admin_tokens,
            status_max_wait_ms: toml_config.notify.max_wait_ms,
            notify_capacity: toml_config.notify.channel_capacity,
            mqtt_enabled: toml_config.mqtt.enabled,
            mqtt_host: toml_config.mqtt.host,
            mqtt_port: toml_config.mqtt.port,
            mqtt_username: toml_config.mqtt.username,
            mqtt_password: toml_config.mqtt.password,
            mqtt_topic_prefix: toml_config.mqtt.topic_prefix,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            config_file: config_file.to_string(),
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        let config = Self::from_toml(toml_config, &path.display().to_string());
        config.validate().with_context(|| format!("Invalid config file {}", path.display()))?;
        Ok(config)
    }

    /// Load configuration. Only a missing file falls back to defaults; a
    /// file that exists but fails to parse or validate is an error.
    pub fn load_from_path(path: &str) -> anyhow::Result<Self> {
        if !Path::new(path).exists() {
            warn!(config_file = %path, "config_file_missing_using_defaults");
            return Ok(Self::default());
        }
        Self::from_file(path)
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            (4..=12).contains(&self.code_length),
            "entry_code.length must be between 4 and 12, got {}",
            self.code_length
        );
        anyhow::ensure!(self.code_max_attempts > 0, "entry_code.max_generation_attempts must be > 0");
        anyhow::ensure!(self.recognition_max_attempts > 0, "recognition.max_attempts must be > 0");
        anyhow::ensure!(
            self.per_attempt_timeout_ms > 0,
            "recognition.per_attempt_timeout_ms must be > 0"
        );
        anyhow::ensure!(self.metrics_interval_secs > 0, "metrics.interval_secs must be > 0");
        if let Some(min) = self.min_confidence {
            anyhow::ensure!(
                (0.0..=1.0).contains(&min),
                "recognition.min_confidence must be within 0.0..=1.0, got {min}"
            );
        }
        Ok(())
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn bind_address(&self) -> &str {
        &self.bind_address
    }

    pub fn server_port(&self) -> u16 {
        self.server_port
    }

    pub fn max_body_bytes(&self) -> usize {
        self.max_body_bytes
    }

    pub fn journal_file(&self) -> Option<&str> {
        self.journal_file.as_deref()
    }

    pub fn code_length(&self) -> usize {
        self.code_length
    }

    pub fn code_max_attempts(&self) -> u32 {
        self.code_max_attempts
    }

    pub fn recognizer_url(&self) -> &str {
        &self.recognizer_url
    }

    pub fn recognition_max_attempts(&self) -> u32 {
        self.recognition_max_attempts
    }

    pub fn inter_attempt_delay(&self) -> Duration {
        Duration::from_millis(self.inter_attempt_delay_ms)
    }

    pub fn per_attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.per_attempt_timeout_ms)
    }

    pub fn min_confidence(&self) -> Option<f32> {
        self.min_confidence
    }

    pub fn camera_snapshot_url(&self) -> Option<&str> {
        self.camera_snapshot_url.as_deref()
    }

    pub fn camera_timeout(&self) -> Duration {
        Duration::from_millis(self.camera_timeout_ms)
    }

    pub fn checkpoint_tokens(&self) -> &[String] {
        &self.checkpoint_tokens
    }

    pub fn admin_tokens(&self) -> &[String] {
        &self.admin_tokens
    }

    pub fn status_max_wait(&self) -> Duration {
        Duration::from_millis(self.status_max_wait_ms)
    }

    pub fn notify_capacity(&self) -> usize {
        self.notify_capacity
    }

    pub fn mqtt_enabled(&self) -> bool {
        self.mqtt_enabled
    }

    pub fn mqtt_host(&self) -> &str {
        &self.mqtt_host
    }

    pub fn mqtt_port(&self) -> u16 {
        self.mqtt_port
    }

    pub fn mqtt_username(&self) -> Option<&str> {
        self.mqtt_username.as_deref()
    }

    pub fn mqtt_password(&self) -> Option<&str> {
        self.mqtt_password.as_deref()
    }

    pub fn mqtt_topic_prefix(&self) -> &str {
        &self.mqtt_topic_prefix
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Builder method for tests to point the registry at a journal
    pub fn with_journal_file(mut self, path: &str) -> Self {
        self.journal_file = Some(path.to_string());
        self
    }

    /// Builder method for tests to shorten the scan loop
    pub fn with_recognition_timing(mut self, delay_ms: u64, timeout_ms: u64) -> Self {
        self.inter_attempt_delay_ms = delay_ms;
        self.per_attempt_timeout_ms = timeout_ms;
        self
    }

    /// Builder method for tests to install bearer tokens
    pub fn with_tokens(mut self, checkpoint: &[&str], admin: &[&str]) -> Self {
        self.checkpoint_tokens = checkpoint.iter().map(|t| t.to_string()).collect();
        self.admin_tokens = admin.iter().map(|t| t.to_string()).collect();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.site_id(), "gatepass");
        assert_eq!(config.server_port(), 8080);
        assert_eq!(config.code_length(), 6);
        assert_eq!(config.recognition_max_attempts(), 5);
        assert_eq!(config.inter_attempt_delay(), Duration::from_millis(700));
        assert_eq!(config.per_attempt_timeout(), Duration::from_secs(10));
        assert_eq!(config.min_confidence(), None);
        assert!(config.journal_file().is_none());
        assert!(!config.mqtt_enabled());
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let toml_config: TomlConfig = toml::from_str("").unwrap();
        let config = Config::from_toml(toml_config, "inline");
        assert_eq!(config.recognizer_url(), "http://127.0.0.1:5000");
        assert_eq!(config.mqtt_topic_prefix(), "gatepass/status");
        assert_eq!(config.status_max_wait(), Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_code_length() {
        let toml_config: TomlConfig = toml::from_str("[entry_code]\nlength = 2\n").unwrap();
        let config = Config::from_toml(toml_config, "inline");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_out_of_range_confidence() {
        let toml_config: TomlConfig =
            toml::from_str("[recognition]\nmin_confidence = 1.5\n").unwrap();
        let config = Config::from_toml(toml_config, "inline");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_builders() {
        let config = Config::default()
            .with_journal_file("/tmp/passes.jsonl")
            .with_recognition_timing(5, 50)
            .with_tokens(&["guard"], &["boss"]);
        assert_eq!(config.journal_file(), Some("/tmp/passes.jsonl"));
        assert_eq!(config.inter_attempt_delay(), Duration::from_millis(5));
        assert_eq!(config.checkpoint_tokens(), &["guard".to_string()]);
        assert_eq!(config.admin_tokens(), &["boss".to_string()]);
    }
}
