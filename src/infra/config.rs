//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument (parsed by clap in main)
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml
//!
//! Tick periods are clamped to at least 1.

use crate::domain::PoleMapping;
use anyhow::Context;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraKind {
    /// JPEG snapshot fetched over HTTP (ESP32-CAM style `/capture`)
    Http,
    /// JPEG re-read from disk every cycle
    File,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
    /// Sleep between MJPEG parts per viewer
    #[serde(default = "default_stream_interval_ms")]
    pub stream_interval_ms: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_server_port(),
            stream_interval_ms: default_stream_interval_ms(),
            max_connections: default_max_connections(),
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_server_port() -> u16 {
    5000
}

fn default_stream_interval_ms() -> u64 {
    30 // ~30 fps cap per viewer
}

fn default_max_connections() -> usize {
    64
}

#[derive(Debug, Clone, Deserialize)]
pub struct VisionConfig {
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
    #[serde(default = "default_detection_interval_ms")]
    pub detection_interval_ms: u64,
    #[serde(default = "default_lost_timeout_ms")]
    pub lost_timeout_ms: u64,
    /// Pause between camera captures
    #[serde(default = "default_frame_interval_ms")]
    pub frame_interval_ms: u64,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence_threshold(),
            detection_interval_ms: default_detection_interval_ms(),
            lost_timeout_ms: default_lost_timeout_ms(),
            frame_interval_ms: default_frame_interval_ms(),
        }
    }
}

fn default_confidence_threshold() -> f32 {
    0.75
}

fn default_detection_interval_ms() -> u64 {
    500
}

fn default_lost_timeout_ms() -> u64 {
    3000
}

fn default_frame_interval_ms() -> u64 {
    33
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    #[serde(default = "default_camera_source")]
    pub source: CameraKind,
    #[serde(default = "default_camera_url")]
    pub url: String,
    #[serde(default = "default_camera_path")]
    pub path: String,
    #[serde(default = "default_http_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            source: default_camera_source(),
            url: default_camera_url(),
            path: default_camera_path(),
            timeout_ms: default_http_timeout_ms(),
        }
    }
}

fn default_camera_source() -> CameraKind {
    CameraKind::Http
}

fn default_camera_url() -> String {
    "http://192.168.4.1/capture".to_string()
}

fn default_camera_path() -> String {
    "frames/latest.jpg".to_string()
}

fn default_http_timeout_ms() -> u64 {
    2000
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClassifierConfig {
    #[serde(default = "default_classifier_url")]
    pub url: String,
    #[serde(default = "default_labels_path")]
    pub labels_path: String,
    #[serde(default = "default_http_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            url: default_classifier_url(),
            labels_path: default_labels_path(),
            timeout_ms: default_http_timeout_ms(),
        }
    }
}

fn default_classifier_url() -> String {
    "http://127.0.0.1:8501/classify".to_string()
}

fn default_labels_path() -> String {
    "labels.json".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct SerialConfig {
    /// Explicit device; auto-discovery when absent
    #[serde(default)]
    pub port: Option<String>,
    #[serde(default = "default_serial_baud")]
    pub baud: u32,
    #[serde(default = "default_warmup_ms")]
    pub warmup_ms: u64,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,
    /// USB bridge chip identifiers matched against port descriptions
    #[serde(default = "default_chip_signatures")]
    pub chip_signatures: Vec<String>,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud: default_serial_baud(),
            warmup_ms: default_warmup_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            retry_backoff_ms: default_retry_backoff_ms(),
            retry_budget: default_retry_budget(),
            chip_signatures: default_chip_signatures(),
        }
    }
}

fn default_serial_baud() -> u32 {
    115200
}

fn default_warmup_ms() -> u64 {
    4000
}

fn default_read_timeout_ms() -> u64 {
    2000
}

fn default_retry_backoff_ms() -> u64 {
    2000
}

fn default_retry_budget() -> u32 {
    5
}

fn default_chip_signatures() -> Vec<String> {
    vec!["USB".to_string(), "CH340".to_string(), "CP210".to_string()]
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct PolesConfig {
    /// LED channel index to pole id (e.g., "0" = "P-01")
    #[serde(default)]
    pub mapping: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HubConfig {
    /// Per-subscriber queue depth before events are dropped
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self { subscriber_buffer: default_subscriber_buffer() }
    }
}

fn default_subscriber_buffer() -> usize {
    256
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval() }
    }
}

fn default_metrics_interval() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub vision: VisionConfig,
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default)]
    pub poles: PolesConfig,
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    bind_address: String,
    server_port: u16,
    stream_interval_ms: u64,
    max_connections: usize,
    confidence_threshold: f32,
    detection_interval_ms: u64,
    lost_timeout_ms: u64,
    frame_interval_ms: u64,
    camera_kind: CameraKind,
    camera_url: String,
    camera_path: String,
    camera_timeout_ms: u64,
    classifier_url: String,
    labels_path: String,
    classifier_timeout_ms: u64,
    serial_port: Option<String>,
    serial_baud: u32,
    serial_warmup_ms: u64,
    serial_read_timeout_ms: u64,
    serial_retry_backoff_ms: u64,
    serial_retry_budget: u32,
    chip_signatures: Vec<String>,
    poles: PoleMapping,
    subscriber_buffer: usize,
    metrics_interval_secs: u64,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default(), "default".to_string())
    }
}

impl Config {
    /// Determine config file path from the command line value or environment
    pub fn resolve_config_path(cli_path: Option<String>) -> String {
        if let Some(path) = cli_path.filter(|p| !p.trim().is_empty()) {
            return path;
        }

        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        "config/dev.toml".to_string()
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Ok(Self::from_toml(toml_config, path.display().to_string()))
    }

    /// Load configuration from `path`, falling back to defaults
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %format!("{e:#}"), path = %path, "config_load_failed_using_defaults");
                Self::default()
            }
        }
    }

    fn from_toml(toml_config: TomlConfig, config_file: String) -> Self {
        let poles = Self::parse_pole_mapping(toml_config.poles.mapping);

        Self {
            bind_address: toml_config.server.bind_address,
            server_port: toml_config.server.port,
            stream_interval_ms: toml_config.server.stream_interval_ms.max(1),
            max_connections: toml_config.server.max_connections,
            confidence_threshold: toml_config.vision.confidence_threshold,
            detection_interval_ms: toml_config.vision.detection_interval_ms,
            lost_timeout_ms: toml_config.vision.lost_timeout_ms,
            frame_interval_ms: toml_config.vision.frame_interval_ms.max(1),
            camera_kind: toml_config.camera.source,
            camera_url: toml_config.camera.url,
            camera_path: toml_config.camera.path,
            camera_timeout_ms: toml_config.camera.timeout_ms,
            classifier_url: toml_config.classifier.url,
            labels_path: toml_config.classifier.labels_path,
            classifier_timeout_ms: toml_config.classifier.timeout_ms,
            serial_port: toml_config.serial.port.filter(|p| !p.trim().is_empty()),
            serial_baud: toml_config.serial.baud,
            serial_warmup_ms: toml_config.serial.warmup_ms,
            serial_read_timeout_ms: toml_config.serial.read_timeout_ms,
            serial_retry_backoff_ms: toml_config.serial.retry_backoff_ms,
            serial_retry_budget: toml_config.serial.retry_budget,
            chip_signatures: toml_config.serial.chip_signatures,
            poles,
            subscriber_buffer: toml_config.hub.subscriber_buffer.max(1),
            metrics_interval_secs: toml_config.metrics.interval_secs.max(1),
            config_file,
        }
    }

    /// Convert string keys to channel indices; an empty table keeps the default poles
    fn parse_pole_mapping(raw: HashMap<String, String>) -> PoleMapping {
        if raw.is_empty() {
            return PoleMapping::default();
        }

        let mut poles = BTreeMap::new();
        for (key, value) in raw {
            match key.trim().parse::<u32>() {
                Ok(index) => {
                    poles.insert(index, value);
                }
                Err(_) => warn!(key = %key, "config_invalid_pole_index"),
            }
        }
        PoleMapping::new(poles)
    }

    // Getters for all config fields
    pub fn bind_address(&self) -> &str {
        &self.bind_address
    }

    pub fn server_port(&self) -> u16 {
        self.server_port
    }

    pub fn stream_interval(&self) -> Duration {
        Duration::from_millis(self.stream_interval_ms)
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    pub fn confidence_threshold(&self) -> f32 {
        self.confidence_threshold
    }

    pub fn detection_interval(&self) -> Duration {
        Duration::from_millis(self.detection_interval_ms)
    }

    pub fn lost_timeout(&self) -> Duration {
        Duration::from_millis(self.lost_timeout_ms)
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }

    pub fn camera_kind(&self) -> &CameraKind {
        &self.camera_kind
    }

    pub fn camera_url(&self) -> &str {
        &self.camera_url
    }

    pub fn camera_path(&self) -> &str {
        &self.camera_path
    }

    pub fn camera_timeout(&self) -> Duration {
        Duration::from_millis(self.camera_timeout_ms)
    }

    pub fn classifier_url(&self) -> &str {
        &self.classifier_url
    }

    pub fn labels_path(&self) -> &str {
        &self.labels_path
    }

    pub fn classifier_timeout(&self) -> Duration {
        Duration::from_millis(self.classifier_timeout_ms)
    }

    pub fn serial_port(&self) -> Option<&str> {
        self.serial_port.as_deref()
    }

    pub fn serial_baud(&self) -> u32 {
        self.serial_baud
    }

    pub fn serial_warmup(&self) -> Duration {
        Duration::from_millis(self.serial_warmup_ms)
    }

    pub fn serial_read_timeout(&self) -> Duration {
        Duration::from_millis(self.serial_read_timeout_ms)
    }

    pub fn serial_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.serial_retry_backoff_ms)
    }

    pub fn serial_retry_budget(&self) -> u32 {
        self.serial_retry_budget
    }

    pub fn chip_signatures(&self) -> &[String] {
        &self.chip_signatures
    }

    pub fn poles(&self) -> &PoleMapping {
        &self.poles
    }

    pub fn subscriber_buffer(&self) -> usize {
        self.subscriber_buffer
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server_port(), 5000);
        assert_eq!(config.confidence_threshold(), 0.75);
        assert_eq!(config.detection_interval(), Duration::from_millis(500));
        assert_eq!(config.lost_timeout(), Duration::from_secs(3));
        assert_eq!(config.serial_baud(), 115200);
        assert_eq!(config.serial_port(), None);
        assert_eq!(config.chip_signatures(), &["USB", "CH340", "CP210"]);
        assert_eq!(config.poles(), &PoleMapping::default());
        assert_eq!(config.camera_kind(), &CameraKind::Http);
    }

    #[test]
    fn test_resolve_config_path_default() {
        if env::var("CONFIG_FILE").is_err() {
            assert_eq!(Config::resolve_config_path(None), "config/dev.toml");
        }
    }

    #[test]
    fn test_resolve_config_path_prefers_cli_value() {
        assert_eq!(
            Config::resolve_config_path(Some("config/site.toml".to_string())),
            "config/site.toml"
        );
    }

    #[test]
    fn test_resolve_config_path_ignores_blank_cli_value() {
        if env::var("CONFIG_FILE").is_err() {
            assert_eq!(Config::resolve_config_path(Some("  ".to_string())), "config/dev.toml");
        }
    }

    #[test]
    fn test_zero_tick_periods_are_clamped() {
        let toml_config: TomlConfig = toml::from_str(
            "[server]\nstream_interval_ms = 0\n[vision]\nframe_interval_ms = 0\n[metrics]\ninterval_secs = 0\n",
        )
        .unwrap();
        let config = Config::from_toml(toml_config, "inline".to_string());
        assert_eq!(config.stream_interval(), Duration::from_millis(1));
        assert_eq!(config.frame_interval(), Duration::from_millis(1));
        assert_eq!(config.metrics_interval_secs(), 1);
    }

    #[test]
    fn test_pole_mapping_skips_bad_keys() {
        let raw = HashMap::from([
            ("1".to_string(), "P-B".to_string()),
            ("zero".to_string(), "P-X".to_string()),
            ("0".to_string(), "P-A".to_string()),
        ]);
        let mapping = Config::parse_pole_mapping(raw);
        assert_eq!(mapping.len(), 2);
        assert_eq!(mapping.pole_ids().collect::<Vec<_>>(), vec!["P-A", "P-B"]);
    }

    #[test]
    fn test_blank_serial_port_means_discovery() {
        let toml_config: TomlConfig = toml::from_str("[serial]\nport = \"  \"\n").unwrap();
        let config = Config::from_toml(toml_config, "inline".to_string());
        assert_eq!(config.serial_port(), None);
    }
}
