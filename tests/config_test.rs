//! Integration tests for configuration loading

use presence_bridge::domain::PoleMapping;
use presence_bridge::infra::{CameraKind, Config};
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

#[test]
fn test_load_config_from_file() {
    let mut temp_file = NamedTempFile::new().unwrap();

    let config_content = r#"
[server]
bind_address = "127.0.0.1"
port = 8080
stream_interval_ms = 50
max_connections = 8

[vision]
confidence_threshold = 0.8
detection_interval_ms = 250
lost_timeout_ms = 5000

[camera]
source = "file"
path = "frames/test.jpg"

[classifier]
url = "http://inference.local/classify"
labels_path = "models/labels.json"

[serial]
port = "/dev/ttyUSB3"
baud = 9600
retry_budget = 2
chip_signatures = ["CH340"]

[poles]
mapping = { "0" = "N-1", "4" = "N-5" }

[hub]
subscriber_buffer = 16

[metrics]
interval_secs = 15
"#;

    temp_file.write_all(config_content.as_bytes()).unwrap();
    temp_file.flush().unwrap();

    let config = Config::from_file(temp_file.path()).unwrap();

    assert_eq!(config.bind_address(), "127.0.0.1");
    assert_eq!(config.server_port(), 8080);
    assert_eq!(config.stream_interval(), Duration::from_millis(50));
    assert_eq!(config.max_connections(), 8);
    assert_eq!(config.confidence_threshold(), 0.8);
    assert_eq!(config.detection_interval(), Duration::from_millis(250));
    assert_eq!(config.lost_timeout(), Duration::from_secs(5));
    assert_eq!(config.camera_kind(), &CameraKind::File);
    assert_eq!(config.camera_path(), "frames/test.jpg");
    assert_eq!(config.classifier_url(), "http://inference.local/classify");
    assert_eq!(config.labels_path(), "models/labels.json");
    assert_eq!(config.serial_port(), Some("/dev/ttyUSB3"));
    assert_eq!(config.serial_baud(), 9600);
    assert_eq!(config.serial_retry_budget(), 2);
    assert_eq!(config.chip_signatures(), &["CH340"]);
    assert_eq!(config.poles(), &PoleMapping::from_pairs([(0, "N-1"), (4, "N-5")]));
    assert_eq!(config.subscriber_buffer(), 16);
    assert_eq!(config.metrics_interval_secs(), 15);
}

#[test]
fn test_partial_file_keeps_defaults() {
    let mut temp_file = NamedTempFile::new().unwrap();
    temp_file.write_all(b"[vision]\nlost_timeout_ms = 1000\n").unwrap();
    temp_file.flush().unwrap();

    let config = Config::from_file(temp_file.path()).unwrap();

    assert_eq!(config.lost_timeout(), Duration::from_secs(1));
    assert_eq!(config.confidence_threshold(), 0.75);
    assert_eq!(config.server_port(), 5000);
    assert_eq!(config.serial_port(), None);
    assert_eq!(config.poles(), &PoleMapping::default());
}

#[test]
fn test_invalid_file_is_error() {
    let mut temp_file = NamedTempFile::new().unwrap();
    temp_file.write_all(b"[server\nport = ").unwrap();
    temp_file.flush().unwrap();

    assert!(Config::from_file(temp_file.path()).is_err());
}

#[test]
fn test_load_from_path_fallback() {
    let config = Config::load_from_path("/nonexistent/config.toml");
    assert_eq!(config.server_port(), 5000);
    assert_eq!(config.serial_baud(), 115200);
    assert_eq!(config.camera_kind(), &CameraKind::Http);
    assert_eq!(config.config_file(), "default");
}

#[test]
fn test_zero_intervals_are_clamped() {
    let mut temp_file = NamedTempFile::new().unwrap();
    temp_file
        .write_all(b"[server]\nstream_interval_ms = 0\n\n[vision]\nframe_interval_ms = 0\n\n[metrics]\ninterval_secs = 0\n")
        .unwrap();
    temp_file.flush().unwrap();

    let config = Config::from_file(temp_file.path()).unwrap();

    assert_eq!(config.stream_interval(), Duration::from_millis(1));
    assert_eq!(config.frame_interval(), Duration::from_millis(1));
    assert_eq!(config.metrics_interval_secs(), 1);
}
