//! Camera frame sources
//!
//! The bridge never decodes images: a source yields one JPEG per capture and
//! the bytes go unchanged to the frame buffer and the classifier.
//!
//! - `HttpSnapshotSource` - GET a snapshot URL (ESP32-CAM `/capture` style)
//! - `FileFrameSource` - re-read a JPEG from disk every cycle (bench / dev)

use crate::infra::config::{CameraKind, Config};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};

/// JPEG start-of-image marker
const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];

#[derive(Debug, Error)]
pub enum CameraError {
    /// Source cannot be used at all (startup)
    #[error("camera {source_name} unavailable: {reason}")]
    Unavailable { source_name: String, reason: String },

    /// One capture failed; later captures may succeed
    #[error("capture failed: {0}")]
    Capture(String),
}

/// One encoded frame as captured
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub jpeg: Bytes,
    pub captured_at: Instant,
}

impl CapturedFrame {
    pub fn new(jpeg: Bytes) -> Self {
        Self { jpeg, captured_at: Instant::now() }
    }
}

#[async_trait]
pub trait FrameSource: Send {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Probe the source once before the capture loop starts
    async fn open(&mut self) -> Result<(), CameraError>;

    async fn capture(&mut self) -> Result<CapturedFrame, CameraError>;
}

fn check_jpeg(bytes: Bytes) -> Result<Bytes, CameraError> {
    if bytes.starts_with(&JPEG_SOI) {
        Ok(bytes)
    } else {
        Err(CameraError::Capture(format!("not a JPEG ({} bytes)", bytes.len())))
    }
}

/// Snapshot over HTTP
pub struct HttpSnapshotSource {
    url: String,
    client: reqwest::Client,
}

impl HttpSnapshotSource {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, CameraError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .http1_only()
            .build()
            .map_err(|e| CameraError::Unavailable {
                source_name: url.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self { url: url.to_string(), client })
    }

    async fn fetch(&self) -> Result<Bytes, CameraError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| CameraError::Capture(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CameraError::Capture(format!("HTTP {status}")));
        }

        let body = response.bytes().await.map_err(|e| CameraError::Capture(e.to_string()))?;
        check_jpeg(body)
    }
}

#[async_trait]
impl FrameSource for HttpSnapshotSource {
    fn name(&self) -> &str {
        &self.url
    }

    async fn open(&mut self) -> Result<(), CameraError> {
        let frame = self.fetch().await.map_err(|e| CameraError::Unavailable {
            source_name: self.url.clone(),
            reason: e.to_string(),
        })?;
        info!(url = %self.url, bytes = %frame.len(), "camera_http_opened");
        Ok(())
    }

    async fn capture(&mut self) -> Result<CapturedFrame, CameraError> {
        let jpeg = self.fetch().await?;
        debug!(bytes = %jpeg.len(), "camera_frame_captured");
        Ok(CapturedFrame::new(jpeg))
    }
}

/// JPEG file re-read on every capture
pub struct FileFrameSource {
    path: PathBuf,
    name: String,
}

impl FileFrameSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path.display().to_string();
        Self { path, name }
    }

    async fn read(&self) -> Result<Bytes, CameraError> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|e| CameraError::Capture(format!("{}: {e}", self.name)))?;
        check_jpeg(Bytes::from(bytes))
    }
}

#[async_trait]
impl FrameSource for FileFrameSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&mut self) -> Result<(), CameraError> {
        self.read().await.map_err(|e| CameraError::Unavailable {
            source_name: self.name.clone(),
            reason: e.to_string(),
        })?;
        info!(path = %self.name, "camera_file_opened");
        Ok(())
    }

    async fn capture(&mut self) -> Result<CapturedFrame, CameraError> {
        Ok(CapturedFrame::new(self.read().await?))
    }
}

/// Build the configured frame source
pub fn from_config(config: &Config) -> Result<Box<dyn FrameSource>, CameraError> {
    match config.camera_kind() {
        CameraKind::Http => {
            Ok(Box::new(HttpSnapshotSource::new(config.camera_url(), config.camera_timeout())?))
        }
        CameraKind::File => Ok(Box::new(FileFrameSource::new(config.camera_path()))),
    }
}
