//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `serial` - ESP32 serial line source with port auto-discovery
//! - `protocol` - Serial line decoding into domain events
//! - `camera` - JPEG frame sources (HTTP snapshot, file)
//! - `classifier` - Remote face classifier and label map
//! - `wire` - JSON envelope for live event subscribers
//! - `http_server` - MJPEG stream, WebSocket events, health and metrics
//! - `prometheus` - Prometheus text formatting

pub mod camera;
pub mod classifier;
pub mod http_server;
pub mod prometheus;
pub mod protocol;
pub mod serial;
pub mod wire;

// Re-export commonly used types
pub use camera::{CameraError, CapturedFrame, FrameSource};
pub use classifier::{Classifier, ClassifierError, HttpClassifier, LabelMap, Prediction};
pub use http_server::HttpServer;
pub use protocol::{DecodeError, ProtocolDecoder};
pub use serial::{SerialConnection, SerialError, SerialSettings};
