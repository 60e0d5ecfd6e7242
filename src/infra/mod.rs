//! Infrastructure - configuration, metrics and shutdown
//!
//! This module contains infrastructure concerns:
//! - `config` - Application configuration (TOML loading, defaults)
//! - `metrics` - Lock-free metrics collection
//! - `shutdown` - Process-wide shutdown signal

pub mod config;
pub mod metrics;
pub mod shutdown;

// Re-export commonly used types
pub use config::{CameraKind, Config};
pub use metrics::{Metrics, MetricsSummary};
