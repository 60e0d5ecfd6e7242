//! Face classifier adapter
//!
//! The model runs out of process behind an HTTP endpoint. The bridge POSTs
//! the captured JPEG and gets back one probability per label index:
//!
//! ```text
//! POST <url>   Content-Type: image/jpeg
//! 200 OK       {"probabilities": [0.01, 0.93, 0.06]}
//! ```
//!
//! Index-to-name resolution uses the model's `labels.json` (`{"name": index}`).

use crate::infra::config::Config;
use crate::io::camera::CapturedFrame;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("failed to load labels from {path}: {reason}")]
    Labels { path: String, reason: String },

    #[error("classifier request failed: {0}")]
    Request(String),

    #[error("invalid classifier response: {0}")]
    InvalidResponse(String),
}

/// Top-1 result of one classification
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub label: String,
    pub confidence: f32,
}

#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, frame: &CapturedFrame) -> Result<Prediction, ClassifierError>;
}

/// Index to label name, dense from 0
#[derive(Debug, Clone, PartialEq)]
pub struct LabelMap {
    names: Vec<String>,
}

impl LabelMap {
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { names: names.into_iter().map(Into::into).collect() }
    }

    /// Parse `{"name": index, ...}`; indices must cover `0..n` exactly once
    pub fn from_json(text: &str) -> Result<Self, String> {
        let by_name: HashMap<String, usize> =
            serde_json::from_str(text).map_err(|e| e.to_string())?;

        let mut names: Vec<Option<String>> = vec![None; by_name.len()];
        for (name, index) in by_name {
            let slot = names
                .get_mut(index)
                .ok_or_else(|| format!("index {index} for {name:?} out of range"))?;
            if let Some(existing) = slot.replace(name.clone()) {
                return Err(format!("index {index} used by both {existing:?} and {name:?}"));
            }
        }

        // No gaps possible: n distinct indices below n
        Ok(Self { names: names.into_iter().flatten().collect() })
    }

    pub fn load(path: &Path) -> Result<Self, ClassifierError> {
        let labels_error =
            |reason: String| ClassifierError::Labels { path: path.display().to_string(), reason };
        let text = std::fs::read_to_string(path).map_err(|e| labels_error(e.to_string()))?;
        Self::from_json(&text).map_err(labels_error)
    }

    pub fn name(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Highest finite probability, mapped to its label
    pub fn argmax(&self, probabilities: &[f32]) -> Result<Prediction, ClassifierError> {
        if probabilities.len() != self.names.len() {
            return Err(ClassifierError::InvalidResponse(format!(
                "expected {} probabilities, got {}",
                self.names.len(),
                probabilities.len()
            )));
        }

        let (index, confidence) = probabilities
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, p)| p.is_finite())
            .fold(None, |best: Option<(usize, f32)>, (i, p)| match best {
                Some((_, best_p)) if best_p >= p => best,
                _ => Some((i, p)),
            })
            .ok_or_else(|| ClassifierError::InvalidResponse("no finite probability".to_string()))?;

        Ok(Prediction { label: self.names[index].clone(), confidence })
    }
}

#[derive(Debug, Deserialize)]
struct ClassifyResponse {
    probabilities: Vec<f32>,
}

/// Remote model endpoint
pub struct HttpClassifier {
    url: String,
    client: reqwest::Client,
    labels: LabelMap,
}

impl HttpClassifier {
    pub fn new(url: &str, labels: LabelMap, timeout: Duration) -> Result<Self, ClassifierError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClassifierError::Request(e.to_string()))?;
        Ok(Self { url: url.to_string(), client, labels })
    }

    /// Load labels and build the client from config
    pub fn from_config(config: &Config) -> Result<Self, ClassifierError> {
        let labels = LabelMap::load(Path::new(config.labels_path()))?;
        info!(
            url = %config.classifier_url(),
            labels = %labels.len(),
            "classifier_configured"
        );
        Self::new(config.classifier_url(), labels, config.classifier_timeout())
    }

    pub fn labels(&self) -> &LabelMap {
        &self.labels
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    async fn classify(&self, frame: &CapturedFrame) -> Result<Prediction, ClassifierError> {
        let response = self
            .client
            .post(&self.url)
            .header("Content-Type", "image/jpeg")
            .body(frame.jpeg.clone())
            .send()
            .await
            .map_err(|e| ClassifierError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ClassifierError::Request(format!("HTTP {status}")));
        }

        let bytes = response.bytes().await.map_err(|e| ClassifierError::Request(e.to_string()))?;
        let body: ClassifyResponse = serde_json::from_slice(&bytes)
            .map_err(|e| ClassifierError::InvalidResponse(e.to_string()))?;

        self.labels.argmax(&body.probabilities)
    }
}
