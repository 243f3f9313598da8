//! HTTP client for the plate recognition service
//!
//! `POST {url}/detect` with the frame as multipart field `image`. The service
//! answers `{found, text, confidence, cropped_image}`; `cropped_image` may be
//! plain base64 or a data URL.

use crate::domain::pass::decode_image;
use crate::infra::config::Config;
use crate::services::recognition::{Detection, PlateRecognizer};
use anyhow::{bail, Context};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::multipart;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Wire shape of a `/detect` response
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct DetectResponse {
    pub found: bool,
    pub text: Option<String>,
    pub confidence: Option<f32>,
    pub cropped_image: Option<String>,
}

impl DetectResponse {
    /// Convert to a `Detection`. An undecodable crop is dropped, not fatal.
    pub fn into_detection(self) -> Detection {
        let cropped_image = self.cropped_image.filter(|s| !s.trim().is_empty()).and_then(|raw| {
            decode_image(&raw)
                .inspect_err(|e| warn!(error = %e, "recognizer_crop_undecodable"))
                .ok()
        });
        Detection {
            found: self.found,
            text: self.text.unwrap_or_default(),
            confidence: self.confidence.unwrap_or(0.0),
            cropped_image,
        }
    }
}

pub struct HttpPlateRecognizer {
    detect_url: String,
    client: reqwest::Client,
}

impl HttpPlateRecognizer {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        // Create HTTP client once for reuse (connection pooling)
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .http1_only()
            .build()
            .context("Failed to build recognizer HTTP client")?;
        let detect_url = format!("{}/detect", base_url.trim_end_matches('/'));
        info!(url = %detect_url, "plate_recognizer_configured");
        Ok(Self { detect_url, client })
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Self::new(config.recognizer_url(), config.per_attempt_timeout())
    }
}

#[async_trait]
impl PlateRecognizer for HttpPlateRecognizer {
    async fn recognize(&self, image: Bytes) -> anyhow::Result<Detection> {
        let size = image.len();
        let part = multipart::Part::bytes(image.to_vec()).file_name("capture.jpg").mime_str("image/jpeg")?;
        let form = multipart::Form::new().part("image", part);

        let response = self
            .client
            .post(&self.detect_url)
            .multipart(form)
            .send()
            .await
            .context("recognizer request failed")?;

        let status = response.status();
        if !status.is_success() {
            bail!("recognizer returned HTTP {status}");
        }

        let body: DetectResponse = response.json().await.context("invalid recognizer response")?;
        let detection = body.into_detection();
        debug!(
            bytes = %size,
            found = %detection.found,
            text = %detection.text,
            confidence = %detection.confidence,
            "plate_recognizer_response"
        );
        Ok(detection)
    }
}
