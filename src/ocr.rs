//! OCR client and batch driver.
//!
//! A single trait seam over the external OCR provider, plus an
//! order-preserving batch runner. The batch runs through a bounded worker
//! pool — size 1 by default, which keeps the provider-friendly sequential
//! behavior — and tolerates per-page failures by substituting an empty
//! string instead of aborting, so callers always get one entry per input.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use tracing::warn;

use crate::config::OcrConfig;

#[derive(Debug, thiserror::Error)]
pub enum OcrError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("OCR API error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("failed to parse OCR response: {0}")]
    Parse(String),
    #[error("OCR endpoint not configured")]
    NotConfigured,
}

#[async_trait]
pub trait OcrClient: Send + Sync {
    /// Recognize text in a PNG image.
    async fn recognize(&self, image_png: &[u8]) -> Result<String, OcrError>;
}

/// HTTP OCR client posting a base64 data-URL to a configurable endpoint.
pub struct HttpOcrClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpOcrClient {
    pub fn from_config(config: &OcrConfig) -> Result<Self, OcrError> {
        let endpoint = config.endpoint.clone().ok_or(OcrError::NotConfigured)?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            endpoint,
            api_key: std::env::var("OCR_API_KEY").ok(),
        })
    }
}

#[async_trait]
impl OcrClient for HttpOcrClient {
    async fn recognize(&self, image_png: &[u8]) -> Result<String, OcrError> {
        let data_url = format!(
            "data:image/png;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(image_png)
        );
        let body = serde_json::json!({ "image": data_url });

        let mut req = self.client.post(&self.endpoint).json(&body);
        if let Some(ref key) = self.api_key {
            req = req.header("Authorization", format!("Bearer {}", key));
        }

        let response = req.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OcrError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let json: serde_json::Value = response.json().await?;
        // Providers differ on the field name for the full-text annotation.
        let text = json
            .get("text")
            .and_then(|t| t.as_str())
            .or_else(|| {
                json.pointer("/fullTextAnnotation/text")
                    .and_then(|t| t.as_str())
            })
            .ok_or_else(|| OcrError::Parse("missing text field".to_string()))?;
        Ok(text.to_string())
    }
}

/// OCR a sequence of page images, preserving order.
///
/// At most `workers` requests are in flight at once. A failed page logs a
/// warning and yields an empty string; the batch never aborts, so the
/// result always has exactly one entry per input image.
pub async fn recognize_batch(
    client: Arc<dyn OcrClient>,
    images: Vec<Vec<u8>>,
    workers: usize,
) -> Vec<String> {
    let workers = workers.max(1);
    let mut out = vec![String::new(); images.len()];

    let mut start = 0usize;
    while start < images.len() {
        let end = (start + workers).min(images.len());
        let mut set = tokio::task::JoinSet::new();
        for (offset, image) in images[start..end].iter().enumerate() {
            let index = start + offset;
            let client = client.clone();
            let image = image.clone();
            set.spawn(async move { (index, client.recognize(&image).await) });
        }
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, Ok(text))) => out[index] = text,
                Ok((index, Err(e))) => {
                    warn!(page = index + 1, error = %e, "OCR failed for page; continuing");
                }
                Err(e) => {
                    warn!(error = %e, "OCR task panicked; continuing");
                }
            }
        }
        start = end;
    }

    out
}
