use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::time::Duration;
use tracing::{debug, warn};

use crate::config::OcrConfig;

/// Text recognition service
#[async_trait]
pub trait OcrClient: Send + Sync {
    /// Liveness check against the service root
    async fn is_reachable(&self) -> bool;

    /// Recognise text in one image
    async fn recognize(&self, image_path: &Path) -> Result<String>;
}

#[derive(Debug, Serialize)]
struct TesseractOptions<'a> {
    languages: &'a [String],
}

#[derive(Debug, Deserialize)]
struct TesseractEnvelope {
    data: TesseractData,
}

#[derive(Debug, Deserialize)]
struct TesseractData {
    #[serde(default)]
    stdout: String,
}

/// Client for a tesseract HTTP server (`POST {endpoint}/tesseract`)
pub struct TesseractClient {
    endpoint: String,
    languages: Vec<String>,
    client: reqwest::Client,
    probe_client: reqwest::Client,
}

impl TesseractClient {
    pub fn new(config: &OcrConfig) -> Result<Self> {
        let endpoint = config.endpoint.trim().trim_end_matches('/').to_string();
        if endpoint.is_empty() {
            return Err(anyhow!("OCR endpoint not configured"));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()?;
        let probe_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.probe_timeout_seconds))
            .build()?;

        Ok(Self {
            endpoint,
            languages: config.languages.clone(),
            client,
            probe_client,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl OcrClient for TesseractClient {
    async fn is_reachable(&self) -> bool {
        match self.probe_client.get(&self.endpoint).send().await {
            Ok(response) => {
                debug!("OCR endpoint {} answered {}", self.endpoint, response.status());
                true
            }
            Err(e) => {
                warn!("OCR endpoint {} unreachable: {}", self.endpoint, e);
                false
            }
        }
    }

    async fn recognize(&self, image_path: &Path) -> Result<String> {
        let image_data = tokio::fs::read(image_path).await?;
        let file_name = image_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "frame.jpg".to_string());

        let options = serde_json::to_string(&TesseractOptions {
            languages: &self.languages,
        })?;

        let form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(image_data)
                    .file_name(file_name)
                    .mime_str(mime_for(image_path))?,
            )
            .text("options", options);

        let response = self
            .client
            .post(format!("{}/tesseract", self.endpoint))
            .multipart(form)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!("OCR service error {}: {}", status, text));
        }

        let body = response.text().await?;
        Ok(extract_text(&body))
    }
}

fn mime_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("png") => "image/png",
        Some("bmp") => "image/bmp",
        _ => "image/jpeg",
    }
}

/// The service answers with `{"data":{"stdout":...}}`; plain bodies are taken as-is
fn extract_text(body: &str) -> String {
    match serde_json::from_str::<TesseractEnvelope>(body) {
        Ok(envelope) => envelope.data.stdout,
        Err(_) => body.to_string(),
    }
}
