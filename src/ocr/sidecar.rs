//! HTTP sidecar OCR provider.

use serde::Deserialize;
use tracing::info;

use super::{OcrInput, OcrProvider, OcrResult};

/// Sidecar response (private deserialization type).
#[derive(Debug, Deserialize)]
struct SidecarResponse {
    text: String,
}

pub struct SidecarProvider {
    url: String,
    language: String,
    client: reqwest::Client,
}

impl SidecarProvider {
    pub fn new(url: String, language: String, client: reqwest::Client) -> Self {
        Self {
            url: url.trim_end_matches('/').to_string(),
            language,
            client,
        }
    }
}

#[async_trait::async_trait]
impl OcrProvider for SidecarProvider {
    fn name(&self) -> &str {
        "sidecar"
    }

    async fn recognize(&self, input: &OcrInput) -> anyhow::Result<OcrResult> {
        use reqwest::multipart::{Form, Part};

        info!(
            "SidecarProvider: posting {} ({} bytes) to {}",
            input.media_type,
            input.data.len(),
            self.url
        );

        let part = Part::bytes(input.data.to_vec())
            .file_name("upload")
            .mime_str(&input.media_type)?;

        let form = Form::new()
            .part("file", part)
            .text("lang", self.language.clone());

        let response = self
            .client
            .post(format!("{}/ocr", self.url))
            .multipart(form)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            anyhow::bail!("OCR sidecar error ({}): {}", status, error_text);
        }

        let body: SidecarResponse = response.json().await?;

        Ok(OcrResult {
            text: body.text,
            provider_name: "sidecar".to_string(),
        })
    }
}
