//! Modular OCR provider abstraction.
//!
//! Defines the [`OcrProvider`] trait so different OCR backends (local
//! tesseract, HTTP sidecar) can be swapped via configuration. Every provider
//! is a black box: image bytes in, free text out.

pub mod sidecar;
pub mod tesseract;

use std::sync::Arc;

use bytes::Bytes;

use crate::config::Settings;

/// Input to an OCR provider.
#[derive(Debug, Clone)]
pub struct OcrInput {
    pub media_type: String,
    pub data: Bytes,
}

/// Unified OCR result returned by every provider.
#[derive(Debug, Clone)]
pub struct OcrResult {
    pub text: String,
    pub provider_name: String,
}

/// Async trait implemented by each OCR backend.
#[async_trait::async_trait]
pub trait OcrProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn recognize(&self, input: &OcrInput) -> anyhow::Result<OcrResult>;
}

/// Known provider identifiers used for configuration lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OcrProviderKind {
    Tesseract,
    Sidecar,
}

impl OcrProviderKind {
    /// Parse a configuration string into a provider kind.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tesseract" => Some(Self::Tesseract),
            "sidecar" => Some(Self::Sidecar),
            _ => None,
        }
    }
}

/// Build the configured provider.
pub fn build_provider(
    settings: &Settings,
    client: reqwest::Client,
) -> anyhow::Result<Arc<dyn OcrProvider>> {
    let kind = OcrProviderKind::parse(&settings.ocr_provider).ok_or_else(|| {
        anyhow::anyhow!(
            "Unknown OCR provider: {}. Available: tesseract, sidecar",
            settings.ocr_provider
        )
    })?;

    Ok(match kind {
        OcrProviderKind::Tesseract => Arc::new(tesseract::TesseractProvider::new(
            settings.tesseract_cmd.clone(),
            settings.ocr_language.clone(),
        )),
        OcrProviderKind::Sidecar => {
            let url = settings
                .ocr_sidecar_url
                .clone()
                .ok_or_else(|| anyhow::anyhow!("OCR_SIDECAR_URL not set"))?;
            Arc::new(sidecar::SidecarProvider::new(
                url,
                settings.ocr_language.clone(),
                client,
            ))
        }
    })
}
