//! Source readers: turn heterogeneous inputs into candidates.
//!
//! [`SourceReader`] is a closed set of variants, each declaring its own
//! applicability over an [`InputItem`]. Readers report failures as
//! [`SourceError`]; absorbing them is the pipeline's job.

use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use crate::candidate::{find_candidates, Candidate};
use crate::ocr::{OcrInput, OcrProvider};
use crate::pdf::PdfTextEngine;

pub const PDF_MEDIA_TYPE: &str = "application/pdf";
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Raw bytes with their declared media type.
#[derive(Debug, Clone)]
pub struct FilePayload {
    pub name: String,
    pub media_type: String,
    pub data: Bytes,
}

impl FilePayload {
    /// Primary class of the media type (`image` in `image/png`).
    pub fn primary_type(&self) -> &str {
        self.media_type.split('/').next().unwrap_or_default()
    }

    /// Media type without parameters, lowercased.
    pub fn essence(&self) -> String {
        self.media_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase()
    }
}

/// One unit of user-supplied input. Immutable once created.
#[derive(Debug, Clone)]
pub enum InputItem {
    File(FilePayload),
    Text(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    Image,
    Document,
    Text,
    Other,
}

impl InputItem {
    pub fn kind(&self) -> ItemKind {
        match self {
            InputItem::Text(_) => ItemKind::Text,
            InputItem::File(f) if f.primary_type().eq_ignore_ascii_case("image") => ItemKind::Image,
            InputItem::File(f) if f.essence() == PDF_MEDIA_TYPE => ItemKind::Document,
            InputItem::File(f) if f.primary_type().eq_ignore_ascii_case("text") => ItemKind::Text,
            InputItem::File(_) => ItemKind::Other,
        }
    }

    /// Short label for logs.
    pub fn label(&self) -> &str {
        match self {
            InputItem::File(f) => &f.name,
            InputItem::Text(_) => "<text>",
        }
    }
}

/// Failure of one reader on one item.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("OCR failed: {0:#}")]
    Ocr(anyhow::Error),
    #[error("PDF extraction failed: {0:#}")]
    Pdf(anyhow::Error),
}

/// The external engines the readers delegate to.
#[derive(Clone)]
pub struct Engines {
    pub ocr: Arc<dyn OcrProvider>,
    pub pdf: Arc<dyn PdfTextEngine>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceReader {
    Image,
    Document,
    Text,
}

impl SourceReader {
    /// Every reader, in the order their results are combined.
    pub const ALL: [SourceReader; 3] = [Self::Image, Self::Document, Self::Text];

    pub fn name(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Document => "document",
            Self::Text => "text",
        }
    }

    pub fn applies_to(self, item: &InputItem) -> bool {
        matches!(
            (self, item.kind()),
            (Self::Image, ItemKind::Image)
                | (Self::Document, ItemKind::Document)
                | (Self::Text, ItemKind::Text)
        )
    }

    /// Readers applicable to `item`, in combination order.
    pub fn applicable(item: &InputItem) -> impl Iterator<Item = SourceReader> + '_ {
        Self::ALL.into_iter().filter(move |r| r.applies_to(item))
    }

    /// Extract candidates from `item`. Non-applicable items yield nothing.
    pub async fn read(self, item: &InputItem, engines: &Engines) -> Result<Vec<Candidate>, SourceError> {
        if !self.applies_to(item) {
            return Ok(Vec::new());
        }

        match (self, item) {
            (Self::Text, InputItem::Text(text)) => Ok(find_candidates(text)),
            (Self::Text, InputItem::File(file)) => Ok(find_candidates(&String::from_utf8_lossy(&file.data))),
            (Self::Image, InputItem::File(file)) => {
                let input = OcrInput {
                    media_type: file.media_type.clone(),
                    data: file.data.clone(),
                };
                let result = engines.ocr.recognize(&input).await.map_err(SourceError::Ocr)?;
                debug!(
                    "{}: {} chars from {}",
                    file.name,
                    result.text.len(),
                    result.provider_name
                );
                Ok(find_candidates(&result.text))
            }
            (Self::Document, InputItem::File(file)) => {
                let pages = engines
                    .pdf
                    .page_runs(file.data.clone())
                    .await
                    .map_err(SourceError::Pdf)?;
                let mut candidates: Vec<Candidate> = Vec::new();
                for page in &pages {
                    let found: Vec<Candidate> =
                        page.runs.iter().flat_map(|run| find_candidates(run)).collect();
                    if !found.is_empty() {
                        debug!("{} page {}: {} candidates", file.name, page.page_num, found.len());
                    }
                    candidates.extend(found);
                }
                debug!("{}: {} pages, {} candidates", file.name, pages.len(), candidates.len());
                Ok(candidates)
            }
            _ => Ok(Vec::new()),
        }
    }
}

/// Guess a media type from a file extension.
pub fn guess_media_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        "tif" | "tiff" => "image/tiff",
        "webp" => "image/webp",
        "pdf" => PDF_MEDIA_TYPE,
        "txt" => "text/plain",
        _ => OCTET_STREAM,
    }
}
