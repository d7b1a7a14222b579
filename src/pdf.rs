//! PDF text extraction.
//!
//! The structural parser is a black box behind [`PdfTextEngine`]: bytes in,
//! per-page text runs out.

use anyhow::Context;
use bytes::Bytes;
use lopdf::Document;
use tracing::debug;

/// Text runs of a single page (1-indexed).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageText {
    pub page_num: u32,
    pub runs: Vec<String>,
}

#[async_trait::async_trait]
pub trait PdfTextEngine: Send + Sync {
    async fn page_runs(&self, data: Bytes) -> anyhow::Result<Vec<PageText>>;
}

/// [`PdfTextEngine`] backed by `lopdf`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LopdfEngine;

#[async_trait::async_trait]
impl PdfTextEngine for LopdfEngine {
    async fn page_runs(&self, data: Bytes) -> anyhow::Result<Vec<PageText>> {
        tokio::task::spawn_blocking(move || extract_page_runs(&data))
            .await
            .context("PDF extraction task failed")?
    }
}

/// Load a PDF and extract its text, one run per line, pages in order.
fn extract_page_runs(data: &[u8]) -> anyhow::Result<Vec<PageText>> {
    let doc = Document::load_mem(data).map_err(|e| anyhow::anyhow!("Failed to load PDF: {}", e))?;

    // get_pages is a BTreeMap keyed by page number, so iteration is in page order.
    let mut pages = Vec::new();
    for (page_num, _) in doc.get_pages() {
        let runs = match doc.extract_text(&[page_num]) {
            Ok(content) => content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect(),
            Err(e) => {
                debug!("Page {} has no extractable text: {}", page_num, e);
                Vec::new()
            }
        };
        pages.push(PageText { page_num, runs });
    }

    debug!("Extracted text runs from {} PDF pages", pages.len());
    Ok(pages)
}
