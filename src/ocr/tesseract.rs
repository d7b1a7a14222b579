//! Local tesseract OCR provider.

use std::io::Cursor;
use std::process::Stdio;

use anyhow::Context;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::{OcrInput, OcrProvider, OcrResult};

pub struct TesseractProvider {
    cmd: String,
    language: String,
}

impl TesseractProvider {
    pub fn new(cmd: String, language: String) -> Self {
        Self { cmd, language }
    }
}

/// Decode any supported image format and re-encode it as grayscale PNG,
/// which every tesseract build accepts on stdin.
fn normalize_image(data: &[u8]) -> anyhow::Result<Vec<u8>> {
    let img = image::load_from_memory(data).context("Unsupported or corrupt image")?;
    let mut png = Cursor::new(Vec::new());
    img.grayscale()
        .write_to(&mut png, image::ImageOutputFormat::Png)
        .context("Failed to re-encode image as PNG")?;
    Ok(png.into_inner())
}

#[async_trait::async_trait]
impl OcrProvider for TesseractProvider {
    fn name(&self) -> &str {
        "tesseract"
    }

    async fn recognize(&self, input: &OcrInput) -> anyhow::Result<OcrResult> {
        let data = input.data.clone();
        let png = tokio::task::spawn_blocking(move || normalize_image(&data))
            .await
            .context("Image normalization task failed")??;

        info!(
            "TesseractProvider: recognizing {} ({} bytes, lang={})",
            input.media_type,
            png.len(),
            self.language
        );

        let mut child = tokio::process::Command::new(&self.cmd)
            .args(["stdin", "stdout", "-l", self.language.as_str()])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.cmd))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow::anyhow!("tesseract stdin unavailable"))?;
        stdin.write_all(&png).await?;
        drop(stdin);

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            anyhow::bail!(
                "tesseract exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let text = String::from_utf8_lossy(&output.stdout).into_owned();
        debug!("TesseractProvider: {} chars recognized", text.len());

        Ok(OcrResult {
            text,
            provider_name: "tesseract".to_string(),
        })
    }
}
