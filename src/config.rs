//! Runtime settings.
//!
//! Settings start from defaults, are optionally overlaid by a JSON file
//! (`--config`), and finally by environment variables (a `.env` file is
//! loaded first by `main`).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// How `POST /income` hands shared content on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayMode {
    /// Store it and redirect to the foreground root, which pulls it.
    Buffer,
    /// Store it, extract right away and announce via notifications.
    Notify,
}

impl RelayMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "buffer" => Some(Self::Buffer),
            "notify" => Some(Self::Notify),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifierKind {
    Log,
    Webhook,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Address the background server binds to.
    pub bind_addr: String,
    /// Base URL foreground clients use to reach the background server.
    pub server_url: String,
    /// Foreground root; redirects and deep links point here.
    pub foreground_url: String,
    pub relay_mode: RelayMode,
    /// `tesseract` or `sidecar`.
    pub ocr_provider: String,
    /// Tesseract language code of the source documents.
    pub ocr_language: String,
    pub tesseract_cmd: String,
    pub ocr_sidecar_url: Option<String>,
    pub notifier: NotifierKind,
    pub notify_webhook_url: Option<String>,
    pub max_upload_mb: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3000".to_string(),
            server_url: "http://127.0.0.1:3000".to_string(),
            foreground_url: "/".to_string(),
            relay_mode: RelayMode::Buffer,
            ocr_provider: "tesseract".to_string(),
            ocr_language: "spa".to_string(),
            tesseract_cmd: "tesseract".to_string(),
            ocr_sidecar_url: None,
            notifier: NotifierKind::Log,
            notify_webhook_url: None,
            max_upload_mb: 100,
        }
    }
}

impl Settings {
    /// Defaults, then the JSON file at `path` if given, then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config: {:?}", path))?;
                let settings: Settings = serde_json::from_str(&content)
                    .with_context(|| format!("Failed to parse config: {:?}", path))?;
                info!("Loaded config from {:?}", path);
                settings
            }
            None => Settings::default(),
        };

        settings.apply_env(|key| std::env::var(key).ok())?;
        Ok(settings)
    }

    /// Override fields from variables returned by `var`.
    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = var("CBU_BIND_ADDR") {
            self.bind_addr = v;
        }
        if let Some(v) = var("CBU_SERVER_URL") {
            self.server_url = v;
        }
        if let Some(v) = var("CBU_FOREGROUND_URL") {
            self.foreground_url = v;
        }
        if let Some(v) = var("CBU_RELAY_MODE") {
            self.relay_mode = RelayMode::parse(&v)
                .with_context(|| format!("Invalid CBU_RELAY_MODE: {} (buffer|notify)", v))?;
        }
        if let Some(v) = var("OCR_PROVIDER") {
            self.ocr_provider = v;
        }
        if let Some(v) = var("OCR_LANGUAGE") {
            self.ocr_language = v;
        }
        if let Some(v) = var("TESSERACT_CMD") {
            self.tesseract_cmd = v;
        }
        if let Some(v) = var("OCR_SIDECAR_URL") {
            self.ocr_sidecar_url = Some(v);
        }
        if let Some(v) = var("NOTIFY_WEBHOOK_URL") {
            self.notify_webhook_url = Some(v);
            self.notifier = NotifierKind::Webhook;
        }
        if let Some(v) = var("NOTIFIER") {
            self.notifier = match v.trim().to_ascii_lowercase().as_str() {
                "log" => NotifierKind::Log,
                "webhook" => NotifierKind::Webhook,
                other => anyhow::bail!("Invalid NOTIFIER: {} (log|webhook)", other),
            };
        }
        if let Some(v) = var("CBU_MAX_UPLOAD_MB") {
            self.max_upload_mb = v
                .parse()
                .with_context(|| format!("Invalid CBU_MAX_UPLOAD_MB: {}", v))?;
        }
        Ok(())
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.max_upload_mb.saturating_mul(1024 * 1024)
    }
}
