//! Notification relay: extract candidates from a share submission and
//! announce them as system notifications.
//!
//! Each candidate notification carries a [`NotificationPayload`]. Activating
//! it goes through `GET /notifications/{payload}`, which redirects to the
//! foreground root with `?cbu=<digits>` so the view can show the result
//! without extracting again.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::bus::{ForegroundMessage, MessageBus};
use crate::candidate::Candidate;
use crate::intake::SubmittedField;
use crate::pipeline::AggregationPipeline;
use crate::source::InputItem;

pub const TITLE_FOUND: &str = "CBU encontrado";
pub const TITLE_NONE: &str = "No se encontraron CBUs";
pub const TITLE_ERROR: &str = "No pudimos procesar lo compartido";

/// Data slot of a candidate notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub cbu: Candidate,
}

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("payload is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),
    #[error("payload is not a valid notification: {0}")]
    Json(#[from] serde_json::Error),
}

impl NotificationPayload {
    pub fn new(cbu: Candidate) -> Self {
        Self { cbu }
    }

    /// Opaque, URL-safe encoding of `{"cbu": "..."}`.
    pub fn encode(&self) -> String {
        let json = serde_json::json!({ "cbu": self.cbu.as_str() }).to_string();
        BASE64.encode(json)
    }

    pub fn decode(encoded: &str) -> Result<Self, PayloadError> {
        let raw = BASE64.decode(encoded.trim())?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Server path that activates this notification.
    pub fn activation_path(&self) -> String {
        format!("/notifications/{}", self.encode())
    }

    /// Foreground URL showing this candidate.
    pub fn deep_link(&self, foreground_root: &str) -> String {
        let sep = if foreground_root.contains('?') { '&' } else { '?' };
        format!("{}{}cbu={}", foreground_root, sep, self.cbu)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub id: Uuid,
    pub title: String,
    pub body: String,
    pub payload: Option<NotificationPayload>,
}

impl Notification {
    pub fn found(cbu: Candidate) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: TITLE_FOUND.to_string(),
            body: cbu.to_string(),
            payload: Some(NotificationPayload::new(cbu)),
        }
    }

    pub fn none_found() -> Self {
        Self {
            id: Uuid::new_v4(),
            title: TITLE_NONE.to_string(),
            body: String::new(),
            payload: None,
        }
    }

    pub fn failed() -> Self {
        Self {
            id: Uuid::new_v4(),
            title: TITLE_ERROR.to_string(),
            body: String::new(),
            payload: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("notification permission denied")]
    PermissionDenied,
    #[error("notifications unavailable: {0}")]
    Unavailable(String),
}

/// System notification capability.
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Writes notifications to the log. Used when no webhook is configured.
pub struct LogNotifier {
    server_url: String,
}

impl LogNotifier {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
        }
    }
}

#[async_trait::async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        match &notification.payload {
            Some(payload) => info!(
                "Notification: {}: {} ({}{})",
                notification.title,
                notification.body,
                self.server_url,
                payload.activation_path()
            ),
            None => info!("Notification: {}", notification.title),
        }
        Ok(())
    }
}

/// Posts notifications as JSON to a push gateway.
pub struct WebhookNotifier {
    url: String,
    server_url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: String, server_url: String, client: reqwest::Client) -> Self {
        Self {
            url,
            server_url: server_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    fn body(&self, notification: &Notification) -> serde_json::Value {
        let click = notification
            .payload
            .as_ref()
            .map(|p| format!("{}{}", self.server_url, p.activation_path()));
        serde_json::json!({
            "id": notification.id,
            "title": notification.title,
            "message": notification.body,
            "click": click,
        })
    }
}

#[async_trait::async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.url)
            .json(&self.body(notification))
            .send()
            .await
            .map_err(|e| NotifyError::Unavailable(e.to_string()))?;

        match response.status() {
            s if s.is_success() => Ok(()),
            reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN => {
                Err(NotifyError::PermissionDenied)
            }
            s => Err(NotifyError::Unavailable(format!("gateway returned {}", s))),
        }
    }
}

/// What a relay run produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    Announced(Vec<Candidate>),
    Failed,
}

/// Background-context relay from share submissions to notifications.
pub struct NotificationRelay {
    pipeline: AggregationPipeline,
    notifier: std::sync::Arc<dyn Notifier>,
    bus: MessageBus,
}

/// Split submitted fields into pipeline inputs: files become items, text
/// fields are joined into the extra text.
pub fn fields_to_inputs(fields: Vec<SubmittedField>) -> (Vec<InputItem>, String) {
    let mut items = Vec::new();
    let mut texts = Vec::new();
    for field in fields {
        match field {
            SubmittedField::Text { value, .. } => texts.push(value),
            SubmittedField::File { name, file } => items.push(file.into_input(&name)),
        }
    }
    (items, texts.join("\n"))
}

impl NotificationRelay {
    pub fn new(pipeline: AggregationPipeline, notifier: std::sync::Arc<dyn Notifier>, bus: MessageBus) -> Self {
        Self {
            pipeline,
            notifier,
            bus,
        }
    }

    /// Extract from `fields`, push the result to open views, then raise one
    /// notification per candidate, or a single one when nothing was found.
    pub async fn relay(&self, fields: Vec<SubmittedField>) -> RelayOutcome {
        let names: Vec<&str> = fields.iter().map(SubmittedField::name).collect();
        info!("Relay: extracting from fields {:?}", names);

        let (items, extra_text) = fields_to_inputs(fields);
        let pipeline = self.pipeline.clone();
        let run = tokio::spawn(async move { pipeline.run(items, &extra_text).await });

        let candidates = match run.await {
            Ok(candidates) => candidates,
            Err(e) => {
                error!("Relay: extraction aborted: {}", e);
                self.bus.publish(ForegroundMessage::error(e.to_string()));
                self.send(&Notification::failed()).await;
                return RelayOutcome::Failed;
            }
        };

        self.bus
            .publish(ForegroundMessage::candidates(candidates.clone()));

        if candidates.is_empty() {
            self.send(&Notification::none_found()).await;
        } else {
            for cbu in &candidates {
                self.send(&Notification::found(cbu.clone())).await;
            }
        }

        info!("Relay: announced {} candidates", candidates.len());
        RelayOutcome::Announced(candidates)
    }

    async fn send(&self, notification: &Notification) {
        if let Err(e) = self.notifier.notify(notification).await {
            warn!("Notification {} not shown: {}", notification.id, e);
        }
    }
}
