//! Background-context HTTP surface.
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/income` | Share submission (multipart) |
//! | `GET`  | `/income` | Pending intake listing |
//! | `GET`  | `/income/{key}` | Raw bytes of a pending file |
//! | `GET`  | `/events` | Push messages as Server-Sent Events |
//! | `GET`  | `/notifications/{payload}` | Notification activation (deep link) |
//! | `GET`  | `/health` | Health check |

use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Redirect, Response,
    },
    routing::get,
    Router,
};
use tokio_stream::{wrappers::BroadcastStream, Stream, StreamExt};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::bus::MessageBus;
use crate::config::{RelayMode, Settings};
use crate::intake::{IntakeError, IntakeHandle, PendingFile, PendingListing, SubmittedField};
use crate::relay::{NotificationPayload, NotificationRelay};
use crate::source::OCTET_STREAM;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub intake: IntakeHandle,
    pub relay: Arc<NotificationRelay>,
    pub bus: MessageBus,
    pub settings: Arc<Settings>,
}

pub fn router(state: AppState) -> Router {
    let body_limit = state.settings.max_upload_bytes();

    Router::new()
        .route("/health", get(health))
        .route("/income", get(list_income).post(submit_income))
        .route("/income/{key}", get(fetch_income))
        .route("/events", get(events))
        .route("/notifications/{payload}", get(activate_notification))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn intake_error(e: IntakeError) -> (StatusCode, String) {
    match e {
        IntakeError::NotFound(_) => (StatusCode::NOT_FOUND, "not found".to_string()),
        IntakeError::Unavailable => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint.
async fn health() -> &'static str {
    "ok"
}

/// Read every multipart field. Fields carrying a filename are files.
async fn parse_submission(mut multipart: Multipart) -> Result<Vec<SubmittedField>, String> {
    let mut fields = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| format!("Failed to read form field: {}", e))?
    {
        let name = field.name().unwrap_or_default().to_string();

        if field.file_name().is_some() {
            let content_type = field.content_type().unwrap_or(OCTET_STREAM).to_string();
            let data = field
                .bytes()
                .await
                .map_err(|e| format!("Failed to read file {}: {}", name, e))?;
            debug!("Submission file field {} ({}, {} bytes)", name, content_type, data.len());
            fields.push(SubmittedField::File {
                name,
                file: PendingFile { content_type, data },
            });
        } else {
            let value = field
                .text()
                .await
                .map_err(|e| format!("Failed to read field {}: {}", name, e))?;
            fields.push(SubmittedField::Text { name, value });
        }
    }

    Ok(fields)
}

/// Accept a share submission.
async fn submit_income(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Response, (StatusCode, String)> {
    let fields = parse_submission(multipart)
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, e))?;

    let receipt = state
        .intake
        .submit(fields.clone())
        .await
        .map_err(intake_error)?;
    info!(
        "Received share: {} files, {} texts (mode {:?})",
        receipt.files, receipt.texts, state.settings.relay_mode
    );

    match state.settings.relay_mode {
        RelayMode::Buffer => Ok(Redirect::to(&state.settings.foreground_url).into_response()),
        RelayMode::Notify => {
            let relay = Arc::clone(&state.relay);
            tokio::spawn(async move {
                relay.relay(fields).await;
            });
            Ok(StatusCode::OK.into_response())
        }
    }
}

/// List pending intake.
async fn list_income(
    State(state): State<AppState>,
) -> Result<Json<PendingListing>, (StatusCode, String)> {
    state.intake.list_pending().await.map(Json).map_err(intake_error)
}

/// Serve a pending file with its declared content type.
async fn fetch_income(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Response, (StatusCode, String)> {
    let file = state
        .intake
        .fetch_pending_file(&key)
        .await
        .map_err(intake_error)?;
    Ok(([(header::CONTENT_TYPE, file.content_type)], file.data).into_response())
}

/// Stream push messages to a foreground view until it disconnects.
async fn events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    info!("Foreground view subscribed to events");
    let stream = BroadcastStream::new(state.bus.subscribe())
        .filter_map(|msg| match msg {
            Ok(msg) => Some(msg),
            Err(e) => {
                warn!("Event subscriber lagging: {}", e);
                None
            }
        })
        .map(|msg| Event::default().json_data(msg));

    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// A notification was activated: open the foreground on its candidate.
async fn activate_notification(
    State(state): State<AppState>,
    Path(payload): Path<String>,
) -> Result<Redirect, (StatusCode, String)> {
    let payload = NotificationPayload::decode(&payload)
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    info!("Notification activated for {}", payload.cbu);
    Ok(Redirect::to(&payload.deep_link(&state.settings.foreground_url)))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::bus::ForegroundMessage;
    use crate::candidate::Candidate;
    use crate::intake::IntakeStore;
    use crate::pipeline::AggregationPipeline;
    use crate::relay::testing::RecordingNotifier;
    use crate::source::testing::engines;

    const A: &str = "0000003100010000000001";
    const BOUNDARY: &str = "cbu-test-boundary";

    enum Part<'a> {
        Text(&'a str, &'a str),
        File(&'a str, &'a str, &'a [u8]),
    }

    fn multipart(parts: &[Part]) -> Vec<u8> {
        let mut body = Vec::new();
        for part in parts {
            body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
            match part {
                Part::Text(name, value) => {
                    body.extend_from_slice(
                        format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", name).as_bytes(),
                    );
                    body.extend_from_slice(value.as_bytes());
                }
                Part::File(name, content_type, data) => {
                    body.extend_from_slice(
                        format!(
                            "Content-Disposition: form-data; name=\"{}\"; filename=\"{}.bin\"\r\nContent-Type: {}\r\n\r\n",
                            name, name, content_type
                        )
                        .as_bytes(),
                    );
                    body.extend_from_slice(data);
                }
            }
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
        body
    }

    fn post_income(parts: &[Part]) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/income")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .body(Body::from(multipart(parts)))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn state(mode: RelayMode) -> (AppState, Arc<RecordingNotifier>) {
        let notifier = Arc::new(RecordingNotifier::default());
        let bus = MessageBus::default();
        let relay = NotificationRelay::new(
            AggregationPipeline::new(engines()),
            notifier.clone(),
            bus.clone(),
        );
        let settings = Settings {
            relay_mode: mode,
            ..Settings::default()
        };
        let state = AppState {
            intake: IntakeStore::spawn(),
            relay: Arc::new(relay),
            bus,
            settings: Arc::new(settings),
        };
        (state, notifier)
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        to_bytes(response.into_body(), usize::MAX).await.unwrap().to_vec()
    }

    async fn body_string(response: Response) -> String {
        String::from_utf8(body_bytes(response).await).unwrap()
    }

    #[tokio::test]
    async fn test_buffer_mode_stores_and_redirects() {
        let (state, notifier) = state(RelayMode::Buffer);
        let app = router(state);

        let response = app
            .clone()
            .oneshot(post_income(&[
                Part::Text("text", "mirá este CBU"),
                Part::File("image", "image/png", b"\x89PNG fake"),
            ]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(response.headers()[header::LOCATION], "/");

        let listing = app.clone().oneshot(get("/income")).await.unwrap();
        assert_eq!(listing.status(), StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body_string(listing).await).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"pendingFiles": ["image"], "pendingTexts": ["mirá este CBU"]})
        );

        let file = app.oneshot(get("/income/image")).await.unwrap();
        assert_eq!(file.status(), StatusCode::OK);
        assert_eq!(file.headers()[header::CONTENT_TYPE], "image/png");
        assert_eq!(body_bytes(file).await, b"\x89PNG fake");

        assert!(notifier.shown.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_key_is_404() {
        let (state, _) = state(RelayMode::Buffer);
        let response = router(state).oneshot(get("/income/nope")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_string(response).await, "not found");
    }

    #[tokio::test]
    async fn test_notify_mode_relays_and_acknowledges() {
        let (state, notifier) = state(RelayMode::Notify);
        let mut rx = state.bus.subscribe();
        let app = router(state);

        let response = app
            .oneshot(post_income(&[Part::Text("text", &format!("CBU {}", A))]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_string(response).await.is_empty());

        let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            msg,
            ForegroundMessage::candidates(vec![Candidate::parse(A).unwrap()])
        );

        // Notifications follow the push on the same task.
        tokio::time::timeout(Duration::from_secs(5), async {
            while notifier.shown.lock().unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(notifier.shown.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_notification_activation_redirects_to_deep_link() {
        let (state, _) = state(RelayMode::Notify);
        let app = router(state);
        let payload = NotificationPayload::new(Candidate::parse(A).unwrap());

        let response = app
            .clone()
            .oneshot(get(&payload.activation_path()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(
            response.headers()[header::LOCATION],
            format!("/?cbu={}", A).as_str()
        );

        let bad = app.oneshot(get("/notifications/not-base64!")).await.unwrap();
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_health() {
        let (state, _) = state(RelayMode::Buffer);
        let response = router(state).oneshot(get("/health")).await.unwrap();
        assert_eq!(body_string(response).await, "ok");
    }
}
