//! Foreground view state and its synchronization with the background context.
//!
//! The foreground never shares memory with the background: it pulls intake
//! over [`BackgroundLink`] and receives push messages on a subscription.
//! Its result list is replaced wholesale on every extraction run.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::StreamExt;
use reqwest::Url;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bus::ForegroundMessage;
use crate::candidate::{find_candidates, Candidate};
use crate::intake::{PendingFile, PendingListing};
use crate::pipeline::{AggregationPipeline, PipelineStatus};
use crate::source::{InputItem, OCTET_STREAM};

/// Generic message shown when a batch fails as a whole.
pub const BATCH_FAILED: &str = "No pudimos procesar tus archivos";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisplayState {
    Idle,
    Processing,
    Results(Vec<Candidate>),
    Failed(String),
}

/// Display state of one foreground view.
///
/// Every run takes a new generation; updates from an older generation are
/// dropped so a superseded batch never overwrites a newer result.
pub struct ForegroundView {
    state: watch::Sender<DisplayState>,
    generation: AtomicU64,
}

impl Default for ForegroundView {
    fn default() -> Self {
        Self::new()
    }
}

impl ForegroundView {
    pub fn new() -> Self {
        let (state, _) = watch::channel(DisplayState::Idle);
        Self {
            state,
            generation: AtomicU64::new(0),
        }
    }

    pub fn watch(&self) -> watch::Receiver<DisplayState> {
        self.state.subscribe()
    }

    pub fn current(&self) -> DisplayState {
        self.state.borrow().clone()
    }

    /// Start a new generation, superseding any run in flight.
    pub fn begin(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Apply `state` only if `generation` is still the latest.
    ///
    /// The check and the write happen under the watch lock, so a generation
    /// started by [`show`](Self::show) can never be overwritten by an older one.
    pub fn set_if_current(&self, generation: u64, state: DisplayState) -> bool {
        let applied = self.state.send_if_modified(|current| {
            if self.generation.load(Ordering::SeqCst) != generation {
                return false;
            }
            *current = state;
            true
        });
        if !applied {
            debug!("Dropping display update from superseded generation {}", generation);
        }
        applied
    }

    /// Replace the display unconditionally, superseding any run in flight.
    pub fn show(&self, state: DisplayState) {
        self.state.send_modify(|current| {
            self.generation.fetch_add(1, Ordering::SeqCst);
            *current = state;
        });
    }

    /// Show `state` only if nothing has been displayed yet.
    pub fn show_if_idle(&self, state: DisplayState) -> bool {
        self.state.send_if_modified(|current| {
            if *current != DisplayState::Idle {
                return false;
            }
            self.generation.fetch_add(1, Ordering::SeqCst);
            *current = state;
            true
        })
    }

    /// Dispatch a push message from the background context.
    pub fn apply_message(&self, message: ForegroundMessage) {
        if let Some(e) = message.error {
            error!("Background reported a failure: {}", e);
            self.show(DisplayState::Failed(BATCH_FAILED.to_string()));
        } else if let Some(candidates) = message.candidates {
            info!("Background pushed {} candidates", candidates.len());
            self.show(DisplayState::Results(candidates));
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("no pending file under key {0:?}")]
    NotFound(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Foreground side of the channel to the background context.
#[async_trait::async_trait]
pub trait BackgroundLink: Send + Sync {
    async fn list_pending(&self) -> anyhow::Result<PendingListing>;
    async fn fetch_pending_file(&self, key: &str) -> Result<PendingFile, LinkError>;
    /// Live push messages. Dropping the receiver ends the subscription.
    async fn subscribe(&self) -> anyhow::Result<mpsc::Receiver<ForegroundMessage>>;
}

/// Which startup path [`ForegroundSync::start`] took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupPath {
    /// The page URL already carried the result.
    FromUrl,
    /// `loading=true`: waiting for a push message.
    AwaitingBackground,
    /// Pending intake was pulled and extracted.
    FromIntake,
    /// Nothing pending.
    Empty,
    /// Pulling or extracting failed as a whole.
    Failed,
}

/// Deregisters the push-message listener when dropped.
pub struct ListenerGuard {
    handle: JoinHandle<()>,
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub struct ForegroundSync {
    link: Arc<dyn BackgroundLink>,
    pipeline: AggregationPipeline,
    view: Arc<ForegroundView>,
}

impl ForegroundSync {
    pub fn new(link: Arc<dyn BackgroundLink>, pipeline: AggregationPipeline) -> Self {
        Self {
            link,
            pipeline,
            view: Arc::new(ForegroundView::new()),
        }
    }

    pub fn view(&self) -> &Arc<ForegroundView> {
        &self.view
    }

    /// Subscribe to push messages for as long as the guard lives.
    pub async fn listen(&self) -> anyhow::Result<ListenerGuard> {
        let mut rx = self.link.subscribe().await?;
        let view = Arc::clone(&self.view);
        let handle = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                view.apply_message(message);
            }
            debug!("Push subscription closed");
        });
        Ok(ListenerGuard { handle })
    }

    /// Bring the view up to date when it becomes ready.
    ///
    /// A `cbu` or `text` parameter wins, then `loading=true`, then any
    /// pending intake.
    pub async fn start(&self, page_url: &Url) -> StartupPath {
        let mut seeded = Vec::new();
        let mut loading = false;
        for (key, value) in page_url.query_pairs() {
            match key.as_ref() {
                "cbu" | "text" => seeded.push(value.into_owned()),
                "loading" => loading = value == "true",
                _ => {}
            }
        }

        if !seeded.is_empty() {
            let found = find_candidates(&seeded.join("\n"));
            info!("Showing {} candidates from the page URL", found.len());
            self.view.show(DisplayState::Results(found));
            return StartupPath::FromUrl;
        }

        if loading {
            // A push may already have landed since `listen`.
            if !self.view.show_if_idle(DisplayState::Processing) {
                debug!("Background result arrived before startup");
            }
            return StartupPath::AwaitingBackground;
        }

        match self.pull_intake().await {
            Ok(None) => StartupPath::Empty,
            Ok(Some((items, extra_text))) => match self.run_batch(items, &extra_text).await {
                Some(_) => StartupPath::FromIntake,
                None => StartupPath::Failed,
            },
            Err(e) => {
                error!("Failed to pull pending intake: {:#}", e);
                self.view.show(DisplayState::Failed(BATCH_FAILED.to_string()));
                StartupPath::Failed
            }
        }
    }

    /// Fetch every pending file; `None` when nothing is pending.
    async fn pull_intake(&self) -> anyhow::Result<Option<(Vec<InputItem>, String)>> {
        let listing = self.link.list_pending().await?;
        if listing.is_empty() {
            debug!("No pending intake");
            return Ok(None);
        }
        info!(
            "Pulling {} pending files and {} texts",
            listing.pending_files.len(),
            listing.pending_texts.len()
        );

        let mut items = Vec::new();
        for key in &listing.pending_files {
            match self.link.fetch_pending_file(key).await {
                Ok(file) => items.push(file.into_input(key)),
                Err(LinkError::NotFound(key)) => warn!("Pending file {} is gone", key),
                Err(LinkError::Other(e)) => return Err(e),
            }
        }

        Ok(Some((items, listing.pending_texts.join("\n"))))
    }

    /// Extract from a user drop or paste and display the result.
    ///
    /// Returns `None` if the batch failed as a whole or was superseded.
    pub async fn run_batch(&self, items: Vec<InputItem>, extra_text: &str) -> Option<Vec<Candidate>> {
        let generation = self.view.begin();
        let view = Arc::clone(&self.view);
        let pipeline = self.pipeline.clone();
        let extra_text = extra_text.to_string();

        let run = tokio::spawn(async move {
            pipeline
                .run_observed(items, &extra_text, |status| {
                    let state = match status {
                        PipelineStatus::InProgress => DisplayState::Processing,
                        PipelineStatus::Complete(found) => DisplayState::Results(found),
                    };
                    view.set_if_current(generation, state);
                })
                .await
        });

        match run.await {
            Ok(found) => Some(found),
            Err(e) => {
                error!("Extraction batch failed: {}", e);
                self.view
                    .set_if_current(generation, DisplayState::Failed(BATCH_FAILED.to_string()));
                None
            }
        }
    }
}

/// [`BackgroundLink`] over the background server's HTTP API.
pub struct HttpBackgroundLink {
    base: Url,
    client: reqwest::Client,
}

impl HttpBackgroundLink {
    pub fn new(base: Url, client: reqwest::Client) -> Self {
        Self { base, client }
    }

    fn endpoint(&self, segments: &[&str]) -> anyhow::Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("Server URL cannot be a base: {}", self.base))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

#[async_trait::async_trait]
impl BackgroundLink for HttpBackgroundLink {
    async fn list_pending(&self) -> anyhow::Result<PendingListing> {
        let listing = self
            .client
            .get(self.endpoint(&["income"])?)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(listing)
    }

    async fn fetch_pending_file(&self, key: &str) -> Result<PendingFile, LinkError> {
        let response = self
            .client
            .get(self.endpoint(&["income", key])?)
            .send()
            .await
            .map_err(anyhow::Error::from)?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(LinkError::NotFound(key.to_string()));
        }
        let response = response.error_for_status().map_err(anyhow::Error::from)?;

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(OCTET_STREAM)
            .to_string();
        let data = response.bytes().await.map_err(anyhow::Error::from)?;

        Ok(PendingFile { content_type, data })
    }

    async fn subscribe(&self) -> anyhow::Result<mpsc::Receiver<ForegroundMessage>> {
        let response = self
            .client
            .get(self.endpoint(&["events"])?)
            .send()
            .await?
            .error_for_status()?;

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut decoder = SseDecoder::default();
            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        warn!("Event stream broke: {}", e);
                        break;
                    }
                };
                for message in decoder.push(&chunk) {
                    if tx.send(message).await.is_err() {
                        // Receiver dropped: unsubscribe by closing the connection.
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }
}

/// Incremental decoder for `text/event-stream` bodies carrying
/// [`ForegroundMessage`] JSON in their `data:` lines.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
}

impl SseDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<ForegroundMessage> {
        self.buf.extend(chunk.iter().copied().filter(|&b| b != b'\r'));

        let mut messages = Vec::new();
        while let Some(end) = self.buf.windows(2).position(|w| w == b"\n\n") {
            let frame: Vec<u8> = self.buf.drain(..end + 2).collect();
            let frame = String::from_utf8_lossy(&frame);
            let data: Vec<&str> = frame
                .lines()
                .filter_map(|line| line.strip_prefix("data:"))
                .map(|d| d.strip_prefix(' ').unwrap_or(d))
                .collect();

            // Comment-only frames are keep-alives.
            if data.is_empty() {
                continue;
            }
            match serde_json::from_str(&data.join("\n")) {
                Ok(message) => messages.push(message),
                Err(e) => warn!("Ignoring malformed push message: {}", e),
            }
        }
        messages
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::source::testing::engines;

    const A: &str = "0000003100010000000001";
    const B: &str = "0110599520000001234567";

    #[derive(Default)]
    struct FakeLink {
        listing: PendingListing,
        files: HashMap<String, PendingFile>,
        fail_listing: bool,
        calls: Mutex<Vec<String>>,
        push: Mutex<Option<mpsc::Receiver<ForegroundMessage>>>,
    }

    #[async_trait::async_trait]
    impl BackgroundLink for FakeLink {
        async fn list_pending(&self) -> anyhow::Result<PendingListing> {
            self.calls.lock().unwrap().push("list".to_string());
            if self.fail_listing {
                anyhow::bail!("connection refused");
            }
            Ok(self.listing.clone())
        }

        async fn fetch_pending_file(&self, key: &str) -> Result<PendingFile, LinkError> {
            self.calls.lock().unwrap().push(format!("fetch {}", key));
            self.files
                .get(key)
                .cloned()
                .ok_or_else(|| LinkError::NotFound(key.to_string()))
        }

        async fn subscribe(&self) -> anyhow::Result<mpsc::Receiver<ForegroundMessage>> {
            self.push
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| anyhow::anyhow!("already subscribed"))
        }
    }

    fn sync_with(link: FakeLink) -> (ForegroundSync, Arc<FakeLink>) {
        let link = Arc::new(link);
        let sync = ForegroundSync::new(link.clone(), AggregationPipeline::new(engines()));
        (sync, link)
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn candidates(raw: &[&str]) -> Vec<Candidate> {
        raw.iter().map(|c| Candidate::parse(c).unwrap()).collect()
    }

    async fn wait_for(view: &ForegroundView, pred: impl Fn(&DisplayState) -> bool) -> DisplayState {
        let mut rx = view.watch();
        let state = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| pred(s)))
            .await
            .unwrap()
            .unwrap()
            .clone();
        state
    }

    #[tokio::test]
    async fn test_cbu_param_shown_without_pulling() {
        let (sync, link) = sync_with(FakeLink::default());

        let path = sync
            .start(&url(&format!("http://localhost:3000/?cbu={}", A)))
            .await;

        assert_eq!(path, StartupPath::FromUrl);
        assert_eq!(sync.view().current(), DisplayState::Results(candidates(&[A])));
        assert!(link.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_text_param_rerun_through_matcher() {
        let (sync, _) = sync_with(FakeLink::default());
        let path = sync
            .start(&url("http://localhost/?text=CBU%3A%200110-5995-2000-0001-2345-67"))
            .await;
        assert_eq!(path, StartupPath::FromUrl);
        assert_eq!(sync.view().current(), DisplayState::Results(candidates(&[B])));
    }

    #[tokio::test]
    async fn test_loading_waits_for_push() {
        let (tx, rx) = mpsc::channel(4);
        let (sync, link) = sync_with(FakeLink {
            push: Mutex::new(Some(rx)),
            ..Default::default()
        });
        let _guard = sync.listen().await.unwrap();

        let path = sync.start(&url("http://localhost/?loading=true")).await;
        assert_eq!(path, StartupPath::AwaitingBackground);
        assert_eq!(sync.view().current(), DisplayState::Processing);
        assert!(link.calls.lock().unwrap().is_empty());

        tx.send(ForegroundMessage::candidates(candidates(&[A])))
            .await
            .unwrap();
        let state = wait_for(sync.view(), |s| matches!(s, DisplayState::Results(_))).await;
        assert_eq!(state, DisplayState::Results(candidates(&[A])));
    }

    #[tokio::test]
    async fn test_pushed_error_shows_generic_failure() {
        let (tx, rx) = mpsc::channel(4);
        let (sync, _) = sync_with(FakeLink {
            push: Mutex::new(Some(rx)),
            ..Default::default()
        });
        let _guard = sync.listen().await.unwrap();

        tx.send(ForegroundMessage::error("task panicked")).await.unwrap();
        let state = wait_for(sync.view(), |s| matches!(s, DisplayState::Failed(_))).await;
        assert_eq!(state, DisplayState::Failed(BATCH_FAILED.to_string()));
    }

    #[tokio::test]
    async fn test_pending_intake_pulled_and_extracted() {
        let mut files = HashMap::new();
        files.insert(
            "image".to_string(),
            PendingFile {
                content_type: "image/png".to_string(),
                data: Bytes::from(format!("CBU {}", A)),
            },
        );
        let (sync, link) = sync_with(FakeLink {
            listing: PendingListing {
                pending_files: vec!["image".to_string(), "gone".to_string()],
                pending_texts: vec![format!("alias: {}", B)],
            },
            files,
            ..Default::default()
        });

        let path = sync.start(&url("http://localhost/")).await;

        assert_eq!(path, StartupPath::FromIntake);
        assert_eq!(sync.view().current(), DisplayState::Results(candidates(&[A, B])));
        assert_eq!(
            *link.calls.lock().unwrap(),
            vec!["list", "fetch image", "fetch gone"]
        );
    }

    #[tokio::test]
    async fn test_nothing_pending_stays_idle() {
        let (sync, _) = sync_with(FakeLink::default());
        assert_eq!(sync.start(&url("http://localhost/")).await, StartupPath::Empty);
        assert_eq!(sync.view().current(), DisplayState::Idle);
    }

    #[tokio::test]
    async fn test_unreachable_background_is_a_batch_failure() {
        let (sync, _) = sync_with(FakeLink {
            fail_listing: true,
            ..Default::default()
        });
        assert_eq!(sync.start(&url("http://localhost/")).await, StartupPath::Failed);
        assert_eq!(
            sync.view().current(),
            DisplayState::Failed(BATCH_FAILED.to_string())
        );
    }

    #[tokio::test]
    async fn test_dropping_guard_ends_subscription() {
        let (tx, rx) = mpsc::channel(4);
        let (sync, _) = sync_with(FakeLink {
            push: Mutex::new(Some(rx)),
            ..Default::default()
        });
        let guard = sync.listen().await.unwrap();
        drop(guard);

        tokio::time::timeout(Duration::from_secs(5), tx.closed())
            .await
            .unwrap();
    }

    #[test]
    fn test_superseded_generation_dropped() {
        let view = ForegroundView::new();
        let old = view.begin();
        let new = view.begin();

        assert!(view.set_if_current(new, DisplayState::Results(Vec::new())));
        assert!(!view.set_if_current(old, DisplayState::Processing));
        assert_eq!(view.current(), DisplayState::Results(Vec::new()));
    }

    #[test]
    fn test_show_supersedes_racing_stale_writers() {
        let stale = DisplayState::Results(candidates(&[B]));
        let fresh = DisplayState::Results(candidates(&[A]));

        for _ in 0..200 {
            let view = ForegroundView::new();
            let old = view.begin();
            std::thread::scope(|scope| {
                for _ in 0..4 {
                    scope.spawn(|| {
                        for _ in 0..50 {
                            view.set_if_current(old, stale.clone());
                        }
                    });
                }
                scope.spawn(|| view.show(fresh.clone()));
            });
            // Whatever interleaving happened, the stale generation lost.
            assert_eq!(view.current(), fresh);
            assert!(!view.set_if_current(old, stale.clone()));
        }
    }

    #[tokio::test]
    async fn test_early_push_not_hidden_by_loading() {
        let (tx, rx) = mpsc::channel(4);
        let (sync, _) = sync_with(FakeLink {
            push: Mutex::new(Some(rx)),
            ..Default::default()
        });
        let _guard = sync.listen().await.unwrap();

        tx.send(ForegroundMessage::candidates(candidates(&[A])))
            .await
            .unwrap();
        wait_for(sync.view(), |s| matches!(s, DisplayState::Results(_))).await;

        let path = sync.start(&url("http://localhost/?loading=true")).await;
        assert_eq!(path, StartupPath::AwaitingBackground);
        assert_eq!(sync.view().current(), DisplayState::Results(candidates(&[A])));
    }

    #[tokio::test]
    async fn test_run_batch_replaces_results() {
        let (sync, _) = sync_with(FakeLink::default());
        sync.run_batch(Vec::new(), A).await.unwrap();
        let second = sync.run_batch(Vec::new(), "nada").await.unwrap();

        assert!(second.is_empty());
        assert_eq!(sync.view().current(), DisplayState::Results(Vec::new()));
    }

    #[test]
    fn test_sse_decoder_handles_split_frames() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b": keep-alive\n\ndata: {\"candi").is_empty());
        let messages = decoder.push(format!("dates\":[\"{}\"]}}\r\n\r\ndata: {{\"error\":\"x\"}}\n\n", A).as_bytes());

        assert_eq!(
            messages,
            vec![
                ForegroundMessage::candidates(candidates(&[A])),
                ForegroundMessage::error("x"),
            ]
        );
    }

    #[test]
    fn test_sse_decoder_skips_malformed() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"data: not json\n\n").is_empty());
    }

    #[test]
    fn test_endpoint_paths() {
        let link = HttpBackgroundLink::new(url("http://127.0.0.1:3000"), reqwest::Client::new());
        assert_eq!(
            link.endpoint(&["income", "my file"]).unwrap().as_str(),
            "http://127.0.0.1:3000/income/my%20file"
        );
        assert_eq!(
            link.endpoint(&["events"]).unwrap().as_str(),
            "http://127.0.0.1:3000/events"
        );
    }
}
