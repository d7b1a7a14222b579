//! CBU Finder - locate 22-digit CBU candidates in images, PDFs and text.
//!
//! `serve` runs the background context: it accepts shared content, buffers
//! it or relays it as notifications, and pushes results to open views.
//! `open` runs a foreground view against it; `scan` extracts from local
//! files and pasted text directly.

mod bus;
mod candidate;
mod config;
mod foreground;
mod intake;
mod ocr;
mod pdf;
mod pipeline;
mod relay;
mod server;
mod source;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use reqwest::Url;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bus::MessageBus;
use config::{NotifierKind, Settings};
use foreground::{DisplayState, ForegroundSync, HttpBackgroundLink, StartupPath};
use intake::IntakeStore;
use pipeline::AggregationPipeline;
use relay::{LogNotifier, NotificationRelay, Notifier, WebhookNotifier};
use server::AppState;
use source::{Engines, FilePayload, InputItem};

#[derive(Parser)]
#[command(name = "cbu-finder", version, about = "Find CBU candidates in images, PDFs and text")]
struct Cli {
    /// Optional JSON settings file; environment variables override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the background server (share intake, notifications, push events).
    Serve,

    /// Open a foreground view: show a deep-linked result, wait for a push,
    /// or pull pending intake.
    Open {
        /// Page URL of the view, e.g. `/?cbu=...` or `/?loading=true`.
        #[arg(long)]
        url: Option<String>,

        /// Seconds to wait for a push message when loading.
        #[arg(long, default_value_t = 120)]
        wait: u64,
    },

    /// Extract candidates from local files and text.
    Scan {
        files: Vec<PathBuf>,

        /// Extra pasted text to search.
        #[arg(long, default_value = "")]
        text: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "cbu_finder=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())?;
    let client = reqwest::Client::new();

    let engines = Engines {
        ocr: ocr::build_provider(&settings, client.clone())?,
        pdf: Arc::new(pdf::LopdfEngine),
    };
    info!("OCR provider: {} (lang={})", engines.ocr.name(), settings.ocr_language);
    let pipeline = AggregationPipeline::new(engines);

    match cli.command {
        Commands::Serve => serve(settings, pipeline, client).await,
        Commands::Open { url, wait } => open(settings, pipeline, client, url, wait).await,
        Commands::Scan { files, text } => scan(pipeline, files, &text).await,
    }
}

async fn serve(settings: Settings, pipeline: AggregationPipeline, client: reqwest::Client) -> anyhow::Result<()> {
    let notifier: Arc<dyn Notifier> = match settings.notifier {
        NotifierKind::Log => Arc::new(LogNotifier::new(settings.server_url.clone())),
        NotifierKind::Webhook => {
            let url = settings
                .notify_webhook_url
                .clone()
                .context("NOTIFY_WEBHOOK_URL not set")?;
            Arc::new(WebhookNotifier::new(url, settings.server_url.clone(), client))
        }
    };

    let bus = MessageBus::default();
    let state = AppState {
        intake: IntakeStore::spawn(),
        relay: Arc::new(NotificationRelay::new(pipeline, notifier, bus.clone())),
        bus,
        settings: Arc::new(settings),
    };

    let bind_addr = state.settings.bind_addr.clone();
    let app = server::router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("Server listening on http://{}", bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}

async fn open(
    settings: Settings,
    pipeline: AggregationPipeline,
    client: reqwest::Client,
    url: Option<String>,
    wait: u64,
) -> anyhow::Result<()> {
    let server_url = Url::parse(&settings.server_url)
        .with_context(|| format!("Invalid server URL: {}", settings.server_url))?;
    let page = url.unwrap_or_else(|| settings.foreground_url.clone());
    let page_url = Url::parse(&page)
        .or_else(|_| server_url.join(&page))
        .with_context(|| format!("Invalid page URL: {}", page))?;

    let link = Arc::new(HttpBackgroundLink::new(server_url, client));
    let sync = ForegroundSync::new(link, pipeline);

    let _guard = match sync.listen().await {
        Ok(guard) => Some(guard),
        Err(e) => {
            warn!("Push messages unavailable: {:#}", e);
            None
        }
    };

    let path = sync.start(&page_url).await;
    info!("Foreground startup: {:?}", path);

    if path == StartupPath::AwaitingBackground {
        let mut rx = sync.view().watch();
        let settled = rx.wait_for(|s| matches!(s, DisplayState::Results(_) | DisplayState::Failed(_)));
        if tokio::time::timeout(Duration::from_secs(wait), settled).await.is_err() {
            warn!("No result from the background after {}s", wait);
        }
    }

    print_state(&sync.view().current());
    Ok(())
}

async fn scan(pipeline: AggregationPipeline, files: Vec<PathBuf>, text: &str) -> anyhow::Result<()> {
    let mut items = Vec::new();
    for path in files {
        let data = tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read {:?}", path))?;
        items.push(InputItem::File(FilePayload {
            name: path.display().to_string(),
            media_type: source::guess_media_type(&path).to_string(),
            data: data.into(),
        }));
    }

    let found = pipeline.run(items, text).await;
    print_state(&DisplayState::Results(found));
    Ok(())
}

fn print_state(state: &DisplayState) {
    match state {
        DisplayState::Idle => println!("Nada pendiente"),
        DisplayState::Processing => println!("Procesando"),
        DisplayState::Results(found) if found.is_empty() => println!("{}", relay::TITLE_NONE),
        DisplayState::Results(found) => {
            for cbu in found {
                println!("{}", cbu);
            }
        }
        DisplayState::Failed(message) => eprintln!("{}", message),
    }
}
