//! ==============================================================================
//! main.rs - water-quality relay entry point
//! ==============================================================================
//!
//! purpose:
//!     relays readings from an arduino (json lines over usb serial) to
//!     browsers (server-sent events) and to a supabase table, keeping only
//!     the latest reading in memory.
//!
//! responsibilities:
//!     - load configuration (relay.toml, then environment, then cli)
//!     - start the serial ingestor on its own os thread
//!     - serve the landing page, /stream and /api/latest
//!     - shut down on ctrl-c without waiting on the serial thread
//!
//! architecture:
//!
//!     ┌──────────────┐  set   ┌───────────────┐  get   ┌──────────────────┐
//!     │ serial thread├───────▶│ LatestReading │◀───────┤ /stream tickers  │
//!     │ (ingest.rs)  │        │  (cache.rs)   │        │ (one per client) │
//!     └──────┬───────┘        └───────────────┘        └──────────────────┘
//!            │ forward (spawned, capped)
//!            ▼
//!     ┌──────────────┐
//!     │ supabase     │
//!     │ (forward.rs) │
//!     └──────────────┘
//!
//! ==============================================================================

mod cache;
mod config;
mod domain;
mod forward;
mod ingest;
mod stream;
mod web;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Relay water-quality telemetry from a serial device to a live stream and a remote table.
#[derive(Parser)]
struct Cli {
    /// Config file (default: config/relay.toml if present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Serial port
    #[arg(short, long)]
    port: Option<String>,

    /// Serial baud rate
    #[arg(short, long)]
    baud: Option<u32>,

    /// Listen address
    #[arg(long)]
    bind: Option<String>,
}

impl Cli {
    fn apply(&self, config: &mut config::RelayConfig) {
        if let Some(port) = &self.port {
            config.serial.port = port.clone();
        }
        if let Some(baud) = self.baud {
            config.serial.baud = baud;
        }
        if let Some(bind) = &self.bind {
            config.server.bind = bind.clone();
        }
    }
}

// ==============================================================================
// main entry point
// ==============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // step 1: load configuration
    let mut config = match &cli.config {
        Some(path) => config::RelayConfig::load(path)?,
        None => config::RelayConfig::load_or_default(),
    };
    config.apply_env();
    cli.apply(&mut config);

    init_logging(&config.logging.level);
    config.print_summary();

    // step 2: shared state
    let cache = cache::LatestReading::new();
    let shutdown = Arc::new(AtomicBool::new(false));

    // step 3: serial ingestor on a plain thread; never joined
    let forwarder = forward::Forwarder::from_config(&config.sink, tokio::runtime::Handle::current())?;
    let ingestor = ingest::Ingestor::new(
        ingest::SerialConnector::new(&config.serial),
        cache.clone(),
        forwarder,
        &config.serial,
        shutdown.clone(),
    )
    .show_readings(config.logging.show_readings);

    std::thread::Builder::new()
        .name("serial-ingest".to_string())
        .spawn(move || ingestor.run())
        .context("failed to start serial thread")?;

    // step 4: web server
    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind))?;
    info!("Dashboard live at http://{}", listener.local_addr()?);

    let state = web::AppState {
        cache,
        stream: config.stream.clone(),
        shutdown: shutdown.clone(),
    };
    web::run_server(listener, state, async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Shutting down");
        shutdown.store(true, Ordering::SeqCst);
    })
    .await
}

/// RUST_LOG wins over the configured level
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .init();
}
