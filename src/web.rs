//! ==============================================================================
//! web.rs - http surface
//! ==============================================================================
//!
//! routes:
//!     GET /            landing page (subscribes to /stream)
//!     GET /stream      server-sent events, one unit per tick
//!     GET /api/latest  cached reading as json (null before the first one)
//!
//! relationships:
//!     - used by: main.rs (run_server)
//!     - uses: stream.rs (per-subscriber ticker), cache.rs (reads only)
//!
//! ==============================================================================

use crate::cache::LatestReading;
use crate::config::StreamConfig;
use crate::domain::Reading;
use crate::stream::{snapshots, StreamUnit};

use anyhow::Result;
use axum::{
    extract::State,
    response::{sse::Event, Html, Json, Sse},
    routing::get,
    Router,
};
use std::future::Future;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_stream::{Stream, StreamExt};
use tower_http::cors::CorsLayer;
use tracing::debug;

const INDEX_HTML: &str = include_str!("../assets/index.html");

/// everything a handler may touch
#[derive(Clone)]
pub struct AppState {
    pub cache: LatestReading,
    pub stream: StreamConfig,
    pub shutdown: Arc<AtomicBool>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/stream", get(stream_handler))
        .route("/api/latest", get(latest_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// serve until `shutdown` resolves and every open stream has ended
pub async fn run_server(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn stream_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    debug!("Subscriber connected");
    let units = snapshots(state.cache, &state.stream, state.shutdown);
    Sse::new(units.map(StreamUnit::into_event))
}

/// json api endpoint for programmatic access
async fn latest_handler(State(state): State<AppState>) -> Json<Option<Reading>> {
    Json(state.cache.get())
}
