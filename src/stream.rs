//! ==============================================================================
//! stream.rs - per-subscriber snapshot ticker
//! ==============================================================================
//!
//! each /stream subscriber gets its own ticker over the shared cache:
//!
//!     AWAITING_FIRST_READING ──(first set)──▶ STREAMING ──(disconnect)──▶ done
//!            │ retry advisory                    │ data event
//!            └──── every tick ───────────────────┘
//!
//! the ticker is a plain `Stream` owned by the sse response. hyper drops the
//! response when the client goes away, and the ticker goes with it, so there
//! is no background task to leak. it also ends on its own at the first tick
//! after shutdown, which lets graceful shutdown complete.
//!
//! ==============================================================================

use crate::cache::LatestReading;
use crate::config::StreamConfig;
use crate::domain::Snapshot;

use axum::response::sse::Event;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::{Stream, StreamExt};

/// one unit pushed to a subscriber
#[derive(Debug)]
pub enum StreamUnit {
    /// nothing ingested yet; tells the client how long to back off
    Retry(Duration),
    Data(Snapshot),
}

impl StreamUnit {
    /// current state of `cache`, stamped now
    pub fn from_cache(cache: &LatestReading, retry: Duration) -> Self {
        match cache.get() {
            Some(reading) => StreamUnit::Data(Snapshot::stamp(reading)),
            None => StreamUnit::Retry(retry),
        }
    }

    pub fn into_event(self) -> Result<Event, axum::Error> {
        match self {
            StreamUnit::Retry(retry) => Ok(Event::default().retry(retry)),
            StreamUnit::Data(snapshot) => Event::default().json_data(snapshot),
        }
    }
}

/// tick stream of cache snapshots; the first unit is immediate
pub fn snapshots(
    cache: LatestReading,
    config: &StreamConfig,
    shutdown: Arc<AtomicBool>,
) -> impl Stream<Item = StreamUnit> + Send + 'static {
    let retry = config.retry();
    let mut ticker = tokio::time::interval(config.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    IntervalStream::new(ticker)
        .take_while(move |_| !shutdown.load(Ordering::SeqCst))
        .map(move |_| StreamUnit::from_cache(&cache, retry))
}
