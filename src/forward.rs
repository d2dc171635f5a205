//! ==============================================================================
//! forward.rs - fire-and-forget delivery to the persistence sink
//! ==============================================================================
//!
//! purpose:
//!     after every successful ingestion the reading is pushed, once, to a
//!     remote table (supabase / postgrest insert).
//!
//! delivery policy:
//!     - each forward runs on its own tokio task; the serial thread only
//!       spawns it and moves on.
//!     - failures (non-2xx, timeout, network) are logged and dropped.
//!       no retry, no queue. the cache already holds the newest value.
//!     - at most `max_in_flight` forwards run at once. a forward arriving
//!       while the cap is full is dropped.
//!     - a disabled sink has no client at all, so nothing is ever sent.
//!
//! relationships:
//!     - used by: ingest.rs (one `forward` per parsed reading)
//!     - uses: domain.rs (SinkRecord), config.rs (SinkConfig)
//!
//! ==============================================================================

use crate::config::SinkConfig;
use crate::domain::{Reading, SinkRecord};

use anyhow::{bail, Context, Result};
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// a write-only destination for readings
pub trait Sink: Send + Sync + 'static {
    fn deliver(&self, record: SinkRecord) -> impl Future<Output = Result<()>> + Send;
}

// ==============================================================================
// supabase sink
// ==============================================================================

pub struct SupabaseSink {
    client: reqwest::Client,
    url: String,
    access_key: String,
}

impl SupabaseSink {
    pub fn new(config: &SinkConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .context("failed to build sink http client")?;

        Ok(Self {
            client,
            url: config.insert_url(),
            access_key: config.access_key.clone(),
        })
    }
}

impl Sink for SupabaseSink {
    async fn deliver(&self, record: SinkRecord) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .header("apikey", &self.access_key)
            .bearer_auth(&self.access_key)
            .header("Prefer", "return=minimal")
            .json(&record)
            .send()
            .await
            .context("sink request error")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("sink insert failed: {} {}", status, body);
        }
        Ok(())
    }
}

// ==============================================================================
// forwarder
// ==============================================================================

pub struct Forwarder<S> {
    sink: Option<Arc<S>>,
    device_id: Arc<str>,
    permits: Arc<Semaphore>,
    max_in_flight: usize,
    runtime: Handle,
}

impl Forwarder<SupabaseSink> {
    /// build from config; an inactive sink config yields a forwarder that
    /// never sends
    pub fn from_config(config: &SinkConfig, runtime: Handle) -> Result<Self> {
        if !config.is_active() {
            if config.enabled {
                warn!("Sink enabled but no base_url configured - forwarding disabled");
            } else {
                info!("Sink forwarding disabled");
            }
            return Ok(Self::new(None, &config.device_id, config.max_in_flight, runtime));
        }

        if config.access_key.is_empty() {
            warn!("Sink access key is empty - inserts will likely be rejected");
        }
        let sink = SupabaseSink::new(config)?;
        info!(url = %sink.url, "Forwarding readings to sink");
        Ok(Self::new(Some(sink), &config.device_id, config.max_in_flight, runtime))
    }
}

impl<S: Sink> Forwarder<S> {
    pub fn new(sink: Option<S>, device_id: &str, max_in_flight: usize, runtime: Handle) -> Self {
        let max_in_flight = max_in_flight.max(1);
        Self {
            sink: sink.map(Arc::new),
            device_id: Arc::from(device_id),
            permits: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
            runtime,
        }
    }

    /// forwards currently running
    pub fn in_flight(&self) -> usize {
        self.max_in_flight - self.permits.available_permits()
    }

    /// spawn one delivery of `reading`; returns whether a delivery was started
    ///
    /// callable from any thread, never blocks.
    pub fn forward(&self, reading: &Reading) -> bool {
        let Some(sink) = &self.sink else {
            return false;
        };

        let permit = match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(max_in_flight = self.max_in_flight, "Sink busy - dropping forward");
                return false;
            }
        };

        let record = SinkRecord::new(reading, &self.device_id);
        let sink = Arc::clone(sink);
        let (temperature, ph, tds) = (reading.temperature, reading.ph, reading.tds);

        self.runtime.spawn(async move {
            let _permit = permit;
            match sink.deliver(record).await {
                Ok(()) => info!(temperature, ph, tds, "Sink insert OK"),
                Err(e) => warn!("{:#}", e),
            }
        });
        debug!(in_flight = self.in_flight(), "Forward spawned");
        true
    }
}


// ==============================================================================
// tests
// ==============================================================================
#[cfg(test)]
mod tests {
    use super::testing::RecordingSink;
    use super::*;
    use axum::http::{HeaderMap, StatusCode};
    use axum::{routing::post, Json, Router};
    use serde_json::Value;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn reading() -> Reading {
        Reading { captured_at: 1_700_000_000_000, temperature: 24.57, turbidity: 3.2, ph: 7.05, tds: 210.0 }
    }

    /// in-process postgrest stand-in answering every insert with `status`
    async fn mock_sink(status: StatusCode) -> (String, mpsc::UnboundedReceiver<(HeaderMap, Value)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let app = Router::new().route(
            "/rest/v1/:table",
            post(move |headers: HeaderMap, Json(body): Json<Value>| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send((headers, body));
                    status
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}", addr), rx)
    }

    fn sink_config(base_url: &str) -> SinkConfig {
        SinkConfig {
            base_url: base_url.to_string(),
            access_key: "test-key".to_string(),
            ..SinkConfig::default()
        }
    }

    async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for delivery")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn supabase_insert_has_expected_shape() {
        let (url, mut rx) = mock_sink(StatusCode::CREATED).await;
        let forwarder = Forwarder::from_config(&sink_config(&url), Handle::current()).unwrap();

        assert!(forwarder.forward(&reading()));
        let (headers, body) = next(&mut rx).await;

        assert_eq!(headers["apikey"], "test-key");
        assert_eq!(headers["authorization"], "Bearer test-key");
        assert_eq!(headers["prefer"], "return=minimal");
        assert_eq!(headers["content-type"], "application/json");

        assert_eq!(body["device_id"], "arduino_uno");
        assert_eq!(body["temperature"], 24.57);
        assert_eq!(body["turbidity"], 3.2);
        assert_eq!(body["ph_value"], 7.05);
        assert_eq!(body["tds_value"], 210.0);
        assert_eq!(body["timestamp"], "2023-11-14T22:13:20Z");
    }

    #[tokio::test]
    async fn server_errors_do_not_stop_later_forwards() {
        let (url, mut rx) = mock_sink(StatusCode::INTERNAL_SERVER_ERROR).await;
        let forwarder = Forwarder::from_config(&sink_config(&url), Handle::current()).unwrap();

        assert!(forwarder.forward(&reading()));
        next(&mut rx).await;

        let mut second = reading();
        second.ph = 6.8;
        assert!(forwarder.forward(&second));
        let (_, body) = next(&mut rx).await;
        assert_eq!(body["ph_value"], 6.8);
    }

    #[tokio::test]
    async fn failed_delivery_reports_status() {
        let (url, _rx) = mock_sink(StatusCode::INTERNAL_SERVER_ERROR).await;
        let sink = SupabaseSink::new(&sink_config(&url)).unwrap();

        let err = sink.deliver(SinkRecord::new(&reading(), "arduino_uno")).await.unwrap_err();
        assert!(format!("{:#}", err).contains("500"));
    }

    #[tokio::test]
    async fn disabled_flag_means_no_requests() {
        let (url, mut rx) = mock_sink(StatusCode::CREATED).await;
        let config = SinkConfig { enabled: false, ..sink_config(&url) };
        let forwarder = Forwarder::from_config(&config, Handle::current()).unwrap();

        for _ in 0..50 {
            assert!(!forwarder.forward(&reading()));
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn missing_base_url_disables_forwarding() {
        let forwarder = Forwarder::from_config(&SinkConfig::default(), Handle::current()).unwrap();
        assert!(!forwarder.forward(&reading()));
    }

    #[tokio::test]
    async fn records_carry_configured_device_id() {
        let (sink, mut rx) = RecordingSink::new();
        let forwarder = Forwarder::new(Some(sink), "tank-2", 4, Handle::current());

        assert!(forwarder.forward(&reading()));
        let record = next(&mut rx).await;
        assert_eq!(record.device_id, "tank-2");
        assert_eq!(record.ph_value, 7.05);
    }

    /// holds every delivery until the gate gets permits
    struct GatedSink {
        gate: Arc<Semaphore>,
    }

    impl Sink for GatedSink {
        async fn deliver(&self, _record: SinkRecord) -> Result<()> {
            let _pass = self.gate.acquire().await?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn in_flight_cap_drops_excess_forwards() {
        let gate = Arc::new(Semaphore::new(0));
        let forwarder = Forwarder::new(Some(GatedSink { gate: gate.clone() }), "arduino_uno", 2, Handle::current());

        assert!(forwarder.forward(&reading()));
        assert!(forwarder.forward(&reading()));
        assert!(!forwarder.forward(&reading()));
        assert_eq!(forwarder.in_flight(), 2);

        gate.add_permits(2);
        tokio::time::timeout(Duration::from_secs(5), async {
            while forwarder.in_flight() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("forwards never finished");

        assert!(forwarder.forward(&reading()));
    }
}
