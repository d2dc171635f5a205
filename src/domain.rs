//! ==============================================================================
//! domain.rs - readings, device frames and outbound records
//! ==============================================================================
//!
//! purpose:
//!     the value types that flow through the relay.
//!     a device frame (one json line over serial) becomes a `Reading`;
//!     a `Reading` becomes a `Snapshot` (per stream tick) or a `SinkRecord`
//!     (per forward).
//!
//! relationships:
//!     - used by: ingest.rs (frame decoding), cache.rs (stored value)
//!     - used by: stream.rs (snapshots), forward.rs (sink records)
//!
//! ==============================================================================

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use serde_json::Value;

/// one decoded, rounded water-quality sample
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Reading {
    /// unix timestamp (ms) taken by the ingestor when the frame was parsed
    #[serde(rename = "timestamp_ms")]
    pub captured_at: u64,
    /// water temperature in celsius
    pub temperature: f64,
    /// turbidity in NTU
    pub turbidity: f64,
    pub ph: f64,
    /// total dissolved solids in ppm
    pub tds: f64,
}

impl Reading {
    /// build a reading from a decoded device frame
    ///
    /// never fails: absent, non-numeric or non-finite fields become 0.0.
    pub fn from_frame(frame: &serde_json::Map<String, Value>, captured_at: u64) -> Self {
        let field = |key: &str| round2(frame.get(key).map(numeric).unwrap_or(0.0));

        Self {
            captured_at,
            temperature: field("temperature_C"),
            turbidity: field("turbidity_NTU"),
            ph: field("pH"),
            tds: field("tds_ppm"),
        }
    }

    /// capture time as a utc datetime
    pub fn captured_at_utc(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.captured_at as i64)
            .single()
            .unwrap_or_default()
    }
}

/// decode one trimmed serial line
///
/// returns `None` for anything that is not a json object.
pub fn decode_frame(line: &str) -> Option<Reading> {
    match serde_json::from_str::<Value>(line) {
        Ok(Value::Object(frame)) => Some(Reading::from_frame(&frame, timestamp_ms())),
        _ => None,
    }
}

/// numbers and numeric strings, anything else (or non-finite) is 0.0
fn numeric(value: &Value) -> f64 {
    let n = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    n.filter(|v| v.is_finite()).unwrap_or(0.0)
}

/// round to two decimal places
///
/// goes through the decimal formatter so the exact stored value is rounded
/// once (`7.045` is really 7.04499.. and becomes 7.04).
pub fn round2(value: f64) -> f64 {
    format!("{:.2}", value).parse().unwrap_or(value)
}

/// what a subscriber receives on each streaming tick
#[derive(Clone, Debug, Serialize)]
pub struct Snapshot {
    #[serde(flatten)]
    pub reading: Reading,
    /// emission time, distinct from `timestamp_ms`
    pub timestamp: DateTime<Utc>,
}

impl Snapshot {
    pub fn stamp(reading: Reading) -> Self {
        Self { reading, timestamp: Utc::now() }
    }
}

/// row written to the persistence sink
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SinkRecord {
    pub timestamp: DateTime<Utc>,
    pub device_id: String,
    pub temperature: f64,
    pub turbidity: f64,
    pub ph_value: f64,
    pub tds_value: f64,
}

impl SinkRecord {
    pub fn new(reading: &Reading, device_id: &str) -> Self {
        Self {
            timestamp: reading.captured_at_utc(),
            device_id: device_id.to_string(),
            temperature: reading.temperature,
            turbidity: reading.turbidity,
            ph_value: reading.ph,
            tds_value: reading.tds,
        }
    }
}

/// get current timestamp in milliseconds (unix epoch)
pub fn timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
