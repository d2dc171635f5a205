//! ==============================================================================
//! config.rs - Runtime Configuration Loader
//! ==============================================================================
//!
//! purpose:
//!     defines the schema for `relay.toml`.
//!     loads configuration from file or falls back to defaults, then applies
//!     environment overrides.
//!
//! structure:
//!     - SerialConfig: Which device to open and how patiently.
//!     - StreamConfig: Tick and retry advisory for /stream subscribers.
//!     - SinkConfig: Where (and whether) readings are forwarded.
//!     - ServerConfig: Listen address.
//!     - LoggingConfig: Default log filter.
//!
//! no secret ever has a default here; the sink access key comes from the
//! file or from SUPABASE_KEY.
//!
//! ==============================================================================

use anyhow::Context;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct RelayConfig {
    pub serial: SerialConfig,
    pub stream: StreamConfig,
    pub sink: SinkConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SerialConfig {
    pub port: String,
    pub baud: u32,
    /// delay between failed open attempts
    pub open_retry_ms: u64,
    pub read_timeout_ms: u64,
    /// pause after a transport error before reconnecting
    pub error_pause_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StreamConfig {
    pub interval_ms: u64,
    /// reconnect advice sent to subscribers while no reading exists
    pub retry_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SinkConfig {
    pub enabled: bool,
    pub base_url: String,
    pub access_key: String,
    pub table: String,
    pub device_id: String,
    pub timeout_ms: u64,
    pub max_in_flight: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub show_readings: bool,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyACM0".to_string(),
            baud: 9600,
            open_retry_ms: 2000,
            read_timeout_ms: 1000,
            error_pause_ms: 1000,
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self { interval_ms: 1000, retry_ms: 2000 }
    }
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: String::new(),
            access_key: String::new(),
            table: "sensor_data".to_string(),
            device_id: "arduino_uno".to_string(),
            timeout_ms: 6000,
            max_in_flight: 8,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind: "0.0.0.0:5000".to_string() }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), show_readings: true }
    }
}

impl SerialConfig {
    pub fn open_retry(&self) -> Duration {
        Duration::from_millis(self.open_retry_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn error_pause(&self) -> Duration {
        Duration::from_millis(self.error_pause_ms)
    }
}

impl StreamConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    pub fn retry(&self) -> Duration {
        Duration::from_millis(self.retry_ms)
    }
}

impl SinkConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// enabled and pointing somewhere
    pub fn is_active(&self) -> bool {
        self.enabled && !self.base_url.trim().is_empty()
    }

    /// PostgREST insert endpoint for the configured table
    pub fn insert_url(&self) -> String {
        format!("{}/rest/v1/{}", self.base_url.trim_end_matches('/'), self.table)
    }
}

impl RelayConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file {}", path.as_ref().display()))?;

        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        toml::from_str(content).context("Failed to parse config")
    }

    /// Load with default fallback
    pub fn load_or_default() -> Self {
        let paths = [
            std::path::PathBuf::from("config").join("relay.toml"),
            std::path::PathBuf::from("..").join("config").join("relay.toml"),
        ];

        for path in &paths {
            if path.exists() {
                match Self::load(path) {
                    Ok(config) => {
                        println!("[CONFIG] Loaded from {}", path.display());
                        return config;
                    }
                    Err(e) => {
                        println!("[CONFIG] Warning: Failed to load {}: {:#}", path.display(), e);
                    }
                }
            }
        }

        println!("[CONFIG] Warning: No config file found - using defaults");
        Self::default()
    }

    /// overlay process environment
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// overlay values from `lookup` (the environment in production)
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(port) = lookup("SERIAL_PORT") {
            self.serial.port = port;
        }
        if let Some(baud) = lookup("SERIAL_BAUD") {
            match baud.trim().parse() {
                Ok(baud) => self.serial.baud = baud,
                Err(_) => println!("[CONFIG] Warning: Ignoring SERIAL_BAUD={:?}: not a number", baud),
            }
        }
        if let Some(url) = lookup("SUPABASE_URL") {
            self.sink.base_url = url;
        }
        if let Some(key) = lookup("SUPABASE_KEY") {
            self.sink.access_key = key;
        }
        if let Some(table) = lookup("SUPABASE_TABLE") {
            self.sink.table = table;
        }
        if let Some(flag) = lookup("SEND_TO_SUPABASE") {
            match parse_flag(&flag) {
                Some(enabled) => self.sink.enabled = enabled,
                None => println!("[CONFIG] Warning: Ignoring SEND_TO_SUPABASE={:?}: not a boolean", flag),
            }
        }
        if let Some(bind) = lookup("RELAY_BIND") {
            self.server.bind = bind;
        }
    }

    /// Print configuration summary
    pub fn print_summary(&self) {
        for line in self.summary_lines() {
            println!("{}", line);
        }
    }

    fn summary_lines(&self) -> Vec<String> {
        let sink = if self.sink.is_active() {
            format!("{} ({})", self.sink.table, self.sink.device_id)
        } else {
            "disabled".to_string()
        };
        let rows = [
            format!("Serial: {} @ {}", self.serial.port, self.serial.baud),
            format!("Stream Tick: {}ms", self.stream.interval_ms),
            format!("Sink: {}", sink),
            format!("Listen: {}", self.server.bind),
            format!("Log Level: {}", self.logging.level),
        ];

        let mut lines = vec![
            "┌─────────────────────────────────────────┐".to_string(),
            "│          RELAY CONFIGURATION            │".to_string(),
            "├─────────────────────────────────────────┤".to_string(),
        ];
        lines.extend(rows.iter().map(|row| format!("│ {:<39} │", row)));
        lines.push("└─────────────────────────────────────────┘".to_string());
        lines
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

// ==============================================================================
// tests
// ==============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_the_device_setup() {
        let config = RelayConfig::default();
        assert_eq!(config.serial.port, "/dev/ttyACM0");
        assert_eq!(config.serial.baud, 9600);
        assert_eq!(config.serial.open_retry(), Duration::from_secs(2));
        assert_eq!(config.stream.retry(), Duration::from_millis(2000));
        assert_eq!(config.sink.timeout(), Duration::from_secs(6));
        assert_eq!(config.sink.device_id, "arduino_uno");
        assert!(config.sink.access_key.is_empty());
        // enabled, but nowhere to send
        assert!(config.sink.enabled);
        assert!(!config.sink.is_active());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let config = RelayConfig::parse(
            r#"
            [serial]
            port = "/dev/ttyUSB1"

            [sink]
            base_url = "https://example.supabase.co/"
            table = "water"
            "#,
        )
        .unwrap();

        assert_eq!(config.serial.port, "/dev/ttyUSB1");
        assert_eq!(config.serial.baud, 9600);
        assert_eq!(config.stream.interval_ms, 1000);
        assert!(config.sink.is_active());
        assert_eq!(config.sink.insert_url(), "https://example.supabase.co/rest/v1/water");
    }

    #[test]
    fn summary_box_is_closed() {
        let lines = RelayConfig::default().summary_lines();
        let width = lines[0].chars().count();

        for line in &lines[1..lines.len() - 1] {
            assert_eq!(line.chars().count(), width, "{line:?}");
            assert!(line.ends_with('│') || line.ends_with('┤'), "{line:?}");
        }
        assert!(lines.iter().any(|l| l.contains("Serial: /dev/ttyACM0 @ 9600")));
        assert!(lines.iter().any(|l| l.contains("Sink: disabled")));
    }

    #[test]
    fn bad_toml_is_an_error() {
        assert!(RelayConfig::parse("[serial\nport = 1").is_err());
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = [
            ("SERIAL_PORT", "COM4"),
            ("SERIAL_BAUD", "115200"),
            ("SUPABASE_URL", "http://localhost:54321"),
            ("SUPABASE_KEY", "secret"),
            ("SUPABASE_TABLE", "readings"),
            ("SEND_TO_SUPABASE", "No"),
            ("RELAY_BIND", "127.0.0.1:8080"),
        ]
        .into_iter()
        .collect();

        let mut config = RelayConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.serial.port, "COM4");
        assert_eq!(config.serial.baud, 115200);
        assert_eq!(config.sink.base_url, "http://localhost:54321");
        assert_eq!(config.sink.access_key, "secret");
        assert_eq!(config.sink.table, "readings");
        assert!(!config.sink.enabled);
        assert_eq!(config.server.bind, "127.0.0.1:8080");
    }

    #[test]
    fn unparseable_env_values_are_ignored() {
        let mut config = RelayConfig::default();
        config.apply_overrides(|key| match key {
            "SERIAL_BAUD" => Some("fast".to_string()),
            "SEND_TO_SUPABASE" => Some("maybe".to_string()),
            _ => None,
        });

        assert_eq!(config.serial.baud, 9600);
        assert!(config.sink.enabled);
    }
}
