//! ==============================================================================
//! ingest.rs - serial ingestion loop
//! ==============================================================================
//!
//! purpose:
//!     owns the serial link to the microcontroller and turns each json line
//!     into a `Reading`. every parsed reading replaces the cache and fires
//!     exactly one forward.
//!
//! recovery:
//!     - open failure: log, wait `open_retry`, try again, forever (until shutdown)
//!     - read timeout / blank line: skip
//!     - non-json line: log, skip
//!     - transport error: log, wait `error_pause`, drop the port and reopen
//!
//! relationships:
//!     - used by: main.rs (runs `Ingestor::run` on a dedicated os thread)
//!     - uses: cache.rs (write), forward.rs (fire), domain.rs (decode)
//!     - uses: serialport (through `SerialConnector`)
//!
//! the serial side is behind `Connector` / `FrameSource` so the loop can be
//! driven from memory in tests.
//!
//! ==============================================================================

use crate::cache::LatestReading;
use crate::config::SerialConfig;
use crate::domain::{decode_frame, Reading};
use crate::forward::{Forwarder, Sink};

use anyhow::{Context, Result};
use serialport::{ClearBuffer, SerialPort};
use std::io::{self, BufRead, BufReader, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// a line-oriented byte source
pub trait FrameSource: Send {
    /// next complete line, `Ok(None)` when nothing complete arrived in time
    fn read_line(&mut self) -> io::Result<Option<String>>;
}

/// opens a fresh `FrameSource`
pub trait Connector: Send {
    type Source: FrameSource;

    fn open(&self) -> Result<Self::Source>;
    fn describe(&self) -> String;
}

// ==============================================================================
// serial implementation
// ==============================================================================

pub struct SerialConnector {
    port: String,
    baud: u32,
    read_timeout: Duration,
}

impl SerialConnector {
    pub fn new(config: &SerialConfig) -> Self {
        Self {
            port: config.port.clone(),
            baud: config.baud,
            read_timeout: config.read_timeout(),
        }
    }
}

impl Connector for SerialConnector {
    type Source = LineReader<Box<dyn SerialPort>>;

    fn open(&self) -> Result<Self::Source> {
        let port = serialport::new(&self.port, self.baud)
            .timeout(self.read_timeout)
            .open()
            .with_context(|| format!("Failed to open {}", self.port))?;

        // anything queued before we attached is stale
        port.clear(ClearBuffer::Input)
            .context("failed to clear serial input buffer")?;

        Ok(LineReader::new(port))
    }

    fn describe(&self) -> String {
        format!("{} @ {}", self.port, self.baud)
    }
}

/// splits a timed-out byte stream into lines
///
/// bytes that arrive before a timeout are kept and completed by a later call.
pub struct LineReader<R> {
    reader: BufReader<R>,
    pending: Vec<u8>,
}

impl<R: Read> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self { reader: BufReader::new(inner), pending: Vec::new() }
    }

    fn take_line(&mut self) -> String {
        let line = String::from_utf8_lossy(&self.pending).replace(char::REPLACEMENT_CHARACTER, "");
        self.pending.clear();
        line
    }
}

impl<R: Read + Send> FrameSource for LineReader<R> {
    fn read_line(&mut self) -> io::Result<Option<String>> {
        match self.reader.read_until(b'\n', &mut self.pending) {
            Ok(0) if self.pending.is_empty() => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "serial device closed",
            )),
            Ok(_) => Ok(Some(self.take_line())),
            Err(e) if matches!(
                e.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
            ) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

// ==============================================================================
// frame reading
// ==============================================================================

#[derive(Debug, PartialEq)]
pub enum Frame {
    Reading(Reading),
    Skip,
}

/// read one line and decode it
///
/// only transport failures are errors; blank and malformed lines are `Skip`.
pub fn read_next_frame<F: FrameSource + ?Sized>(source: &mut F) -> io::Result<Frame> {
    let Some(line) = source.read_line()? else {
        return Ok(Frame::Skip);
    };

    let line = line.trim();
    if line.is_empty() {
        return Ok(Frame::Skip);
    }

    match decode_frame(line) {
        Some(reading) => Ok(Frame::Reading(reading)),
        None => {
            warn!("Non-JSON line: {}", line);
            Ok(Frame::Skip)
        }
    }
}

// ==============================================================================
// ingestor
// ==============================================================================

pub struct Ingestor<C, S> {
    connector: C,
    cache: LatestReading,
    forwarder: Forwarder<S>,
    open_retry: Duration,
    error_pause: Duration,
    show_readings: bool,
    shutdown: Arc<AtomicBool>,
}

impl<C: Connector, S: Sink> Ingestor<C, S> {
    pub fn new(
        connector: C,
        cache: LatestReading,
        forwarder: Forwarder<S>,
        config: &SerialConfig,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            connector,
            cache,
            forwarder,
            open_retry: config.open_retry(),
            error_pause: config.error_pause(),
            show_readings: true,
            shutdown,
        }
    }

    pub fn show_readings(mut self, show: bool) -> Self {
        self.show_readings = show;
        self
    }

    /// open the device, retrying until it works
    ///
    /// `None` only when shutdown was requested first.
    pub fn connect(&self) -> Option<C::Source> {
        while !self.is_shutdown() {
            match self.connector.open() {
                Ok(source) => {
                    info!("Opened serial: {}", self.connector.describe());
                    return Some(source);
                }
                Err(e) => {
                    warn!("{:#}", e);
                    self.pause(self.open_retry);
                }
            }
        }
        None
    }

    /// run until shutdown; never returns early on device errors
    pub fn run(&self) {
        'connection: while let Some(mut source) = self.connect() {
            while !self.is_shutdown() {
                match read_next_frame(&mut source) {
                    Ok(Frame::Reading(reading)) => self.ingest(reading),
                    Ok(Frame::Skip) => {}
                    Err(e) => {
                        error!("Serial read loop error: {}", e);
                        self.pause(self.error_pause);
                        continue 'connection;
                    }
                }
            }
            break;
        }
        info!("Serial ingestor stopped");
    }

    fn ingest(&self, reading: Reading) {
        self.cache.set(reading);
        if self.show_readings {
            info!(
                temperature = reading.temperature,
                turbidity = reading.turbidity,
                ph = reading.ph,
                tds = reading.tds,
                "Reading"
            );
        }
        if !self.forwarder.forward(&reading) {
            debug!("Reading not forwarded");
        }
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    // sleep in short slices so shutdown is noticed promptly
    fn pause(&self, duration: Duration) {
        let until = Instant::now() + duration;
        while !self.is_shutdown() {
            let now = Instant::now();
            if now >= until {
                break;
            }
            std::thread::sleep((until - now).min(Duration::from_millis(50)));
        }
    }
}
