//! Serial byte transport
//!
//! The lowest layer of the stack: a duplex byte stream with blocking
//! read-with-timeout and write. The transaction engine owns the transport
//! behind a mutex and serializes whole transactions over it, so the
//! transport itself is single-threaded and only needs to be `Send`.

use std::io::{Read, Write};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serialport::{ClearBuffer, DataBits, Parity, SerialPort, StopBits};
use tracing::{debug, info, warn};

use crate::error::{Result, ServoError};
use crate::registers::{DEFAULT_BAUD_RATE, DEFAULT_TIMEOUT_MS};

/// Duplex byte stream used by the transaction engine.
///
/// Implemented by [`SerialTransport`] for real hardware and by in-memory
/// mocks in tests. Connection state transitions are driven by the facade;
/// the transport only reports them.
pub trait ByteTransport: Send {
    /// Open the stream. Idempotent when already connected.
    fn connect(&mut self) -> Result<()>;

    /// Flush and close the stream. Safe to call when already disconnected.
    fn disconnect(&mut self);

    /// Whether the stream is currently open.
    fn is_connected(&self) -> bool;

    /// Write all bytes. A partial or zero write with the stream in error
    /// state is a fatal write error; retry policy lives in the layer above.
    fn write(&mut self, data: &[u8]) -> Result<usize>;

    /// Read exactly `n` bytes within the read timeout. Fewer than `n`
    /// bytes, including zero, is a timeout, not success.
    fn read(&mut self, n: usize) -> Result<Vec<u8>>;

    /// Discard any pending input/output. Best-effort: failures are logged
    /// and never propagated.
    fn reset_buffers(&mut self);
}

/// Serial line settings (8N1 at 38400 baud by default)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Device path, e.g. `/dev/ttyUSB0` or `COM3`
    pub port: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    /// One of `none`, `even`, `odd`
    pub parity: String,
    /// Read timeout in milliseconds
    pub timeout_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            data_bits: 8,
            stop_bits: 1,
            parity: "none".to_string(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

impl SerialConfig {
    /// Config for a device path with the default line settings.
    pub fn for_port(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            ..Self::default()
        }
    }

    fn data_bits(&self) -> DataBits {
        match self.data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            _ => DataBits::Eight,
        }
    }

    fn stop_bits(&self) -> StopBits {
        match self.stop_bits {
            2 => StopBits::Two,
            _ => StopBits::One,
        }
    }

    fn parity(&self) -> Parity {
        match self.parity.as_str() {
            "even" => Parity::Even,
            "odd" => Parity::Odd,
            _ => Parity::None,
        }
    }
}

/// Blocking serial port transport.
pub struct SerialTransport {
    config: SerialConfig,
    port: Option<Box<dyn SerialPort>>,
}

impl SerialTransport {
    pub fn new(config: SerialConfig) -> Self {
        Self { config, port: None }
    }

    /// Line settings this transport was built with.
    pub fn config(&self) -> &SerialConfig {
        &self.config
    }
}

impl ByteTransport for SerialTransport {
    fn connect(&mut self) -> Result<()> {
        if self.port.is_some() {
            debug!("Serial port {} already open", self.config.port);
            return Ok(());
        }

        info!(
            "Opening serial port {} at {} baud",
            self.config.port, self.config.baud_rate
        );

        let port = serialport::new(&self.config.port, self.config.baud_rate)
            .data_bits(self.config.data_bits())
            .stop_bits(self.config.stop_bits())
            .parity(self.config.parity())
            .timeout(Duration::from_millis(self.config.timeout_ms))
            .open()
            .map_err(|e| {
                ServoError::connection(format!("cannot open serial port {}: {e}", self.config.port))
            })?;

        // Stale bytes from a previous session would desync the first frame
        if let Err(e) = port.clear(ClearBuffer::All) {
            warn!("Failed to clear serial buffers: {e}");
        }

        self.port = Some(port);
        info!("Serial port {} opened", self.config.port);
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Some(mut port) = self.port.take() {
            if let Err(e) = port.flush() {
                warn!("Error flushing serial port on close: {e}");
            }
            info!("Serial port {} closed", self.config.port);
        }
    }

    fn is_connected(&self) -> bool {
        self.port.is_some()
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        let port = self.port.as_mut().ok_or(ServoError::NotConnected)?;

        match port.write(data) {
            Ok(n) if n == data.len() => {
                if let Err(e) = port.flush() {
                    warn!("Serial flush after write failed: {e}");
                }
                Ok(n)
            }
            Ok(n) => Err(ServoError::communication(format!(
                "short serial write: {n}/{} bytes",
                data.len()
            ))),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                Err(ServoError::timeout("serial write timeout"))
            }
            Err(e) => {
                self.port = None;
                Err(ServoError::communication(format!("serial write error: {e}")))
            }
        }
    }

    fn read(&mut self, n: usize) -> Result<Vec<u8>> {
        let port = self.port.as_mut().ok_or(ServoError::NotConnected)?;

        let mut buf = vec![0u8; n];
        let mut filled = 0;
        while filled < n {
            match port.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(k) => filled += k,
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => break,
                Err(e) => {
                    self.port = None;
                    return Err(ServoError::communication(format!("serial read error: {e}")));
                }
            }
        }

        if filled < n {
            return Err(ServoError::timeout(format!(
                "serial read timeout: {filled}/{n} bytes"
            )));
        }
        Ok(buf)
    }

    fn reset_buffers(&mut self) {
        if let Some(port) = self.port.as_mut() {
            if let Err(e) = port.clear(ClearBuffer::All) {
                warn!("Failed to reset serial buffers: {e}");
            }
        }
    }
}

impl std::fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialTransport")
            .field("port", &self.config.port)
            .field("baud_rate", &self.config.baud_rate)
            .field("connected", &self.port.is_some())
            .finish()
    }
}
