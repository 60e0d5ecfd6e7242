//! Serial line source for the ESP32 sensor board
//!
//! Protocol:
//! - Baud: 115200 default, 8N1
//! - Text lines terminated by `\n` (a trailing `\r` is trimmed)
//! - The board prints boot chatter for a few seconds after the port opens,
//!   so input is discarded once the warm-up delay elapses
//!
//! When no port is configured, the first USB serial port whose description
//! matches a known USB-UART bridge chip is used.

use crate::infra::config::Config;
use std::io::ErrorKind;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio_serial::{ClearBuffer, SerialPort, SerialPortBuilderExt, SerialPortInfo, SerialPortType, SerialStream};
use tracing::{debug, info, warn};

/// USB vendor ids of common USB-UART bridges, named so they match signatures
const KNOWN_BRIDGE_VIDS: [(u16, &str); 3] = [(0x1A86, "CH340"), (0x10C4, "CP210x"), (0x0403, "FTDI")];

#[derive(Debug, Error)]
pub enum SerialError {
    #[error("no serial port matching {signatures:?}")]
    NoDeviceFound { signatures: Vec<String> },

    #[error("failed to enumerate serial ports: {0}")]
    Enumerate(#[source] tokio_serial::Error),

    #[error("failed to open {port}: {source}")]
    Open {
        port: String,
        #[source]
        source: tokio_serial::Error,
    },

    #[error("serial read timed out")]
    ReadTimeout,

    #[error("serial device disconnected: {0}")]
    Disconnected(String),
}

/// Serial source settings, resolved from `Config`
#[derive(Debug, Clone)]
pub struct SerialSettings {
    pub port: Option<String>,
    pub baud: u32,
    pub warmup: Duration,
    pub read_timeout: Duration,
    pub retry_backoff: Duration,
    pub retry_budget: u32,
    pub chip_signatures: Vec<String>,
}

impl SerialSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            port: config.serial_port().map(str::to_string),
            baud: config.serial_baud(),
            warmup: config.serial_warmup(),
            read_timeout: config.serial_read_timeout(),
            retry_backoff: config.serial_retry_backoff(),
            retry_budget: config.serial_retry_budget(),
            chip_signatures: config.chip_signatures().to_vec(),
        }
    }
}

/// Human-readable description of a port, comparable to what OS tools show
pub fn describe_port(info: &SerialPortInfo) -> String {
    match &info.port_type {
        SerialPortType::UsbPort(usb) => {
            let mut parts = vec!["USB".to_string()];
            if let Some(manufacturer) = &usb.manufacturer {
                parts.push(manufacturer.clone());
            }
            if let Some(product) = &usb.product {
                parts.push(product.clone());
            }
            if let Some((_, chip)) = KNOWN_BRIDGE_VIDS.iter().find(|(vid, _)| *vid == usb.vid) {
                parts.push(chip.to_string());
            }
            format!("{} ({})", parts.join(" "), info.port_name)
        }
        SerialPortType::PciPort => format!("PCI ({})", info.port_name),
        SerialPortType::BluetoothPort => format!("Bluetooth ({})", info.port_name),
        SerialPortType::Unknown => info.port_name.clone(),
    }
}

/// First port whose description contains any signature, ignoring case
pub fn select_port<'a, I>(candidates: I, signatures: &[String]) -> Option<&'a str>
where
    I: IntoIterator<Item = (&'a str, String)>,
{
    let signatures: Vec<String> = signatures.iter().map(|s| s.to_ascii_lowercase()).collect();
    candidates.into_iter().find_map(|(name, description)| {
        let description = description.to_ascii_lowercase();
        signatures
            .iter()
            .any(|sig| !sig.is_empty() && description.contains(sig.as_str()))
            .then_some(name)
    })
}

/// Scan the system's serial ports for a known USB bridge chip
pub fn discover_port(signatures: &[String]) -> Result<String, SerialError> {
    let ports = tokio_serial::available_ports().map_err(SerialError::Enumerate)?;

    for port in &ports {
        debug!(port = %port.port_name, description = %describe_port(port), "serial_port_candidate");
    }

    select_port(ports.iter().map(|p| (p.port_name.as_str(), describe_port(p))), signatures)
        .map(str::to_string)
        .ok_or_else(|| SerialError::NoDeviceFound { signatures: signatures.to_vec() })
}

/// Buffered line reader over any byte stream.
///
/// Partial lines survive a read timeout and are completed by the next read.
pub struct LineReader<R> {
    reader: BufReader<R>,
    line: Vec<u8>,
    read_timeout: Duration,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(inner: R, read_timeout: Duration) -> Self {
        Self { reader: BufReader::new(inner), line: Vec::with_capacity(128), read_timeout }
    }

    /// Read one trimmed line, decoding invalid UTF-8 lossily
    pub async fn read_line(&mut self) -> Result<String, SerialError> {
        match tokio::time::timeout(self.read_timeout, self.reader.read_until(b'\n', &mut self.line))
            .await
        {
            // Bytes already read stay in `self.line` for the next call
            Err(_) => Err(SerialError::ReadTimeout),
            Ok(Ok(0)) if self.line.is_empty() => {
                Err(SerialError::Disconnected("end of stream".to_string()))
            }
            Ok(Ok(_)) => {
                // Either a full line, or a final unterminated one before EOF
                let text = String::from_utf8_lossy(&self.line).trim().to_string();
                self.line.clear();
                Ok(text)
            }
            Ok(Err(e)) if e.kind() == ErrorKind::TimedOut => Err(SerialError::ReadTimeout),
            Ok(Err(e)) => Err(SerialError::Disconnected(e.to_string())),
        }
    }
}

/// Open connection to the sensor board
pub struct SerialConnection {
    port: String,
    lines: LineReader<SerialStream>,
}

impl SerialConnection {
    /// Resolve the port, open it, wait out the boot chatter, and flush input
    pub async fn connect(settings: &SerialSettings) -> Result<Self, SerialError> {
        let port = match &settings.port {
            Some(port) => port.clone(),
            None => {
                let port = discover_port(&settings.chip_signatures)?;
                info!(port = %port, "serial_port_auto_detected");
                port
            }
        };

        let stream = tokio_serial::new(&port, settings.baud)
            .timeout(settings.read_timeout)
            .open_native_async()
            .map_err(|source| SerialError::Open { port: port.clone(), source })?;

        info!(port = %port, baud = %settings.baud, "serial_port_opened");

        debug!(warmup_ms = %settings.warmup.as_millis(), "serial_warmup");
        tokio::time::sleep(settings.warmup).await;
        if let Err(e) = stream.clear(ClearBuffer::Input) {
            warn!(port = %port, error = %e, "serial_clear_input_failed");
        }

        Ok(Self { port, lines: LineReader::new(stream, settings.read_timeout) })
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn into_lines(self) -> LineReader<SerialStream> {
        self.lines
    }
}
