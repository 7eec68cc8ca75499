//! Connection abstraction for asynchronous serial communication.
//!
//! The provisioning stack never talks to a serial device directly. It drives
//! a [`Connection`], a cheap, cloneable handle to one port, and reads through
//! the [`ByteStream`] sub-streams that the connection hands out.
//!
//! ```text
//! +------------------+   +------------------+   +------------------+
//! |  Line Transport  |   |  Flash sequence  |   |  Device restart  |
//! +--------+---------+   +--------+---------+   +--------+---------+
//!          |                      |                      |
//!          v                      v                      v
//! +--------+----------------------+----------------------+---------+
//! |                       Connection trait                         |
//! +--------+-------------------------------------------------------+
//!          |
//!          v
//! +--------+---------+
//! |   NativePort     |
//! |   (serialport)   |
//! +------------------+
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use jagflash::port::{Connection, Signals};
//!
//! async fn pulse_reset<C: Connection>(port: &C) -> jagflash::Result<()> {
//!     port.set_signals(Signals::request_to_send(true)).await?;
//!     port.set_signals(Signals::request_to_send(false)).await
//! }
//! ```

#[cfg(feature = "native")]
pub mod native;

#[cfg(test)]
pub(crate) mod mock;

use std::future::Future;
use std::time::Duration;

use log::trace;

use crate::error::Result;

/// Baud rate understood by the ESP32 boot ROM.
pub const ROM_BAUD: u32 = 115_200;

/// How long the reset line is held during a device restart.
pub const RESET_PULSE: Duration = Duration::from_millis(100);

/// Serial port configuration.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyUSB0", "COM3").
    pub port_name: String,
    /// Baud rate used when the port is opened.
    pub baud_rate: u32,
    /// Poll interval of the blocking reader thread.
    pub timeout: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: ROM_BAUD,
            timeout: Duration::from_millis(50),
        }
    }
}

impl SerialConfig {
    /// Create a new configuration with port name and baud rate.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Set the reader poll timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Output control signals. `None` leaves a line untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Signals {
    /// DTR, the "device ready" line.
    pub data_terminal_ready: Option<bool>,
    /// RTS, wired to the chip's reset on most dev boards.
    pub request_to_send: Option<bool>,
}

impl Signals {
    /// Change only DTR.
    pub fn data_terminal_ready(level: bool) -> Self {
        Self {
            data_terminal_ready: Some(level),
            request_to_send: None,
        }
    }

    /// Change only RTS.
    pub fn request_to_send(level: bool) -> Self {
        Self {
            data_terminal_ready: None,
            request_to_send: Some(level),
        }
    }
}

/// Serial port information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    /// Port name/path.
    pub name: String,
    /// USB vendor ID (if available).
    pub vid: Option<u16>,
    /// USB product ID (if available).
    pub pid: Option<u16>,
    /// Manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Product string (if available).
    pub product: Option<String>,
    /// Serial number (if available).
    pub serial_number: Option<String>,
}

/// A readable sub-stream of a connection.
///
/// A sub-stream may end (`Ok(None)`) while the connection itself stays
/// usable; the caller is then expected to ask the connection for a new one.
pub trait ByteStream: Send + 'static {
    /// Wait for the next chunk of bytes. `Ok(None)` means the stream ended.
    fn read_chunk(&mut self) -> impl Future<Output = Result<Option<Vec<u8>>>> + Send;

    /// Cancel the stream and release its resources.
    fn cancel(&mut self) -> impl Future<Output = Result<()>> + Send;
}

/// Handle to a byte-oriented serial connection.
///
/// Clones refer to the same underlying port. `open` on an open port fails
/// with [`Error::PortAlreadyOpen`](crate::Error::PortAlreadyOpen) and `close`
/// on a closed port with
/// [`Error::PortAlreadyClosed`](crate::Error::PortAlreadyClosed); callers
/// treat both as benign.
pub trait Connection: Clone + Send + Sync + 'static {
    /// Sub-stream type handed out by [`Connection::readable`].
    type Stream: ByteStream;

    /// Port name/path.
    fn name(&self) -> &str;

    /// Open the port at the given baud rate.
    fn open(&self, baud_rate: u32) -> impl Future<Output = Result<()>> + Send;

    /// Close the port.
    fn close(&self) -> impl Future<Output = Result<()>> + Send;

    /// Drive the output control lines.
    fn set_signals(&self, signals: Signals) -> impl Future<Output = Result<()>> + Send;

    /// Open a new readable sub-stream.
    fn readable(&self) -> Result<Self::Stream>;

    /// Write all bytes to the port.
    fn write(&self, data: &[u8]) -> impl Future<Output = Result<()>> + Send;
}

/// Soft-reset the device by toggling the control lines.
///
/// Drops DTR, asserts RTS, waits [`RESET_PULSE`] and releases RTS.
pub async fn restart<C: Connection>(connection: &C) -> Result<()> {
    trace!("Restarting device on {}", connection.name());
    connection
        .set_signals(Signals::data_terminal_ready(false))
        .await?;
    connection
        .set_signals(Signals::request_to_send(true))
        .await?;
    tokio::time::sleep(RESET_PULSE).await;
    connection
        .set_signals(Signals::request_to_send(false))
        .await
}

/// Trait for listing available serial ports.
pub trait PortEnumerator {
    /// List all available serial ports.
    fn list_ports() -> Result<Vec<PortInfo>>;

    /// Find ports matching the given VID/PID.
    fn find_by_vid_pid(vid: u16, pid: u16) -> Result<Vec<PortInfo>> {
        let ports = Self::list_ports()?;
        Ok(ports
            .into_iter()
            .filter(|p| p.vid == Some(vid) && p.pid == Some(pid))
            .collect())
    }
}

#[cfg(feature = "native")]
pub use native::{NativePort, NativePortEnumerator, NativeStream};
