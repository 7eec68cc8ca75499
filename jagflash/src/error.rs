//! Error types for jagflash.

use std::io;
use thiserror::Error;

/// Result type for jagflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Line-level faults reported by a serial connection.
///
/// These are recoverable: the line transport drops the current sub-stream
/// and opens a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineFault {
    /// A break condition was detected on the line.
    Break,
    /// The receive buffer overflowed and bytes were lost.
    BufferOverrun,
    /// A framing error (bad stop bit) was detected.
    Framing,
    /// A parity error was detected.
    Parity,
}

impl std::fmt::Display for LineFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Break => write!(f, "break"),
            Self::BufferOverrun => write!(f, "buffer overrun"),
            Self::Framing => write!(f, "framing error"),
            Self::Parity => write!(f, "parity error"),
        }
    }
}

/// Error type for jagflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Recoverable line fault on the serial connection.
    #[error("Line fault: {0}")]
    LineFault(LineFault),

    /// The connection has no readable side (closed or never opened).
    #[error("readable was null on serial port")]
    ReadableUnavailable,

    /// The port was already open when an open was requested.
    #[error("port is already open")]
    PortAlreadyOpen,

    /// The port was already closed when a close was requested.
    #[error("port is already closed")]
    PortAlreadyClosed,

    /// No valid `[IDENTITY]` line was seen before the stream closed.
    #[error("hardware identity not found")]
    HardwareIdentityNotFound,

    /// The connectivity detector was started twice.
    #[error("already running")]
    AlreadyRunning,

    /// Serialized configuration does not fit in the image config region.
    #[error("data too big to inline into binary ({len} bytes, capacity {capacity})")]
    ConfigTooLarge {
        /// Length of the serialized configuration.
        len: usize,
        /// Bytes available for configuration in the region.
        capacity: usize,
    },

    /// The firmware image cannot be patched.
    #[error("Invalid image: {0}")]
    InvalidImage(String),

    /// The firmware archive is malformed or incomplete.
    #[error("Invalid archive: {0}")]
    InvalidArchive(String),

    /// Failure reported by the chip-programming loader.
    #[error("Loader error: {0}")]
    Loader(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether the line transport should retry after this error.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::LineFault(_) => true,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }

    /// Whether this error is a benign open/close race that callers may ignore.
    pub fn is_benign_race(&self) -> bool {
        matches!(self, Self::PortAlreadyOpen | Self::PortAlreadyClosed)
    }

    /// Whether the device or port does not exist.
    pub fn is_device_missing(&self) -> bool {
        match self {
            Self::HardwareIdentityNotFound => true,
            Self::Io(e) => e.kind() == io::ErrorKind::NotFound,
            #[cfg(feature = "native")]
            Self::Serial(e) => match e.kind() {
                serialport::ErrorKind::NoDevice => true,
                serialport::ErrorKind::Io(kind) => kind == io::ErrorKind::NotFound,
                _ => false,
            },
            _ => false,
        }
    }
}
