//! # jagflash
//!
//! A library for provisioning Jaguar devices on ESP32 boards.
//!
//! This crate provides the protocol stack that sits between a serial
//! connection and a freshly provisioned device:
//!
//! - Line transport: cancellable, newline-delimited reads with an idle timeout
//! - Status parsing: hardware identity detection and Wi-Fi/console connectivity
//! - Image patching: config injection with XOR checksum and SHA-256 repair
//! - Flash orchestration over a chip loader, reported as a state machine
//!
//! ## Features
//!
//! - `native` (default): Native serial port support via the `serialport` crate
//! - `serde`: Serialization support for data types
//!
//! ## Example
//!
//! ```rust,no_run
//! use jagflash::{Connection, DetectOptions, NativePort, SerialConfig, detect_hardware_identity};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let port = NativePort::new(&SerialConfig::new("/dev/ttyUSB0", 115_200));
//!     port.open(115_200).await?;
//!
//!     let identity = detect_hardware_identity(&port, DetectOptions::default()).await;
//!     port.close().await?;
//!     println!("Found {}", identity?);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod device;
pub mod error;
pub mod flasher;
pub mod image;
pub mod monitor;
pub mod port;
pub mod provision;
pub mod status;
pub mod transport;

// Re-exports for convenience
// Native-specific re-exports
#[cfg(feature = "native")]
pub use port::{NativePort, NativePortEnumerator};
pub use {
    device::{ConnectionEvent, DetectedPort, DeviceKind, PortWatcher},
    error::{Error, LineFault, Result},
    flasher::{
        ChipFamily, ChipLoader, FlashOptions, FlashProgress, FlashState, LoaderOptions, Partition,
        check_hardware, flash,
    },
    image::{FirmwareImages, inject_config},
    port::{ByteStream, Connection, PortEnumerator, PortInfo, SerialConfig, Signals, restart},
    provision::{ProvisionedIds, ProvisioningConfig, plan_partitions, plan_partitions_with},
    status::{
        ConnectivityDetector, ConsoleStatus, DetectOptions, HardwareIdentity, WifiStatus,
        detect_hardware_identity,
    },
    transport::{LineReader, ReadResult, StopHandle},
};
