//! Device status parsing.
//!
//! Two consumers sit on top of the line transport:
//!
//! - [`detect_hardware_identity`] restarts the device and waits for the
//!   `[IDENTITY]` line printed during boot.
//! - [`ConnectivityDetector`] follows the running firmware's log and tracks
//!   Wi-Fi and console connectivity.

pub mod connectivity;
pub mod identity;

pub use connectivity::{ConnectivityDetector, ConnectivityState, ConsoleStatus, WifiStatus};
pub use identity::{
    DEFAULT_DETECT_TIMEOUT, DetectOptions, HARDWARE_ID_LEN, HardwareIdentity, IDENTITY_PREFIX,
    detect_hardware_identity, parse_identity_line,
};
