//! Device discovery and classification utilities.
//!
//! Serial ports are classified by the USB bridge behind them. ESP32 dev
//! boards almost always sit behind a CP210x or CH340/CH9102 bridge, newer
//! chips expose Espressif's own USB-serial-JTAG device.

pub mod events;

use crate::error::{Error, Result};

#[cfg(feature = "native")]
use log::{debug, info, trace};

pub use events::{ConnectionEvent, DEFAULT_POLL_INTERVAL, PortWatcher, diff_ports, wait_for_removal};

/// Known USB bridge/device kinds commonly used with ESP32 boards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DeviceKind {
    /// CH340/CH341/CH9102 USB-to-Serial converter.
    Ch340,
    /// Silicon Labs CP210x USB-to-Serial converter.
    Cp210x,
    /// FTDI FT232/FT2232/FT4232 USB-to-Serial converter.
    Ftdi,
    /// Prolific PL2303 USB-to-Serial converter.
    Prolific,
    /// Espressif native USB (USB-serial-JTAG).
    Espressif,
    /// Unknown device.
    Unknown,
}

/// Known USB VID/PID pairs. An empty PID list matches the whole vendor.
const KNOWN_USB_DEVICES: &[(u16, &[u16], DeviceKind)] = &[
    (
        0x1A86,
        &[0x7523, 0x7522, 0x5523, 0x55D4, 0x55D3],
        DeviceKind::Ch340,
    ),
    (0x10C4, &[0xEA60, 0xEA70, 0xEA71], DeviceKind::Cp210x),
    (
        0x0403,
        &[0x6001, 0x6010, 0x6011, 0x6014, 0x6015],
        DeviceKind::Ftdi,
    ),
    (0x067B, &[0x2303, 0x23A3, 0x23C3, 0x23D3], DeviceKind::Prolific),
    (0x303A, &[], DeviceKind::Espressif),
];

impl DeviceKind {
    /// Classify a USB VID/PID pair.
    #[must_use]
    pub fn from_vid_pid(vid: u16, pid: u16) -> Self {
        for (known_vid, pids, device) in KNOWN_USB_DEVICES {
            if vid == *known_vid && (pids.is_empty() || pids.contains(&pid)) {
                return *device;
            }
        }
        Self::Unknown
    }

    /// Get a human-readable name for the device kind.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ch340 => "CH340/CH9102",
            Self::Cp210x => "CP210x",
            Self::Ftdi => "FTDI",
            Self::Prolific => "PL2303",
            Self::Espressif => "Espressif USB",
            Self::Unknown => "Unknown",
        }
    }

    /// Check if this is a known/expected device kind.
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }

    /// Check if this device kind should be preferred during auto-selection.
    pub fn is_high_priority(&self) -> bool {
        matches!(self, Self::Espressif | Self::Cp210x | Self::Ch340)
    }

    /// Driver download page for bridges that need one on Windows/macOS.
    pub fn driver_url(&self) -> Option<&'static str> {
        match self {
            Self::Cp210x => {
                Some("https://www.silabs.com/developers/usb-to-uart-bridge-vcp-drivers")
            },
            Self::Ch340 => Some("https://www.wch-ic.com/downloads/CH341SER_EXE.html"),
            Self::Ftdi => Some("https://ftdichip.com/drivers/vcp-drivers/"),
            Self::Prolific | Self::Espressif | Self::Unknown => None,
        }
    }
}

/// Discovered serial port with classification.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DetectedPort {
    /// Port name/path (e.g., "/dev/ttyUSB0" or "COM3").
    pub name: String,
    /// Classified device kind.
    pub device: DeviceKind,
    /// USB Vendor ID (if available).
    pub vid: Option<u16>,
    /// USB Product ID (if available).
    pub pid: Option<u16>,
    /// Device manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Device product string (if available).
    pub product: Option<String>,
    /// Serial number (if available).
    pub serial: Option<String>,
}

impl DetectedPort {
    /// Port without USB metadata.
    pub fn unclassified(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            device: DeviceKind::Unknown,
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
            serial: None,
        }
    }

    /// Check if this port is likely an ESP32 board.
    pub fn is_likely_esp(&self) -> bool {
        self.device
            .is_known()
    }
}

impl From<crate::port::PortInfo> for DetectedPort {
    fn from(info: crate::port::PortInfo) -> Self {
        let device = match (info.vid, info.pid) {
            (Some(vid), Some(pid)) => DeviceKind::from_vid_pid(vid, pid),
            _ => DeviceKind::Unknown,
        };
        Self {
            name: info.name,
            device,
            vid: info.vid,
            pid: info.pid,
            manufacturer: info.manufacturer,
            product: info.product,
            serial: info.serial_number,
        }
    }
}

/// Detect all available ports with metadata.
#[cfg(feature = "native")]
pub fn detect_ports() -> Vec<DetectedPort> {
    use crate::port::{NativePortEnumerator, PortEnumerator};

    match NativePortEnumerator::list_ports() {
        Ok(ports) => ports
            .into_iter()
            .map(|info| {
                let detected = DetectedPort::from(info);
                trace!(
                    "Found port: {} (VID: {:?}, PID: {:?}, Device: {:?})",
                    detected.name, detected.vid, detected.pid, detected.device
                );
                detected
            })
            .collect(),
        Err(e) => {
            debug!("Failed to enumerate serial ports: {e}");
            Vec::new()
        },
    }
}

/// Detect all available ports (no native backend - always empty).
#[cfg(not(feature = "native"))]
pub fn detect_ports() -> Vec<DetectedPort> {
    Vec::new()
}

/// Detect ports that are likely ESP32 boards.
pub fn detect_esp_ports() -> Vec<DetectedPort> {
    detect_ports()
        .into_iter()
        .filter(DetectedPort::is_likely_esp)
        .collect()
}

/// Pick the most likely port out of `ports`.
///
/// Espressif native USB wins, then the common bridges, then any known
/// bridge, then whatever comes first.
pub fn select_port(ports: Vec<DetectedPort>) -> Result<DetectedPort> {
    if let Some(port) = ports
        .iter()
        .find(|p| p.device == DeviceKind::Espressif)
    {
        return Ok(port.clone());
    }

    if let Some(port) = ports
        .iter()
        .find(|p| {
            p.device
                .is_high_priority()
        })
    {
        return Ok(port.clone());
    }

    if let Some(port) = ports
        .iter()
        .find(|p| {
            p.device
                .is_known()
        })
    {
        return Ok(port.clone());
    }

    ports
        .into_iter()
        .next()
        .ok_or_else(|| Error::Config("no serial ports found".to_string()))
}

/// Auto-detect a single ESP32 port.
#[cfg(feature = "native")]
pub fn auto_detect_port() -> Result<DetectedPort> {
    let port = select_port(detect_ports())?;
    info!("Auto-detected {} port: {}", port.device.name(), port.name);
    Ok(port)
}

/// Find a port by name pattern.
pub fn find_port_by_pattern(pattern: &str) -> Result<DetectedPort> {
    detect_ports()
        .into_iter()
        .find(|p| {
            p.name
                .contains(pattern)
        })
        .ok_or_else(|| Error::Config(format!("no serial port matches '{pattern}'")))
}

/// Format a list of detected ports for display.
pub fn format_port_list(ports: &[DetectedPort]) -> Vec<String> {
    let mut result = Vec::new();

    for port in ports {
        let device_info = if port
            .device
            .is_known()
        {
            format!(" [{}]", port.device.name())
        } else if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
            format!(" [VID:{vid:04X} PID:{pid:04X}]")
        } else {
            String::new()
        };

        let product_info = port
            .product
            .as_ref()
            .map(|p| format!(" - {p}"))
            .unwrap_or_default();

        result.push(format!("{}{}{}", port.name, device_info, product_info));
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::PortInfo;

    fn usb(name: &str, vid: u16, pid: u16) -> DetectedPort {
        DetectedPort::from(PortInfo {
            name: name.to_string(),
            vid: Some(vid),
            pid: Some(pid),
            manufacturer: None,
            product: None,
            serial_number: None,
        })
    }

    #[test]
    fn test_device_kind_from_vid_pid() {
        assert_eq!(DeviceKind::from_vid_pid(0x1A86, 0x7523), DeviceKind::Ch340);
        assert_eq!(DeviceKind::from_vid_pid(0x1A86, 0x55D4), DeviceKind::Ch340);
        assert_eq!(DeviceKind::from_vid_pid(0x10C4, 0xEA60), DeviceKind::Cp210x);
        assert_eq!(DeviceKind::from_vid_pid(0x0403, 0x6001), DeviceKind::Ftdi);
        assert_eq!(DeviceKind::from_vid_pid(0x067B, 0x2303), DeviceKind::Prolific);
        assert_eq!(DeviceKind::from_vid_pid(0x303A, 0x1001), DeviceKind::Espressif);
        assert_eq!(DeviceKind::from_vid_pid(0x1234, 0x5678), DeviceKind::Unknown);
    }

    #[test]
    fn test_driver_urls() {
        assert!(
            DeviceKind::Cp210x
                .driver_url()
                .is_some()
        );
        assert!(
            DeviceKind::Espressif
                .driver_url()
                .is_none()
        );
    }

    #[test]
    fn test_from_port_info_without_usb() {
        let port = DetectedPort::from(PortInfo {
            name: "/dev/ttyS0".to_string(),
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
            serial_number: None,
        });
        assert_eq!(port, DetectedPort::unclassified("/dev/ttyS0"));
        assert!(!port.is_likely_esp());
    }

    #[test]
    fn test_select_port_priority() {
        let ports = vec![
            DetectedPort::unclassified("/dev/ttyS0"),
            usb("/dev/ttyUSB0", 0x0403, 0x6001),
            usb("/dev/ttyUSB1", 0x10C4, 0xEA60),
            usb("/dev/ttyACM0", 0x303A, 0x1001),
        ];
        assert_eq!(select_port(ports.clone()).unwrap().name, "/dev/ttyACM0");
        assert_eq!(select_port(ports[..3].to_vec()).unwrap().name, "/dev/ttyUSB1");
        assert_eq!(select_port(ports[..2].to_vec()).unwrap().name, "/dev/ttyUSB0");
        assert_eq!(select_port(ports[..1].to_vec()).unwrap().name, "/dev/ttyS0");
        assert!(select_port(Vec::new()).is_err());
    }

    #[test]
    fn test_format_port_list() {
        let mut bridge = usb("/dev/ttyUSB0", 0x1A86, 0x7523);
        bridge.product = Some("USB-Serial".to_string());
        let ports = vec![
            bridge,
            usb("/dev/ttyUSB1", 0x1234, 0x5678),
            DetectedPort::unclassified("/dev/ttyS0"),
        ];

        let formatted = format_port_list(&ports);
        assert_eq!(formatted[0], "/dev/ttyUSB0 [CH340/CH9102] - USB-Serial");
        assert_eq!(formatted[1], "/dev/ttyUSB1 [VID:1234 PID:5678]");
        assert_eq!(formatted[2], "/dev/ttyS0");
    }
}
