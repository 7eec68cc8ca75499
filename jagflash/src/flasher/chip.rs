//! Chip families and the chip-programming loader interface.
//!
//! The ROM/stub protocol itself lives behind [`ChipLoader`]; the flash
//! sequence in [`super::flash`] only drives it.

use std::fmt;
use std::future::Future;

use crate::error::Result;

/// Espressif chip families a loader can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ChipFamily {
    /// ESP32, the provisioning target.
    #[default]
    Esp32,
    /// ESP32-S2.
    Esp32S2,
    /// ESP32-S3.
    Esp32S3,
    /// ESP32-C3.
    Esp32C3,
    /// ESP8266.
    Esp8266,
    /// Anything else.
    Unknown,
}

impl ChipFamily {
    /// Family Jaguar images are built for.
    pub const TARGET: Self = Self::Esp32;

    /// Whether Jaguar images run on this family.
    pub fn is_supported(&self) -> bool {
        *self == Self::TARGET
    }

    /// Get the chip family from a string name.
    pub fn from_name(name: &str) -> Self {
        match name
            .to_lowercase()
            .replace(['-', '_'], "")
            .as_str()
        {
            "esp32" => Self::Esp32,
            "esp32s2" => Self::Esp32S2,
            "esp32s3" => Self::Esp32S3,
            "esp32c3" => Self::Esp32C3,
            "esp8266" => Self::Esp8266,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for ChipFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Esp32 => write!(f, "ESP32"),
            Self::Esp32S2 => write!(f, "ESP32-S2"),
            Self::Esp32S3 => write!(f, "ESP32-S3"),
            Self::Esp32C3 => write!(f, "ESP32-C3"),
            Self::Esp8266 => write!(f, "ESP8266"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Options handed to a loader factory.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoaderOptions {
    /// Enable loader protocol tracing.
    pub debug: bool,
}

/// Chip-programming primitive speaking the ROM/stub protocol.
pub trait ChipLoader: Send {
    /// Sync with the boot ROM.
    fn connect(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// Release the chip.
    fn disconnect(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// Upload and start the flasher stub.
    fn load_stub(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// Switch both ends from `current` to `target` baud.
    fn set_baud_rate(&mut self, current: u32, target: u32)
    -> impl Future<Output = Result<()>> + Send;

    /// Erase the whole flash.
    fn erase_flash(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// Write `data` at `offset`, calling `on_chunk(idx, total)` per block.
    fn flash_data(
        &mut self,
        data: &[u8],
        offset: u32,
        on_chunk: &mut (dyn FnMut(usize, usize) + Send),
    ) -> impl Future<Output = Result<()>> + Send;

    /// Chip name as reported by the ROM.
    fn chip_name(&mut self) -> impl Future<Output = Result<String>> + Send;

    /// Chip family.
    fn chip_family(&mut self) -> impl Future<Output = Result<ChipFamily>> + Send;

    /// Factory MAC address.
    fn mac_addr(&mut self) -> impl Future<Output = Result<String>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chip_family_from_name() {
        assert_eq!(ChipFamily::from_name("ESP32"), ChipFamily::Esp32);
        assert_eq!(ChipFamily::from_name("esp32-s3"), ChipFamily::Esp32S3);
        assert_eq!(ChipFamily::from_name("ESP32_C3"), ChipFamily::Esp32C3);
        assert_eq!(ChipFamily::from_name("rp2040"), ChipFamily::Unknown);
    }

    #[test]
    fn test_only_esp32_is_supported() {
        assert!(ChipFamily::Esp32.is_supported());
        assert!(!ChipFamily::Esp32S2.is_supported());
        assert!(!ChipFamily::Unknown.is_supported());
    }
}
