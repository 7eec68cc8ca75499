//! Layered TOML configuration.
//!
//! Sources, highest priority first:
//! 1. Command-line flags and `JAGFLASH_*` variables (applied by the caller)
//! 2. `--config PATH`, which replaces the two file layers below
//! 3. `./jagflash.toml`
//! 4. `<config dir>/jagflash/config.toml`
//!
//! Remembered USB bridges live separately in `./jagflash_ports.toml` or
//! `<config dir>/jagflash/ports.toml`, the first one found wins.

use directories::ProjectDirs;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::fs;
use std::path::{Path, PathBuf};

use crate::CliError;

const LOCAL_CONFIG: &str = "jagflash.toml";
const LOCAL_PORTS_CONFIG: &str = "jagflash_ports.toml";
const GLOBAL_CONFIG: &str = "config.toml";
const GLOBAL_PORTS_CONFIG: &str = "ports.toml";

/// A USB bridge the user asked us to trust.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsbDevice {
    /// USB Vendor ID.
    pub vid: u16,
    /// USB Product ID.
    pub pid: u16,
}

impl UsbDevice {
    pub fn matches(&self, vid: u16, pid: u16) -> bool {
        self.vid == vid && self.pid == pid
    }
}

/// `[port.connection]`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Serial port to use without asking, e.g. "/dev/ttyUSB0" or "COM3".
    pub serial: Option<String>,
    /// Baud rate for the monitor and identity detection.
    pub baud: Option<u32>,
}

/// `[port]` table, also the whole content of a ports file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortConfig {
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Bridges treated as known during port auto-selection.
    #[serde(default)]
    pub usb_device: Vec<UsbDevice>,
}

/// `[provision]` fallbacks for `patch` and `extract`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvisionConfig {
    pub name: Option<String>,
    pub ssid: Option<String>,
}

/// `[detect]` fallbacks for the `detect` command.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetectConfig {
    pub timeout_ms: Option<u64>,
    pub restart: Option<bool>,
}

/// Everything a config file can hold.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub port: PortConfig,
    #[serde(default)]
    pub provision: ProvisionConfig,
    #[serde(default)]
    pub detect: DetectConfig,
}

fn overlay<T>(slot: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *slot = value;
    }
}

fn parse_file<T: DeserializeOwned>(path: &Path) -> Result<T, String> {
    let content = fs::read_to_string(path)
        .map_err(|e| format!("cannot read config file {}: {e}", path.display()))?;
    toml::from_str(&content).map_err(|e| format!("invalid config file {}: {e}", path.display()))
}

impl Config {
    /// Merge the global and local files, then attach the ports file.
    ///
    /// Broken files are skipped with a warning.
    pub fn load() -> Self {
        let layers = Self::global_config_path()
            .into_iter()
            .chain([PathBuf::from(LOCAL_CONFIG)]);

        let mut config = Self::default();
        for path in layers.filter(|path| path.exists()) {
            if let Some(layer) = Self::load_lenient(&path) {
                config.merge(layer);
            }
        }

        if let Some(port) = Self::ports_sources()
            .iter()
            .filter(|path| path.exists())
            .find_map(|path| parse_file::<PortConfig>(path).ok())
        {
            config.port = port;
        }

        config
    }

    /// Load only `path`. It must exist and parse.
    pub fn load_from_path(path: &Path) -> Result<Self, CliError> {
        let config = parse_file(path).map_err(CliError::Config)?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    fn load_lenient(path: &Path) -> Option<Self> {
        match parse_file(path) {
            Ok(config) => {
                debug!("Loaded config from {}", path.display());
                Some(config)
            },
            Err(e) => {
                warn!("Ignoring {e}");
                None
            },
        }
    }

    fn ports_sources() -> Vec<PathBuf> {
        let mut sources = vec![PathBuf::from(LOCAL_PORTS_CONFIG)];
        if let Some(dir) = Self::global_config_dir() {
            sources.push(dir.join(GLOBAL_PORTS_CONFIG));
        }
        sources
    }

    /// Per-user configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "jagflash").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Per-user configuration file.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join(GLOBAL_CONFIG))
    }

    /// Overlay every value `other` sets. Known USB devices accumulate.
    fn merge(&mut self, other: Self) {
        let Self {
            port,
            provision,
            detect,
        } = other;

        overlay(&mut self.port.connection.serial, port.connection.serial);
        overlay(&mut self.port.connection.baud, port.connection.baud);
        self.port
            .usb_device
            .extend(port.usb_device);

        overlay(&mut self.provision.name, provision.name);
        overlay(&mut self.provision.ssid, provision.ssid);

        overlay(&mut self.detect.timeout_ms, detect.timeout_ms);
        overlay(&mut self.detect.restart, detect.restart);
    }

    /// Where a remembered device is written: next to a local config when
    /// there is one, otherwise in the per-user directory.
    fn ports_save_path() -> std::io::Result<PathBuf> {
        let has_local = Path::new(LOCAL_PORTS_CONFIG).exists() || Path::new(LOCAL_CONFIG).exists();
        match Self::global_config_dir() {
            Some(dir) if !has_local => {
                fs::create_dir_all(&dir)?;
                Ok(dir.join(GLOBAL_PORTS_CONFIG))
            },
            _ => Ok(PathBuf::from(LOCAL_PORTS_CONFIG)),
        }
    }

    /// Persist a USB bridge so later runs auto-select it.
    pub fn remember_usb_device(&mut self, vid: u16, pid: u16) -> anyhow::Result<()> {
        if self
            .port
            .usb_device
            .iter()
            .any(|device| device.matches(vid, pid))
        {
            return Ok(());
        }

        let path = Self::ports_save_path()?;
        self.port
            .usb_device
            .push(UsbDevice { vid, pid });
        fs::write(&path, toml::to_string_pretty(&self.port)?)?;
        info!("Remembered {vid:04X}:{pid:04X} in {}", path.display());

        Ok(())
    }
}
