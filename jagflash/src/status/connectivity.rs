//! Wi-Fi and console connectivity derived from device log lines.

use std::fmt;
use std::sync::Arc;

use log::{debug, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::port::{Connection, restart};
use crate::transport::{LineReader, ReadResult, StopHandle};

const WIFI_CONNECT_FAILED: &str = "[toit.wifi] WARN: connect failed";
const WIFI_GOT_IP: &str = "[toit.wifi] INFO: got ip";
const NETWORK_TAG: &str = "[toit.network]";
const NETWORK_UNREACHABLE: &str = "failed to connect to any network";
const CONSOLE_ESTABLISHED: &str = "[toit.console_conn] INFO: established";

/// Wi-Fi association state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum WifiStatus {
    /// Nothing reported yet.
    #[default]
    Unknown,
    /// The device obtained an address.
    Connected,
    /// The configured SSID was not found.
    AccessPointNotFound,
    /// The access point rejected the credentials.
    BadAuthentication,
    /// Association timed out.
    Timeout,
}

impl WifiStatus {
    /// Wire name of the status.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Connected => "connected",
            Self::AccessPointNotFound => "access point not found",
            Self::BadAuthentication => "bad authentication",
            Self::Timeout => "timeout",
        }
    }

    fn from_reason(reason: &str) -> Option<Self> {
        match reason {
            "bad authentication" => Some(Self::BadAuthentication),
            "access point not found" => Some(Self::AccessPointNotFound),
            "timeout" => Some(Self::Timeout),
            _ => None,
        }
    }
}

impl fmt::Display for WifiStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Console (cloud connection) state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConsoleStatus {
    /// Nothing reported yet.
    #[default]
    Unknown,
    /// The console connection is established.
    Connected,
    /// The device could not reach any network.
    NotConnected,
}

impl ConsoleStatus {
    /// Wire name of the status.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Connected => "connected",
            Self::NotConnected => "not_connected",
        }
    }
}

impl fmt::Display for ConsoleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of the device's connectivity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ConnectivityState {
    /// Wi-Fi state.
    pub wifi: WifiStatus,
    /// Console state.
    pub console: ConsoleStatus,
    /// Last reported device address.
    pub device_ip: Option<String>,
}

impl ConnectivityState {
    /// Apply one log line. Returns `true` if the line was recognized and
    /// carried a usable value.
    ///
    /// A `got ip` line marks Wi-Fi connected even when no address can be
    /// extracted, but only counts as recognized when it can.
    pub fn apply(&mut self, line: &str) -> bool {
        if line.contains(WIFI_CONNECT_FAILED) {
            match find_token(line, "reason").and_then(WifiStatus::from_reason) {
                Some(status) => {
                    self.wifi = status;
                    return true;
                },
                None => debug!("Unhandled wifi status: {line}"),
            }
        } else if line.contains(WIFI_GOT_IP) {
            self.wifi = WifiStatus::Connected;
            if let Some(ip) = find_token(line, "ip").filter(|ip| is_dotted_quad(ip)) {
                self.device_ip = Some(ip.to_string());
                return true;
            }
        } else if line.contains(NETWORK_TAG) {
            if line.contains(NETWORK_UNREACHABLE) {
                self.console = ConsoleStatus::NotConnected;
                return true;
            }
        } else if line.contains(CONSOLE_ESTABLISHED) {
            self.console = ConsoleStatus::Connected;
            return true;
        }
        false
    }
}

/// Find the value of the first non-empty `{key: value}` token.
///
/// The key match ignores ASCII case.
fn find_token<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let needle = format!("{{{}: ", key.to_ascii_lowercase());
    let lowered = line.to_ascii_lowercase();
    let mut from = 0;

    while let Some(pos) = lowered[from..].find(&needle) {
        let start = from + pos + needle.len();
        match line[start..].find('}') {
            Some(len) if len > 0 => return Some(&line[start..start + len]),
            _ => {},
        }
        from = start;
    }
    None
}

fn is_dotted_quad(text: &str) -> bool {
    let octets: Vec<&str> = text
        .split('.')
        .collect();
    octets.len() == 4
        && octets
            .iter()
            .all(|o| (1..=3).contains(&o.len()) && o.bytes().all(|b| b.is_ascii_digit()))
}

struct Monitor {
    stop: StopHandle,
    task: JoinHandle<()>,
}

/// Tracks connectivity by consuming a device's log lines in the background.
///
/// State changes are published on a watch channel; see
/// [`ConnectivityDetector::subscribe`].
pub struct ConnectivityDetector {
    state: Arc<watch::Sender<ConnectivityState>>,
    monitor: Option<Monitor>,
}

impl Default for ConnectivityDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectivityDetector {
    /// Create an idle detector.
    pub fn new() -> Self {
        Self {
            state: Arc::new(watch::Sender::new(ConnectivityState::default())),
            monitor: None,
        }
    }

    /// Restart the device and start consuming its log lines.
    ///
    /// Fails with [`Error::AlreadyRunning`] if already started.
    pub async fn start<C: Connection>(&mut self, connection: C) -> Result<()> {
        if self
            .monitor
            .is_some()
        {
            return Err(Error::AlreadyRunning);
        }

        restart(&connection).await?;
        let mut reader = LineReader::new(connection)?;
        let stop = reader.stop_handle();
        let state = Arc::clone(&self.state);

        let task = tokio::spawn(async move {
            loop {
                match reader
                    .read()
                    .await
                {
                    Ok(ReadResult::Line(line)) => {
                        update(&state, &line);
                    },
                    Ok(ReadResult::Closed) => break,
                    Err(e) => {
                        warn!("Connectivity monitor stopped: {e}");
                        break;
                    },
                }
            }
            reader
                .stop()
                .await;
        });

        self.monitor = Some(Monitor { stop, task });
        Ok(())
    }

    /// Stop consuming lines. The detector can be started again afterwards.
    pub async fn stop(&mut self) {
        if let Some(monitor) = self
            .monitor
            .take()
        {
            monitor
                .stop
                .stop()
                .await;
            if let Err(e) = monitor
                .task
                .await
            {
                warn!("Connectivity monitor task failed: {e}");
            }
        }
    }

    /// Whether the background consumer is active.
    pub fn is_running(&self) -> bool {
        self.monitor
            .as_ref()
            .is_some_and(|m| {
                !m.task
                    .is_finished()
            })
    }

    /// Apply a line directly. Returns `true` if it was recognized.
    pub fn parse(&self, line: &str) -> bool {
        update(&self.state, line)
    }

    /// Current Wi-Fi state.
    pub fn wifi_status(&self) -> WifiStatus {
        self.state
            .borrow()
            .wifi
    }

    /// Current console state.
    pub fn console_status(&self) -> ConsoleStatus {
        self.state
            .borrow()
            .console
    }

    /// Last reported device address.
    pub fn device_ip(&self) -> Option<String> {
        self.state
            .borrow()
            .device_ip
            .clone()
    }

    /// Copy of the whole state.
    pub fn snapshot(&self) -> ConnectivityState {
        self.state
            .borrow()
            .clone()
    }

    /// Receive state changes.
    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.state
            .subscribe()
    }
}

fn update(state: &watch::Sender<ConnectivityState>, line: &str) -> bool {
    let mut recognized = false;
    state.send_if_modified(|current| {
        let before = current.clone();
        recognized = current.apply(line);
        *current != before
    });
    recognized
}
