//! Serial monitor command implementation.
//!
//! Device lines go to stdout, status and hints to stderr, so the stream
//! can be piped while the user still sees what is going on.

use anyhow::{Context, Result};
use console::style;
use jagflash::monitor::{clean_line, format_line, format_timestamp, now};
use jagflash::status::ConnectivityState;
use jagflash::{Connection, LineReader, NativePort, ReadResult, restart};
use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};

use crate::Cli;
use crate::commands::{close_port, ctrl_c, open_port};
use crate::config::Config;

/// Monitor command switches.
#[derive(Debug, Clone, Default)]
pub(crate) struct MonitorOptions {
    pub(crate) timestamp: bool,
    pub(crate) status: bool,
    pub(crate) reset: bool,
    pub(crate) log_file: Option<PathBuf>,
}

/// Tracks connectivity and reports only real changes.
#[derive(Debug, Default)]
struct StatusTracker {
    state: ConnectivityState,
}

impl StatusTracker {
    /// Feed a line, returning the new state if it changed.
    fn observe(&mut self, line: &str) -> Option<&ConnectivityState> {
        let before = self
            .state
            .clone();
        if self
            .state
            .apply(line)
            && self.state != before
        {
            Some(&self.state)
        } else {
            None
        }
    }
}

fn describe_state(state: &ConnectivityState) -> String {
    format!(
        "wifi: {}, console: {}, ip: {}",
        state.wifi,
        state.console,
        state
            .device_ip
            .as_deref()
            .unwrap_or("-")
    )
}

fn open_log(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file {}", path.display()))
}

/// Run the serial monitor until Ctrl-C or the port goes away.
pub(crate) async fn cmd_monitor(
    cli: &Cli,
    config: &mut Config,
    options: &MonitorOptions,
) -> Result<()> {
    let mut log_file = options
        .log_file
        .as_deref()
        .map(open_log)
        .transpose()?;

    let port = open_port(cli, config).await?;
    let result = monitor_port(cli, &port, options, log_file.as_mut()).await;
    close_port(&port).await;
    result
}

async fn monitor_port(
    cli: &Cli,
    port: &NativePort,
    options: &MonitorOptions,
    mut log_file: Option<&mut File>,
) -> Result<()> {
    if options.reset {
        restart(port)
            .await
            .context("Failed to restart the device")?;
    }

    if !cli.quiet {
        eprintln!(
            "{} Monitoring {} (Ctrl+C to exit)",
            style("📡").cyan(),
            style(port.name()).green()
        );
    }

    let mut reader = LineReader::new(port.clone()).context("Failed to read from the port")?;
    let stop = reader.stop_handle();
    let interrupt = tokio::spawn(async move {
        ctrl_c().await;
        stop.stop()
            .await;
    });

    let mut tracker = StatusTracker::default();
    let outcome = loop {
        let line = match reader
            .read()
            .await
        {
            Ok(ReadResult::Line(line)) => line,
            Ok(ReadResult::Closed) => break Ok(()),
            Err(e) => break Err(e).context("Serial read failed"),
        };

        let stamp = options
            .timestamp
            .then(now);
        println!("{}", format_line(&line, stamp));

        if let Some(file) = log_file.as_deref_mut() {
            if let Err(e) = writeln!(file, "[{}] {}", format_timestamp(now()), clean_line(&line)) {
                log::warn!("Failed to write log file: {e}");
            }
        }

        if options.status {
            if let Some(state) = tracker.observe(&line) {
                eprintln!("{} {}", style("ℹ").blue(), describe_state(state));
            }
        }
    };

    interrupt.abort();
    reader
        .stop()
        .await;
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use jagflash::status::{ConsoleStatus, WifiStatus};

    #[test]
    fn test_status_tracker_reports_changes_once() {
        let mut tracker = StatusTracker::default();
        assert!(tracker.observe("booting").is_none());

        let state = tracker
            .observe("[toit.wifi] INFO: got ip {ip: 192.168.1.7}")
            .cloned()
            .unwrap();
        assert_eq!(state.wifi, WifiStatus::Connected);
        assert_eq!(state.device_ip.as_deref(), Some("192.168.1.7"));

        assert!(
            tracker
                .observe("[toit.wifi] INFO: got ip {ip: 192.168.1.7}")
                .is_none()
        );
    }

    #[test]
    fn test_describe_state() {
        let state = ConnectivityState {
            wifi: WifiStatus::Connected,
            console: ConsoleStatus::Unknown,
            device_ip: None,
        };
        assert_eq!(describe_state(&state), "wifi: connected, console: unknown, ip: -");
    }
}
