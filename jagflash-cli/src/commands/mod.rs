//! Command implementations.
//!
//! Each subcommand is implemented in its own module for clean separation.

pub(crate) mod detect;
pub(crate) mod flash;
pub(crate) mod image;
pub(crate) mod monitor;
pub(crate) mod ports;

use anyhow::{Context, Result};
use jagflash::{Connection, NativePort, SerialConfig};

use crate::config::Config;
use crate::{Cli, CliError, get_baud, get_port};

/// Resolve, create and open the device's serial port.
pub(crate) async fn open_port(cli: &Cli, config: &mut Config) -> Result<NativePort> {
    let name = get_port(cli, config)?;
    let baud = get_baud(cli, config);
    let port = NativePort::new(&SerialConfig::new(name.as_str(), baud));
    match port
        .open(baud)
        .await
    {
        Ok(()) => Ok(port),
        Err(e) if e.is_device_missing() => {
            Err(CliError::NotFound(format!("serial port {name} not found: {e}")).into())
        },
        Err(e) => Err(e).with_context(|| format!("Failed to open {name} at {baud} baud")),
    }
}

/// Close `port`, logging instead of failing.
pub(crate) async fn close_port(port: &NativePort) {
    if let Err(e) = port
        .close()
        .await
    {
        log::warn!("Failed to close {}: {e}", port.name());
    }
}

/// Resolve when the user presses Ctrl-C.
pub(crate) async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::warn!("Cannot listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
}
