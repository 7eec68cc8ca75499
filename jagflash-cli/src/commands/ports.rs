//! Port listing and hotplug watch command implementations.

use {
    anyhow::Result,
    console::style,
    jagflash::device::{
        ConnectionEvent, DetectedPort, PortWatcher, auto_detect_port, detect_ports,
    },
    std::time::Duration,
    tokio::sync::broadcast::error::RecvError,
};

use crate::{Cli, commands::ctrl_c};

fn port_json(port: &DetectedPort) -> serde_json::Value {
    serde_json::json!({
        "name": port.name,
        "device": port.device.name(),
        "known": port.device.is_known(),
        "vid": port.vid,
        "pid": port.pid,
        "manufacturer": port.manufacturer,
        "product": port.product,
        "serial": port.serial,
    })
}

fn describe(port: &DetectedPort) -> String {
    let device_type = if port
        .device
        .is_known()
    {
        format!(
            " [{}]",
            style(
                port.device
                    .name()
            )
            .yellow()
        )
    } else {
        String::new()
    };

    let vid_pid = if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
        format!(" ({vid:04X}:{pid:04X})")
    } else {
        String::new()
    };

    let product = port
        .product
        .as_deref()
        .filter(|p| !p.is_empty())
        .map(|p| format!(" - {}", style(p).dim()))
        .unwrap_or_default();

    format!(
        "{}{device_type}{vid_pid}{product}",
        style(&port.name).cyan()
    )
}

/// List ports command implementation.
pub(crate) fn cmd_list_ports(json: bool) -> Result<()> {
    let detected = detect_ports();

    if json {
        let ports: Vec<serde_json::Value> = detected
            .iter()
            .map(port_json)
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&ports)?
        );
        return Ok(());
    }

    eprintln!(
        "{}",
        style("Available serial ports")
            .bold()
            .underlined()
    );

    if detected.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
        return Ok(());
    }

    for port in &detected {
        eprintln!("  {} {}", style("•").green(), describe(port));
    }

    // Show auto-detection result
    if let Ok(auto_port) = auto_detect_port() {
        eprintln!(
            "\n{} Auto-detected: {}",
            style("→")
                .green()
                .bold(),
            style(&auto_port.name)
                .cyan()
                .bold()
        );
    }

    Ok(())
}

/// Watch command implementation: print port events until Ctrl-C.
pub(crate) async fn cmd_watch(cli: &Cli, interval_ms: u64) -> Result<()> {
    let watcher = PortWatcher::spawn(Duration::from_millis(interval_ms.max(1)));
    let mut events = watcher.subscribe();

    if !cli.quiet {
        eprintln!(
            "{} Watching for serial ports (Ctrl+C to stop)",
            style("👀").cyan()
        );
    }

    loop {
        tokio::select! {
            () = ctrl_c() => return Ok(()),
            event = events.recv() => match event {
                Ok(ConnectionEvent::Connected(port)) => {
                    eprintln!("  {} {}", style("+").green().bold(), describe(&port));
                },
                Ok(ConnectionEvent::Disconnected(name)) => {
                    eprintln!("  {} {}", style("-").red().bold(), style(name).dim());
                },
                Err(RecvError::Lagged(skipped)) => {
                    log::debug!("Missed {skipped} port events");
                },
                Err(RecvError::Closed) => return Ok(()),
            },
        }
    }
}
