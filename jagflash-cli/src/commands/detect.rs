//! Hardware identity detection command.

use {
    anyhow::{Context, Result},
    console::style,
    indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle},
    jagflash::{
        Connection, DetectOptions, HardwareIdentity, detect_hardware_identity,
        device::DeviceKind,
    },
    std::time::Duration,
};

use crate::commands::{close_port, ctrl_c, open_port};
use crate::config::Config;
use crate::{Cli, CliError, use_fancy_output};

/// Detection options from CLI flags, then config, then library defaults.
fn detect_options(config: &Config, timeout_ms: Option<u64>, no_restart: bool) -> DetectOptions {
    let defaults = DetectOptions::default();
    let timeout = timeout_ms
        .or(config
            .detect
            .timeout_ms)
        .map_or(defaults.timeout, Duration::from_millis);
    let restart = !no_restart
        && config
            .detect
            .restart
            .unwrap_or(defaults.restart);
    DetectOptions { timeout, restart }
}

fn identity_json(port: &str, identity: &HardwareIdentity) -> serde_json::Value {
    serde_json::json!({
        "port": port,
        "model": identity.model,
        "name": identity.name,
        "hardware_id": identity.hardware_id,
    })
}

/// Print guidance for boards that never announced themselves.
fn print_not_found_hint(port_name: &str) {
    eprintln!(
        "{} No identity line seen on {port_name}.",
        style("⚠").yellow()
    );
    eprintln!("  Make sure the board runs Jaguar firmware and nothing else holds the port.");

    let urls: Vec<(&str, &str)> = [DeviceKind::Cp210x, DeviceKind::Ch340, DeviceKind::Ftdi]
        .iter()
        .filter_map(|kind| {
            kind.driver_url()
                .map(|url| (kind.name(), url))
        })
        .collect();
    eprintln!("  If the port does not show up at all, install the USB bridge driver:");
    for (name, url) in urls {
        eprintln!("    {} {name}: {}", style("•").dim(), style(url).cyan());
    }
}

fn waiting_spinner(message: String) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(spinner_style) =
        ProgressStyle::with_template("{spinner:.green} [{elapsed_precise}] {msg}")
    {
        pb.set_style(spinner_style);
    }
    pb.set_draw_target(ProgressDrawTarget::stderr());
    pb.set_message(message);
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

/// Detect command implementation.
pub(crate) async fn cmd_detect(
    cli: &Cli,
    config: &mut Config,
    timeout_ms: Option<u64>,
    no_restart: bool,
    json: bool,
) -> Result<()> {
    let options = detect_options(config, timeout_ms, no_restart);
    let port = open_port(cli, config).await?;
    let port_name = port
        .name()
        .to_string();

    let message = format!(
        "Waiting up to {}ms for {port_name} to identify itself",
        options
            .timeout
            .as_millis()
    );
    let spinner = if cli.quiet || json {
        ProgressBar::hidden()
    } else if use_fancy_output() {
        waiting_spinner(message)
    } else {
        eprintln!("{} {message}", style("⏳").yellow());
        ProgressBar::hidden()
    };

    let result = tokio::select! {
        result = detect_hardware_identity(&port, options) => Some(result),
        () = ctrl_c() => None,
    };
    spinner.finish_and_clear();
    close_port(&port).await;

    let identity = match result {
        None => return Err(CliError::Cancelled("detection cancelled".to_string()).into()),
        Some(Err(jagflash::Error::HardwareIdentityNotFound)) => {
            if !json {
                print_not_found_hint(&port_name);
            }
            return Err(jagflash::Error::HardwareIdentityNotFound.into());
        },
        Some(result) => result.with_context(|| format!("Detection on {port_name} failed"))?,
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&identity_json(&port_name, &identity))?
        );
    } else {
        eprintln!("{} Found {identity}", style("✓").green());
        eprintln!("  Model:       {}", identity.model);
        eprintln!("  Name:        {}", identity.name);
        eprintln!("  Hardware ID: {}", style(&identity.hardware_id).cyan());
    }

    Ok(())
}
