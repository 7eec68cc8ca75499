//! Flash command: provision a release archive and write it to the device.

use {
    anyhow::{Context, Result, bail},
    console::style,
    indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle},
    jagflash::{
        Connection, FlashOptions, FlashProgress, LoaderOptions, NativePort, check_hardware,
        flash, restart,
    },
    log::warn,
    std::path::Path,
};

use crate::commands::image::{load_archive, plan, print_ids, provisioning_config};
use crate::commands::{ctrl_c, open_port};
use crate::config::Config;
use crate::loader::EspLoader;
use crate::{Cli, CliError, ProvisionArgs, get_baud, use_fancy_output};

/// Flash command settings beyond provisioning.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct FlashFlags {
    /// Erase the whole flash first.
    pub erase: bool,
    /// Baud rate for data transfer once the stub runs.
    pub flash_baud: Option<u32>,
    /// Skip the ESP32 check before writing.
    pub skip_check: bool,
}

/// Progress bar position, `None` once the run failed.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn bar_position(progress: &FlashProgress) -> Option<u64> {
    progress
        .percentage()
        .map(|pct| pct.round() as u64)
}

fn bar_message(progress: &FlashProgress) -> String {
    match &progress.details {
        Some(details) => format!("Writing {}", details.partition),
        None => progress
            .state
            .to_string(),
    }
}

fn flash_bar() -> ProgressBar {
    let pb = ProgressBar::new(100);
    if let Ok(bar_style) = ProgressStyle::with_template(
        "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}",
    ) {
        pb.set_style(bar_style.progress_chars("#>-"));
    }
    pb.set_draw_target(ProgressDrawTarget::stderr());
    pb
}

/// Reboot into the new firmware; failures only warn.
async fn restart_device(port: &NativePort, baud: u32) {
    if let Err(e) = port
        .open(baud)
        .await
    {
        warn!("Cannot reopen {} to restart it: {e}", port.name());
        return;
    }
    if let Err(e) = restart(port).await {
        warn!("Failed to restart {}: {e}", port.name());
    }
    if let Err(e) = port
        .close()
        .await
    {
        warn!("Failed to close {}: {e}", port.name());
    }
}

/// Flash command implementation.
pub(crate) async fn cmd_flash(
    cli: &Cli,
    config: &mut Config,
    archive: &Path,
    args: &ProvisionArgs,
    flags: FlashFlags,
) -> Result<()> {
    let settings = provisioning_config(cli, config, args)?;
    let images = load_archive(archive)?;
    let (partitions, ids) = plan(images, &settings, args)
        .with_context(|| format!("Cannot provision {}", archive.display()))?;

    if !cli.quiet {
        eprintln!(
            "{} Provisioning {} for {}",
            style("📦").cyan(),
            style(&settings.name).bold(),
            settings.ssid
        );
        for partition in &partitions {
            eprintln!(
                "    {} {} @ 0x{:08X} ({} bytes)",
                style("•").dim(),
                partition.name,
                partition.offset,
                partition
                    .data
                    .len()
            );
        }
    }

    let port = open_port(cli, config).await?;
    let baud = get_baud(cli, config);
    let debug = cli.verbose >= 2;

    if !flags.skip_check {
        let mut loader = EspLoader::new(port.clone(), baud).with_debug(debug);
        if !check_hardware(&mut loader).await {
            bail!(
                "No ESP32 answered on {}; pass --skip-check to flash anyway",
                port.name()
            );
        }
    }

    let fancy = !cli.quiet && use_fancy_output();
    let plain = !cli.quiet && !fancy;
    let pb = if fancy {
        flash_bar()
    } else {
        ProgressBar::hidden()
    };
    let bar = pb.clone();
    let mut last_message = String::new();
    let mut options = FlashOptions::default()
        .with_erase(flags.erase)
        .with_progress(move |progress| {
            if let Some(position) = bar_position(progress) {
                bar.set_position(position);
            }
            let message = bar_message(progress);
            if message != last_message {
                if plain {
                    eprintln!("  {message}");
                }
                bar.set_message(message.clone());
                last_message = message;
            }
        });
    options.baud_rate = baud;
    options.debug = debug;
    if let Some(flash_baud) = flags.flash_baud {
        options.high_speed_baud = flash_baud;
    }

    let make_loader = |port: NativePort, loader: &LoaderOptions| {
        EspLoader::new(port, baud).with_debug(loader.debug)
    };
    let result = tokio::select! {
        result = flash(&port, make_loader, &partitions, options) => Some(result),
        () = ctrl_c() => None,
    };

    match result {
        None => {
            pb.abandon();
            return Err(CliError::Cancelled("flashing cancelled".to_string()).into());
        },
        Some(Err(e)) => {
            pb.abandon_with_message("Failed");
            return Err(e).with_context(|| format!("Failed to flash {}", port.name()));
        },
        Some(Ok(())) => pb.finish_with_message("Done"),
    }

    restart_device(&port, baud).await;

    if !cli.quiet {
        eprintln!(
            "\n{} Flashed {} on {}",
            style("🎉").green().bold(),
            style(&settings.name).bold(),
            port.name()
        );
        print_ids(&ids);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use jagflash::FlashState;

    #[test]
    fn test_bar_follows_flash_phases() {
        let steps = [
            FlashProgress::state(FlashState::Connecting),
            FlashProgress::state(FlashState::Connected),
            FlashProgress::writing("bootloader", 0, 4),
            FlashProgress::writing("bootloader", 2, 4),
            FlashProgress::writing("jaguar", 4, 4),
            FlashProgress::state(FlashState::Success),
        ];
        let positions: Vec<Option<u64>> = steps
            .iter()
            .map(bar_position)
            .collect();
        assert_eq!(
            positions,
            vec![Some(0), Some(10), Some(35), Some(68), Some(100), Some(100)]
        );
        assert_eq!(bar_position(&FlashProgress::state(FlashState::Failed)), None);
    }

    #[test]
    fn test_bar_message_names_partition() {
        assert_eq!(bar_message(&FlashProgress::writing("jaguar", 1, 9)), "Writing jaguar");
        assert_eq!(
            bar_message(&FlashProgress::state(FlashState::Erasing)),
            "Erasing flash"
        );
        assert_eq!(bar_message(&FlashProgress::state(FlashState::Success)), "Done");
    }
}
