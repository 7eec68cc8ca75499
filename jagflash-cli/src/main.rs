//! jagflash CLI - Command-line tool for provisioning Jaguar devices.
//!
//! ## Features
//!
//! - Serial port discovery and hotplug watching
//! - Hardware identity detection
//! - Line monitor with Wi-Fi/console status tracking
//! - Firmware archive extraction and config injection
//! - Flashing provisioned firmware through espflash
//! - Interactive serial port selection
//! - Environment variable support

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use console::style;
use env_logger::Env;
use jagflash::port::ROM_BAUD;
use log::debug;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use uuid::Uuid;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(true);

/// Check if emoji/animations should be used (TTY and colors enabled).
fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(std::sync::atomic::Ordering::Relaxed) && console::colors_enabled_stderr()
}

mod commands;
mod config;
mod loader;
mod serial;

use config::Config;
use serial::{SerialOptions, ask_remember_port, select_serial_port};

/// Errors with a dedicated exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Invalid invocation or setup (exit 2).
    #[error("{0}")]
    Usage(String),
    /// Unusable configuration (exit 3).
    #[error("{0}")]
    Config(String),
    /// Device or port not found (exit 4).
    #[error("{0}")]
    NotFound(String),
    /// Interrupted by the user (exit 130).
    #[error("{0}")]
    Cancelled(String),
}

impl CliError {
    fn exit_code(&self) -> u8 {
        match self {
            Self::Usage(_) => 2,
            Self::Config(_) => 3,
            Self::NotFound(_) => 4,
            Self::Cancelled(_) => 130,
        }
    }
}

/// Map an error chain to a process exit code.
fn exit_code_for(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
        if let Some(cli_err) = cause.downcast_ref::<CliError>() {
            return cli_err.exit_code();
        }
        if let Some(lib_err) = cause.downcast_ref::<jagflash::Error>() {
            if lib_err.is_device_missing() {
                return 4;
            }
            if matches!(lib_err, jagflash::Error::Config(_)) {
                return 3;
            }
        }
    }
    1
}

/// jagflash - Provision Jaguar devices over a serial connection.
///
/// Environment variables:
///   JAGFLASH_PORT              - Default serial port
///   JAGFLASH_BAUD              - Default baud rate (default: 115200)
///   JAGFLASH_WIFI_PASSWORD     - Wi-Fi password for patch/extract
///   JAGFLASH_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "jagflash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[command(after_help = "Examples:
  jagflash list-ports
  jagflash -p /dev/ttyUSB0 detect
  jagflash monitor --status
  jagflash extract jaguar.tar.gz -o out --name kitchen --ssid home
  jagflash -p /dev/ttyUSB0 flash jaguar.tar.gz --name kitchen --ssid home")]
#[allow(clippy::struct_excessive_bools)]
struct Cli {
    /// Serial port to use (auto-detected if not specified).
    #[arg(short, long, global = true, env = "JAGFLASH_PORT")]
    port: Option<String>,

    /// Baud rate for the serial connection.
    #[arg(short, long, global = true, env = "JAGFLASH_BAUD")]
    baud: Option<u32>,

    /// Verbose output level (-v, -vv, -vvv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "JAGFLASH_NON_INTERACTIVE")]
    non_interactive: bool,

    /// Confirm port selection even for auto-detected ports.
    #[arg(long, global = true)]
    confirm_port: bool,

    /// List all available ports (including unknown types).
    #[arg(long, global = true)]
    list_all_ports: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Device settings baked into the application image.
#[derive(Args, Debug, Clone, Default)]
struct ProvisionArgs {
    /// Device name.
    #[arg(long)]
    name: Option<String>,

    /// Wi-Fi network name.
    #[arg(long)]
    ssid: Option<String>,

    /// Wi-Fi password (prompted for when omitted in interactive mode).
    #[arg(long, env = "JAGFLASH_WIFI_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Device id stored in the config document (random if omitted).
    #[arg(long)]
    device_id: Option<Uuid>,

    /// Unique id stored after the config document (random if omitted).
    #[arg(long)]
    unique_id: Option<Uuid>,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// List available serial ports.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Print serial port arrivals and removals until interrupted.
    Watch {
        /// Enumeration interval in milliseconds.
        #[arg(long, default_value = "500")]
        interval_ms: u64,
    },

    /// Restart the device and read its hardware identity.
    Detect {
        /// How long to wait for the identity line, in milliseconds.
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Do not pulse the reset lines before listening.
        #[arg(long)]
        no_restart: bool,

        /// Output the identity as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Print device output line by line.
    Monitor {
        /// Prefix every line with the time of day.
        #[arg(long)]
        timestamp: bool,

        /// Report Wi-Fi and console status changes.
        #[arg(long)]
        status: bool,

        /// Restart the device before monitoring.
        #[arg(long)]
        reset: bool,

        /// Append received lines to this file.
        #[arg(long, value_name = "PATH")]
        log_file: Option<PathBuf>,
    },

    /// Inject device configuration into an application image.
    Patch {
        /// Application image to patch.
        image: PathBuf,

        /// Where to write the patched image.
        #[arg(short, long)]
        output: PathBuf,

        #[command(flatten)]
        provision: ProvisionArgs,
    },

    /// Extract the partition images from a firmware archive.
    Extract {
        /// Firmware archive (.tar.gz).
        archive: PathBuf,

        /// Output directory.
        #[arg(short, long, default_value = ".")]
        output: PathBuf,

        #[command(flatten)]
        provision: ProvisionArgs,
    },

    /// Provision a firmware archive and write it to the device.
    Flash {
        /// Firmware archive (.tar.gz).
        archive: PathBuf,

        /// Erase the whole flash before writing.
        #[arg(long)]
        erase: bool,

        /// Baud rate for the data transfer once the flasher stub runs.
        #[arg(long, value_name = "BAUD")]
        flash_baud: Option<u32>,

        /// Write even if the chip does not identify as an ESP32.
        #[arg(long)]
        skip_check: bool,

        #[command(flatten)]
        provision: ProvisionArgs,
    },

    /// Show the config region and integrity trailer of an application image.
    Info {
        /// Application image.
        image: PathBuf,

        /// Output information as JSON to stdout.
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // --- NO_COLOR and TTY detection ---
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, std::sync::atomic::Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    // Setup logging based on verbosity
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!(
        "jagflash v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    match run(&cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {err:#}", style("Error:").red().bold());
            ExitCode::from(exit_code_for(&err))
        },
    }
}

async fn run(cli: &Cli) -> Result<()> {
    // Load configuration
    let mut config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)?
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::ListPorts { json } => commands::ports::cmd_list_ports(*json),
        Commands::Watch { interval_ms } => commands::ports::cmd_watch(cli, *interval_ms).await,
        Commands::Detect {
            timeout_ms,
            no_restart,
            json,
        } => {
            commands::detect::cmd_detect(cli, &mut config, *timeout_ms, *no_restart, *json).await
        },
        Commands::Monitor {
            timestamp,
            status,
            reset,
            log_file,
        } => {
            let options = commands::monitor::MonitorOptions {
                timestamp: *timestamp,
                status: *status,
                reset: *reset,
                log_file: log_file.clone(),
            };
            commands::monitor::cmd_monitor(cli, &mut config, &options).await
        },
        Commands::Patch {
            image,
            output,
            provision,
        } => commands::image::cmd_patch(cli, &config, image, output, provision),
        Commands::Extract {
            archive,
            output,
            provision,
        } => commands::image::cmd_extract(cli, &config, archive, output, provision),
        Commands::Flash {
            archive,
            erase,
            flash_baud,
            skip_check,
            provision,
        } => {
            let flags = commands::flash::FlashFlags {
                erase: *erase,
                flash_baud: *flash_baud,
                skip_check: *skip_check,
            };
            commands::flash::cmd_flash(cli, &mut config, archive, provision, flags).await
        },
        Commands::Info { image, json } => commands::image::cmd_info(image, *json),
    }
}

/// Get serial port from CLI args or interactive selection.
fn get_port(cli: &Cli, config: &mut Config) -> Result<String> {
    let options = SerialOptions {
        port: cli.port.clone(),
        list_all_ports: cli.list_all_ports,
        non_interactive: cli.non_interactive,
        confirm_port: cli.confirm_port,
    };

    let selected = select_serial_port(&options, config)?;

    // Ask to remember if not a known device and interactive mode
    if !selected.is_known && !cli.non_interactive {
        ask_remember_port(&selected.port, config)?;
    }

    Ok(selected.port.name)
}

/// Baud rate from CLI args, then config, then the ROM default.
fn get_baud(cli: &Cli, config: &Config) -> u32 {
    cli.baud
        .or(config
            .port
            .connection
            .baud)
        .unwrap_or(ROM_BAUD)
}

#[cfg(test)]
mod cli_tests {
    use super::*;
    use clap::CommandFactory;

    // ---- clap validation ----

    #[test]
    fn test_cli_command_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_parse_detect() {
        let cli = Cli::try_parse_from([
            "jagflash",
            "--port",
            "/dev/ttyUSB0",
            "detect",
            "--timeout-ms",
            "2500",
            "--no-restart",
        ])
        .unwrap();
        assert_eq!(cli.port.as_deref(), Some("/dev/ttyUSB0"));
        if let Commands::Detect {
            timeout_ms,
            no_restart,
            json,
        } = cli.command
        {
            assert_eq!(timeout_ms, Some(2500));
            assert!(no_restart);
            assert!(!json);
        } else {
            panic!("Expected Detect command");
        }
    }

    #[test]
    fn test_cli_parse_monitor() {
        let cli = Cli::try_parse_from([
            "jagflash",
            "monitor",
            "--timestamp",
            "--status",
            "--log-file",
            "device.log",
        ])
        .unwrap();
        if let Commands::Monitor {
            timestamp,
            status,
            reset,
            log_file,
        } = cli.command
        {
            assert!(timestamp);
            assert!(status);
            assert!(!reset);
            assert_eq!(log_file, Some(PathBuf::from("device.log")));
        } else {
            panic!("Expected Monitor command");
        }
    }

    #[test]
    fn test_cli_parse_patch() {
        let cli = Cli::try_parse_from([
            "jagflash",
            "patch",
            "toit.bin",
            "-o",
            "out.bin",
            "--name",
            "kitchen",
            "--ssid",
            "home",
            "--unique-id",
            "00000000-0000-0000-0000-000000000001",
        ])
        .unwrap();
        if let Commands::Patch {
            image,
            output,
            provision,
        } = cli.command
        {
            assert_eq!(image, PathBuf::from("toit.bin"));
            assert_eq!(output, PathBuf::from("out.bin"));
            assert_eq!(provision.name.as_deref(), Some("kitchen"));
            assert_eq!(provision.ssid.as_deref(), Some("home"));
            assert_eq!(provision.unique_id, Some(Uuid::from_u128(1)));
            assert!(provision.device_id.is_none());
        } else {
            panic!("Expected Patch command");
        }
    }

    #[test]
    fn test_cli_patch_requires_output() {
        assert!(Cli::try_parse_from(["jagflash", "patch", "toit.bin"]).is_err());
    }

    #[test]
    fn test_cli_rejects_bad_uuid() {
        let result = Cli::try_parse_from([
            "jagflash",
            "patch",
            "toit.bin",
            "-o",
            "out.bin",
            "--device-id",
            "not-a-uuid",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_parse_extract_defaults() {
        let cli = Cli::try_parse_from(["jagflash", "extract", "jaguar.tar.gz"]).unwrap();
        if let Commands::Extract {
            archive,
            output,
            provision,
        } = cli.command
        {
            assert_eq!(archive, PathBuf::from("jaguar.tar.gz"));
            assert_eq!(output, PathBuf::from("."));
            assert!(provision.ssid.is_none());
        } else {
            panic!("Expected Extract command");
        }
    }

    #[test]
    fn test_cli_parse_flash() {
        let cli = Cli::try_parse_from([
            "jagflash",
            "-p",
            "COM3",
            "flash",
            "jaguar.tar.gz",
            "--erase",
            "--flash-baud",
            "460800",
            "--name",
            "kitchen",
            "--ssid",
            "home",
        ])
        .unwrap();
        assert_eq!(cli.port.as_deref(), Some("COM3"));
        if let Commands::Flash {
            archive,
            erase,
            flash_baud,
            skip_check,
            provision,
        } = cli.command
        {
            assert_eq!(archive, PathBuf::from("jaguar.tar.gz"));
            assert!(erase);
            assert_eq!(flash_baud, Some(460_800));
            assert!(!skip_check);
            assert_eq!(provision.name.as_deref(), Some("kitchen"));
        } else {
            panic!("Expected Flash command");
        }
    }

    #[test]
    fn test_cli_flash_requires_archive() {
        assert!(Cli::try_parse_from(["jagflash", "flash", "--ssid", "home"]).is_err());
    }

    #[test]
    fn test_cli_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "jagflash",
            "list-ports",
            "--json",
            "-vv",
            "--non-interactive",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        assert!(cli.non_interactive);
        assert!(matches!(cli.command, Commands::ListPorts { json: true }));
    }

    // ---- exit codes ----

    #[test]
    fn test_exit_codes_for_cli_errors() {
        let usage = anyhow::Error::from(CliError::Usage("bad".into()));
        let cancelled = anyhow::Error::from(CliError::Cancelled("stop".into()));
        let missing = anyhow::Error::from(CliError::NotFound("gone".into()));
        assert_eq!(exit_code_for(&usage), 2);
        assert_eq!(exit_code_for(&cancelled), 130);
        assert_eq!(exit_code_for(&missing), 4);
    }

    #[test]
    fn test_exit_codes_for_library_errors() {
        let not_found =
            anyhow::Error::from(jagflash::Error::HardwareIdentityNotFound).context("detect");
        assert_eq!(exit_code_for(&not_found), 4);

        let config = anyhow::Error::from(jagflash::Error::Config("x".into()));
        assert_eq!(exit_code_for(&config), 3);

        let other = anyhow::Error::from(jagflash::Error::InvalidImage("x".into()));
        assert_eq!(exit_code_for(&other), 1);
        assert_eq!(exit_code_for(&anyhow::anyhow!("plain")), 1);
    }

    #[test]
    fn test_baud_priority() {
        let mut config = Config::default();
        let cli = Cli::try_parse_from(["jagflash", "list-ports"]).unwrap();
        assert_eq!(get_baud(&cli, &config), ROM_BAUD);

        config.port.connection.baud = Some(921_600);
        assert_eq!(get_baud(&cli, &config), 921_600);

        let cli = Cli::try_parse_from(["jagflash", "-b", "460800", "list-ports"]).unwrap();
        assert_eq!(get_baud(&cli, &config), 460_800);
    }
}
