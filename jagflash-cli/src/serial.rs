//! Serial port selection.
//!
//! An explicit `--port` or configured port wins. Otherwise known USB
//! bridges are preferred, a single candidate is taken as is and several
//! lead to a prompt, or to a usage error under `--non-interactive`.

use {
    crate::{CliError, config::Config},
    anyhow::Result,
    console::style,
    dialoguer::{Confirm, Error as DialoguerError, Select, theme::ColorfulTheme},
    jagflash::device::{DetectedPort, detect_ports},
    log::{debug, error, info},
    std::io::IsTerminal,
};

const NO_PORTS_FOUND: &str = "no serial ports found; is the board plugged in?";
const MULTIPLE_PORTS: &str =
    "multiple serial ports found; pass --port to choose one in non-interactive mode";
const SELECTION_CANCELLED: &str = "port selection cancelled";

/// Options for serial port selection.
#[derive(Debug, Clone, Default)]
pub struct SerialOptions {
    /// Explicit port specified via CLI.
    pub port: Option<String>,
    /// List all ports (including unknown types).
    pub list_all_ports: bool,
    /// Non-interactive mode (fail if multiple ports).
    pub non_interactive: bool,
    /// Force confirmation even for single recognized port.
    pub confirm_port: bool,
}

/// Result of port selection including whether it was a known device.
pub struct SelectedPort {
    /// The selected port info.
    pub port: DetectedPort,
    /// Whether this port matched a known/configured device.
    pub is_known: bool,
}

fn usage_err(message: &str) -> anyhow::Error {
    // Selection failures are setup problems, exit code 2.
    CliError::Usage(message.to_string()).into()
}

fn select_non_interactive_port(
    selection_ports: Vec<DetectedPort>,
    config: &Config,
) -> Result<SelectedPort> {
    // Exactly one candidate is the only deterministic choice.
    if selection_ports.len() > 1 {
        return Err(usage_err(MULTIPLE_PORTS));
    }
    let Some(port) = selection_ports
        .into_iter()
        .next()
    else {
        return Err(usage_err(NO_PORTS_FOUND));
    };
    Ok(SelectedPort {
        is_known: is_known_device(&port, config),
        port,
    })
}

/// Select a serial port interactively or automatically.
pub fn select_serial_port(options: &SerialOptions, config: &Config) -> Result<SelectedPort> {
    // If port explicitly specified, use it
    if let Some(port_name) = &options.port {
        return Ok(find_port_by_name(port_name, detect_ports(), config));
    }

    // If port in config, use it
    if let Some(port_name) = &config
        .port
        .connection
        .serial
    {
        debug!("Using port from config: {port_name}");
        return Ok(find_port_by_name(port_name, detect_ports(), config));
    }

    let ports = detect_ports();
    if ports.is_empty() {
        return Err(usage_err(NO_PORTS_FOUND));
    }

    let selection_ports = candidate_ports(ports, config, options.list_all_ports);

    // Non-interactive mode must never prompt
    if options.non_interactive {
        return select_non_interactive_port(selection_ports, config);
    }

    if selection_ports.len() > 1 {
        ensure_interactive_terminal()?;
        return select_port_interactive(selection_ports, config);
    }

    let Some(port) = selection_ports
        .into_iter()
        .next()
    else {
        return Err(usage_err(NO_PORTS_FOUND));
    };
    let is_known = is_known_device(&port, config);

    if is_known && !options.confirm_port {
        info!(
            "Auto-selected port: {} [{}]",
            port.name,
            port.device
                .name()
        );
        Ok(SelectedPort { port, is_known })
    } else {
        ensure_interactive_terminal()?;
        confirm_single_port(port)
    }
}

/// Known devices (built-in + config) first, unless all ports were asked for
/// or none is known.
fn candidate_ports(ports: Vec<DetectedPort>, config: &Config, all: bool) -> Vec<DetectedPort> {
    if all {
        return ports;
    }
    let known: Vec<DetectedPort> = ports
        .iter()
        .filter(|p| is_known_device(p, config))
        .cloned()
        .collect();
    if known.is_empty() { ports } else { known }
}

fn ensure_interactive_terminal() -> Result<()> {
    if std::io::stdin().is_terminal() && std::io::stderr().is_terminal() {
        Ok(())
    } else {
        Err(usage_err(
            "interactive port selection requires a terminal; pass --port",
        ))
    }
}

fn map_prompt_error(err: DialoguerError) -> anyhow::Error {
    match err {
        DialoguerError::IO(io_err) => {
            if io_err.kind() == std::io::ErrorKind::Interrupted {
                CliError::Cancelled(SELECTION_CANCELLED.to_string()).into()
            } else {
                usage_err(&format!("prompt failed: {io_err}"))
            }
        },
    }
}

/// Resolve an explicitly named port, enumerated or not.
///
/// Names compare exactly first, then ignoring ASCII case for Windows `COMn`.
fn find_port_by_name(name: &str, ports: Vec<DetectedPort>, config: &Config) -> SelectedPort {
    let exact = ports
        .iter()
        .position(|p| p.name == name);
    let index = exact.or_else(|| {
        ports
            .iter()
            .position(|p| {
                p.name
                    .eq_ignore_ascii_case(name)
            })
    });

    let port = index
        .and_then(|i| {
            ports
                .into_iter()
                .nth(i)
        })
        .unwrap_or_else(|| DetectedPort::unclassified(name));
    SelectedPort {
        is_known: is_known_device(&port, config),
        port,
    }
}

/// Built-in bridge, or a VID/PID the user remembered.
fn is_known_device(port: &DetectedPort, config: &Config) -> bool {
    let remembered = || match (port.vid, port.pid) {
        (Some(vid), Some(pid)) => config
            .port
            .usb_device
            .iter()
            .any(|device| device.matches(vid, pid)),
        _ => false,
    };
    port.device
        .is_known()
        || remembered()
}

fn port_label(port: &DetectedPort, config: &Config) -> String {
    let name = if is_known_device(port, config) {
        style(&port.name).bold()
    } else {
        style(&port.name)
    };

    let bridge = match (port.device.is_known(), port.vid, port.pid) {
        (true, _, _) => format!(" [{}]", style(port.device.name()).yellow()),
        (false, Some(vid), Some(pid)) => format!(" ({vid:04X}:{pid:04X})"),
        _ => String::new(),
    };

    let product = port
        .product
        .as_deref()
        .map(|p| format!(" - {}", style(p).dim()))
        .unwrap_or_default();

    format!("{name}{bridge}{product}")
}

/// Interactive port selection.
fn select_port_interactive(mut ports: Vec<DetectedPort>, config: &Config) -> Result<SelectedPort> {
    eprintln!(
        "{} Detected {} serial ports",
        style("ℹ").blue(),
        ports.len()
    );
    eprintln!(
        "{}",
        style("Ports that match a known USB bridge are shown in bold").dim()
    );

    // Sort: known devices first
    ports.sort_by_key(|p| !is_known_device(p, config));

    // Truncate labels to fit terminal width to prevent wrapping in narrow
    // terminals.
    let term_width = console::Term::stderr()
        .size()
        .1 as usize;
    let max_item_width = term_width.saturating_sub(4);
    let port_names: Vec<String> = ports
        .iter()
        .map(|port| {
            console::truncate_str(&port_label(port, config), max_item_width, "\u{2026}")
                .into_owned()
        })
        .collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select the board's serial port")
        .items(&port_names)
        .default(0)
        .interact_opt()
        .map_err(map_prompt_error)?;

    match selection {
        Some(index) => {
            let port = ports
                .into_iter()
                .nth(index)
                .ok_or_else(|| anyhow::anyhow!("Invalid port index: {index}"))?;
            let is_known = is_known_device(&port, config);
            Ok(SelectedPort { port, is_known })
        },
        None => Err(CliError::Cancelled(SELECTION_CANCELLED.to_string()).into()),
    }
}

/// Confirm use of a single unrecognized port.
fn confirm_single_port(port: DetectedPort) -> Result<SelectedPort> {
    let product_info = port
        .product
        .as_ref()
        .map(|p| format!(" - {p}"))
        .unwrap_or_default();

    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Use serial port {}{product_info}?", port.name))
        .default(true)
        .interact_opt()
        .map_err(map_prompt_error)?
        .unwrap_or(false);

    if confirmed {
        Ok(SelectedPort {
            port,
            is_known: false,
        })
    } else {
        Err(CliError::Cancelled(SELECTION_CANCELLED.to_string()).into())
    }
}

/// Ask user if they want to remember this port.
pub fn ask_remember_port(port: &DetectedPort, config: &mut Config) -> Result<()> {
    let (Some(vid), Some(pid)) = (port.vid, port.pid) else {
        return Ok(());
    };
    if is_known_device(port, config) {
        return Ok(());
    }

    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt("Remember this USB device for automatic selection?")
        .default(false)
        .interact_opt()
        .map_err(map_prompt_error)?
        .unwrap_or(false);

    if confirmed {
        if let Err(e) = config.remember_usb_device(vid, pid) {
            error!("Failed to save port configuration: {e}");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        console::{measure_text_width, truncate_str},
        jagflash::device::DeviceKind,
        jagflash::port::PortInfo,
    };

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

    fn assert_usage_error(result: Result<SelectedPort>) {
        let Err(err) = result else {
            panic!("expected an error");
        };
        assert!(matches!(
            err.downcast_ref::<CliError>(),
            Some(CliError::Usage(_))
        ));
    }

    // ---- is_known_device ----

    #[test]
    fn test_is_known_device_builtin() {
        let port = usb("/dev/ttyUSB0", 0x10C4, 0xEA60);
        assert_eq!(port.device, DeviceKind::Cp210x);
        assert!(is_known_device(&port, &Config::default()));
    }

    #[test]
    fn test_is_known_device_from_config() {
        let port = usb("/dev/ttyUSB0", 0xABCD, 0x1234);
        let mut config = Config::default();
        assert!(!is_known_device(&port, &config));

        config
            .port
            .usb_device
            .push(crate::config::UsbDevice {
                vid: 0xABCD,
                pid: 0x1234,
            });
        assert!(is_known_device(&port, &config));
    }

    #[test]
    fn test_is_known_device_no_vid_pid() {
        let port = DetectedPort::unclassified("/dev/ttyS0");
        assert!(!is_known_device(&port, &Config::default()));
    }

    // ---- candidates ----

    #[test]
    fn test_candidate_ports_prefers_known() {
        let ports = vec![
            DetectedPort::unclassified("/dev/ttyS0"),
            usb("/dev/ttyUSB0", 0x1A86, 0x7523),
        ];
        let config = Config::default();

        let known = candidate_ports(ports.clone(), &config, false);
        assert_eq!(known.len(), 1);
        assert_eq!(known[0].name, "/dev/ttyUSB0");

        assert_eq!(candidate_ports(ports, &config, true).len(), 2);

        let unknown = vec![DetectedPort::unclassified("/dev/ttyS0")];
        assert_eq!(candidate_ports(unknown, &config, false).len(), 1);
    }

    // ---- find_port_by_name ----

    #[test]
    fn test_find_port_by_name_matches_case_insensitively() {
        let ports = vec![usb("COM3", 0x10C4, 0xEA60)];
        let selected = find_port_by_name("com3", ports, &Config::default());
        assert_eq!(selected.port.name, "COM3");
        assert!(selected.is_known);
    }

    #[test]
    fn test_find_port_by_name_honours_remembered_devices() {
        let mut config = Config::default();
        config
            .port
            .usb_device
            .push(crate::config::UsbDevice {
                vid: 0xABCD,
                pid: 0x1234,
            });
        let ports = vec![usb("/dev/ttyACM3", 0xABCD, 0x1234)];
        assert!(find_port_by_name("/dev/ttyACM3", ports, &config).is_known);
    }

    #[test]
    fn test_find_port_by_name_falls_back_to_placeholder() {
        let selected = find_port_by_name("/dev/ttyXYZ", Vec::new(), &Config::default());
        assert_eq!(selected.port, DetectedPort::unclassified("/dev/ttyXYZ"));
        assert!(!selected.is_known);
    }

    // ---- labels ----

    #[test]
    fn test_port_label_truncates_without_wrapping() {
        console::set_colors_enabled(false);
        let mut port = usb("/dev/verylongttyusb0", 0x1A86, 0x7523);
        port.product = Some("Very Long Product Name That Would Wrap".to_string());
        let label = port_label(&port, &Config::default());
        assert!(label.starts_with("/dev/verylongttyusb0 [CH340/CH9102]"));

        let truncated = truncate_str(&label, 26, "…").into_owned();
        assert!(!truncated.contains('\n'));
        assert!(measure_text_width(&truncated) <= 26);
    }

    // ---- non-interactive error mapping ----

    #[test]
    fn test_select_non_interactive_multiple_ports_returns_usage_error() {
        let ports = vec![
            DetectedPort::unclassified("/dev/ttyUSB0"),
            DetectedPort::unclassified("/dev/ttyUSB1"),
        ];
        assert_usage_error(select_non_interactive_port(ports, &Config::default()));
    }

    #[test]
    fn test_select_non_interactive_no_ports_returns_usage_error() {
        assert_usage_error(select_non_interactive_port(vec![], &Config::default()));
    }

    #[test]
    fn test_select_non_interactive_single_port_returns_selected_port() {
        let ports = vec![DetectedPort::unclassified("/dev/ttyUSB0")];
        let selected = select_non_interactive_port(ports, &Config::default()).unwrap();
        assert_eq!(selected.port.name, "/dev/ttyUSB0");
        assert!(!selected.is_known);
    }

    #[test]
    fn test_explicit_port_skips_detection() {
        let options = SerialOptions {
            port: Some("/dev/ttyFAKE9".to_string()),
            non_interactive: true,
            ..Default::default()
        };
        let selected = select_serial_port(&options, &Config::default()).unwrap();
        assert_eq!(selected.port.name, "/dev/ttyFAKE9");
    }
}
