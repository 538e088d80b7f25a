//! Serial port selection.
//!
//! Ports given on the command line or in the config file are used as-is.
//! Otherwise known USB bridges are detected and, when more than one is
//! present, the user picks one through a prompt. Non-interactive mode never
//! prompts.

use {
    crate::{CliError, config::Config},
    anyhow::Result,
    bkflash::{DetectedPort, detect_ports, device::format_port_list},
    console::style,
    dialoguer::{Confirm, Error as DialoguerError, Select, theme::ColorfulTheme},
    log::{debug, error, info},
    std::io::IsTerminal,
};

/// Options for serial port selection.
#[derive(Debug, Clone, Default)]
pub struct SerialOptions {
    /// Explicit ports given on the command line.
    pub ports: Vec<String>,
    /// Offer every port, including unknown bridges.
    pub list_all_ports: bool,
    /// Fail instead of prompting.
    pub non_interactive: bool,
    /// Ask before using a single recognised port.
    pub confirm_port: bool,
}

/// Result of port selection.
#[derive(Debug)]
pub struct SelectedPort {
    /// The selected port.
    pub port: DetectedPort,
    /// Whether it matched a built-in or remembered bridge.
    pub is_known: bool,
}

fn usage_err(message: &str) -> anyhow::Error {
    CliError::Usage(message.to_string()).into()
}

/// Resolve the ports a command should run on.
///
/// Explicit and configured ports may name several targets. Detection always
/// yields a single port.
pub fn resolve_ports(options: &SerialOptions, config: &mut Config) -> Result<Vec<String>> {
    if !options.ports.is_empty() {
        return Ok(options.ports.clone());
    }
    if !config.port.connection.serial.is_empty() {
        debug!("Using ports from config: {:?}", config.port.connection.serial);
        return Ok(config.port.connection.serial.clone());
    }

    let selected = select_serial_port(options, config, detect_ports())?;
    if !selected.is_known && !options.non_interactive {
        ask_remember_port(&selected.port, config)?;
    }
    Ok(vec![selected.port.name().to_string()])
}

/// Resolve exactly one port.
pub fn resolve_single_port(options: &SerialOptions, config: &mut Config) -> Result<String> {
    let mut ports = resolve_ports(options, config)?;
    if ports.len() > 1 {
        return Err(usage_err(
            "this command works on a single port; pass one --port",
        ));
    }
    ports
        .pop()
        .ok_or_else(|| usage_err("no serial port selected"))
}

fn select_non_interactive_port(
    mut candidates: Vec<DetectedPort>,
    config: &Config,
) -> Result<SelectedPort> {
    match candidates.len() {
        0 => Err(usage_err("no serial ports available")),
        1 => {
            let port = candidates.remove(0);
            Ok(SelectedPort {
                is_known: is_known_device(&port, config),
                port,
            })
        },
        _ => Err(usage_err(
            "multiple serial ports found; pass --port in non-interactive mode",
        )),
    }
}

/// Pick one port from `detected`.
pub fn select_serial_port(
    options: &SerialOptions,
    config: &Config,
    detected: Vec<DetectedPort>,
) -> Result<SelectedPort> {
    if detected.is_empty() {
        return Err(usage_err("no serial ports found"));
    }

    let known: Vec<DetectedPort> = detected
        .iter()
        .filter(|p| is_known_device(p, config))
        .cloned()
        .collect();
    let candidates = if options.list_all_ports || known.is_empty() {
        detected
    } else {
        known
    };

    if options.non_interactive {
        return select_non_interactive_port(candidates, config);
    }

    if candidates.len() == 1 {
        let port = candidates
            .into_iter()
            .next()
            .ok_or_else(|| usage_err("no serial ports available"))?;
        let is_known = is_known_device(&port, config);
        if is_known && !options.confirm_port {
            info!("Auto-selected port: {} [{}]", port.name(), port.device.name());
            return Ok(SelectedPort { port, is_known });
        }
        ensure_interactive_terminal()?;
        return confirm_single_port(port, is_known);
    }

    ensure_interactive_terminal()?;
    select_port_interactive(candidates, config)
}

fn ensure_interactive_terminal() -> Result<()> {
    if std::io::stdin().is_terminal() && std::io::stderr().is_terminal() {
        Ok(())
    } else {
        Err(usage_err(
            "port selection needs a terminal; pass --port or --non-interactive",
        ))
    }
}

fn map_prompt_error(err: DialoguerError) -> anyhow::Error {
    match err {
        DialoguerError::IO(io_err) if io_err.kind() == std::io::ErrorKind::Interrupted => {
            CliError::Cancelled("port selection cancelled".into()).into()
        },
        DialoguerError::IO(io_err) => usage_err(&format!("prompt failed: {io_err}")),
    }
}

fn is_known_device(port: &DetectedPort, config: &Config) -> bool {
    if port.device.is_known() {
        return true;
    }
    match (port.info.vid, port.info.pid) {
        (Some(vid), Some(pid)) => config.is_remembered(vid, pid),
        _ => false,
    }
}

fn select_port_interactive(mut ports: Vec<DetectedPort>, config: &Config) -> Result<SelectedPort> {
    eprintln!(
        "{} Found {} serial ports",
        style("ℹ").blue(),
        ports.len()
    );

    ports.sort_by_key(|p| !is_known_device(p, config));

    let term_width = console::Term::stderr()
        .size()
        .1 as usize;
    let max_item_width = term_width.saturating_sub(4);
    let labels: Vec<String> = format_port_list(&ports)
        .into_iter()
        .zip(&ports)
        .map(|(label, port)| {
            let label = if is_known_device(port, config) {
                style(label)
                    .bold()
                    .to_string()
            } else {
                label
            };
            console::truncate_str(&label, max_item_width, "\u{2026}").into_owned()
        })
        .collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select the serial port")
        .items(&labels)
        .default(0)
        .interact_opt()
        .map_err(map_prompt_error)?;

    let Some(index) = selection else {
        return Err(CliError::Cancelled("port selection cancelled".into()).into());
    };
    let port = ports
        .into_iter()
        .nth(index)
        .ok_or_else(|| anyhow::anyhow!("Invalid port index: {index}"))?;
    let is_known = is_known_device(&port, config);
    Ok(SelectedPort { port, is_known })
}

fn confirm_single_port(port: DetectedPort, is_known: bool) -> Result<SelectedPort> {
    let label = format_port_list(std::slice::from_ref(&port)).join("");
    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Use serial port {label}?"))
        .default(true)
        .interact_opt()
        .map_err(map_prompt_error)?
        .unwrap_or(false);

    if confirmed {
        Ok(SelectedPort { port, is_known })
    } else {
        Err(CliError::Cancelled("port selection cancelled".into()).into())
    }
}

/// Offer to remember an unrecognised USB bridge.
pub fn ask_remember_port(port: &DetectedPort, config: &mut Config) -> Result<()> {
    let (Some(vid), Some(pid)) = (port.info.vid, port.info.pid) else {
        return Ok(());
    };
    if config.is_remembered(vid, pid) || !std::io::stdin().is_terminal() {
        return Ok(());
    }

    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Remember {vid:04X}:{pid:04X} as a flashing bridge?"))
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
    use {super::*, bkflash::PortInfo};

    fn port(name: &str, vid: Option<u16>, pid: Option<u16>) -> DetectedPort {
        DetectedPort::from(PortInfo {
            name: name.to_string(),
            vid,
            pid,
            manufacturer: None,
            product: None,
            serial_number: None,
        })
    }

    fn non_interactive() -> SerialOptions {
        SerialOptions {
            non_interactive: true,
            ..SerialOptions::default()
        }
    }

    fn assert_usage(err: &anyhow::Error) {
        assert!(matches!(err.downcast_ref::<CliError>(), Some(CliError::Usage(_))));
    }

    #[test]
    fn test_explicit_ports_are_used_verbatim() {
        let options = SerialOptions {
            ports: vec!["/dev/ttyUSB3".into(), "/dev/ttyUSB1".into()],
            ..non_interactive()
        };
        let ports = resolve_ports(&options, &mut Config::default()).unwrap();
        assert_eq!(ports, vec!["/dev/ttyUSB3", "/dev/ttyUSB1"]);
    }

    #[test]
    fn test_configured_ports_are_used() {
        let mut config = Config::default();
        config.port.connection.serial = vec!["COM7".into()];
        let ports = resolve_ports(&non_interactive(), &mut config).unwrap();
        assert_eq!(ports, vec!["COM7"]);
    }

    #[test]
    fn test_single_port_rejects_many() {
        let options = SerialOptions {
            ports: vec!["a".into(), "b".into()],
            ..non_interactive()
        };
        let err = resolve_single_port(&options, &mut Config::default()).unwrap_err();
        assert_usage(&err);
    }

    #[test]
    fn test_no_ports_is_usage_error() {
        let err = select_serial_port(&non_interactive(), &Config::default(), vec![]).unwrap_err();
        assert_usage(&err);
    }

    #[test]
    fn test_non_interactive_multiple_ports_is_usage_error() {
        let detected = vec![
            port("/dev/ttyUSB0", Some(0x1A86), Some(0x7523)),
            port("/dev/ttyUSB1", Some(0x10C4), Some(0xEA60)),
        ];
        let err = select_serial_port(&non_interactive(), &Config::default(), detected).unwrap_err();
        assert_usage(&err);
    }

    #[test]
    fn test_non_interactive_prefers_single_known_bridge() {
        let detected = vec![
            port("/dev/ttyS0", None, None),
            port("/dev/ttyUSB0", Some(0x1A86), Some(0x7523)),
        ];
        let selected = select_serial_port(&non_interactive(), &Config::default(), detected).unwrap();
        assert_eq!(selected.port.name(), "/dev/ttyUSB0");
        assert!(selected.is_known);
    }

    #[test]
    fn test_list_all_ports_widens_candidates() {
        let detected = vec![
            port("/dev/ttyS0", None, None),
            port("/dev/ttyUSB0", Some(0x1A86), Some(0x7523)),
        ];
        let options = SerialOptions {
            list_all_ports: true,
            ..non_interactive()
        };
        let err = select_serial_port(&options, &Config::default(), detected).unwrap_err();
        assert_usage(&err);
    }

    #[test]
    fn test_remembered_bridge_is_known() {
        let mut config = Config::default();
        config.port.usb_device.push(crate::config::UsbDevice {
            vid: 0x1234,
            pid: 0x5678,
        });
        assert!(is_known_device(&port("x", Some(0x1234), Some(0x5678)), &config));
        assert!(!is_known_device(&port("y", Some(0x1234), Some(0x0001)), &config));
    }
}
