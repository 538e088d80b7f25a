//! `list-ports` command.

use anyhow::Result;
use bkflash::{DetectedPort, detect_ports, device::format_port_list, select_port};
use console::style;

/// JSON view of a detected port.
fn port_json(port: &DetectedPort) -> serde_json::Value {
    serde_json::json!({
        "name": port.name(),
        "device": port.device.name(),
        "known": port.device.is_known(),
        "vid": port.info.vid,
        "pid": port.info.pid,
        "manufacturer": port.info.manufacturer,
        "product": port.info.product,
        "serial": port.info.serial_number,
    })
}

/// List ports command implementation.
pub(crate) fn cmd_list_ports(json: bool) -> Result<()> {
    let detected = detect_ports();

    if json {
        let ports: Vec<serde_json::Value> = detected.iter().map(port_json).collect();
        println!("{}", serde_json::to_string_pretty(&ports)?);
        return Ok(());
    }

    eprintln!("{}", style("Serial ports").bold().underlined());
    if detected.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
        return Ok(());
    }

    for (port, line) in detected.iter().zip(format_port_list(&detected)) {
        let bullet = if port.device.is_known() {
            style("•").green()
        } else {
            style("•").dim()
        };
        eprintln!("  {bullet} {line}");
    }

    if let Ok(port) = select_port(&detected) {
        eprintln!(
            "\n{} Default port: {}",
            style("→").green().bold(),
            style(port.name()).cyan().bold()
        );
    }
    Ok(())
}
