//! Single-port commands: erase, read and chip identification.

use anyhow::{Context, Result};
use bkflash::{
    CancelToken, CommandExecutor, EraseTarget, FlashRegion, Flasher, NativePort, SessionConfig,
    Transport, establish,
};
use console::style;
use log::{info, warn};
use std::path::Path;
use std::sync::Arc;
use std::{fs, thread};

use super::{percent, percent_bar};
use crate::config::Config;
use crate::serial::resolve_single_port;
use crate::{Cli, use_fancy_output};

/// Link to one target, identify it, switch to the work baud rate and run
/// `work`. The target is rebooted and the port closed on every path once
/// the link is up.
fn with_flasher<T>(
    cli: &Cli,
    config: &mut Config,
    cancel: &CancelToken,
    work: impl FnOnce(&mut Flasher<NativePort>) -> Result<T>,
) -> Result<T> {
    let session = Arc::new(cli.session_config(config)?);
    let port = resolve_single_port(&cli.serial_options(), config)?;
    if !cli.quiet {
        eprintln!(
            "{} Using {} at {} baud",
            style("🔌").cyan(),
            style(&port).green(),
            session.link_baud
        );
    }

    let mut transport = Transport::open(&port, session.link_baud)
        .with_context(|| format!("Failed to open {port}"))?;
    if !cli.quiet {
        eprintln!("{} Waiting for the boot ROM...", style("⏳").yellow());
    }
    let link = establish(&mut transport, &session, cancel)?;
    let executor = CommandExecutor::new(transport, link.state, cancel.clone())?;
    let mut flasher = Flasher::new(executor, Arc::clone(&session));

    let result = prepare(&mut flasher, &session).and_then(|()| work(&mut flasher));

    if let Err(e) = flasher.reboot() {
        warn!("Reboot failed: {e}");
    }
    if let Err(e) = flasher.close() {
        warn!("Close failed: {e}");
    }
    result
}

fn prepare(flasher: &mut Flasher<NativePort>, session: &SessionConfig) -> Result<()> {
    thread::sleep(session.post_link_delay);
    let chip = flasher.read_chip_id()?;
    let flash = flasher.read_flash_mid()?;
    info!("Found {chip} with {flash}");
    flasher.set_baudrate(session.work_baud, session.baud_switch_delay_ms)?;
    Ok(())
}

fn done(cli: &Cli, message: &str) {
    if !cli.quiet {
        eprintln!("{} {message}", style("✓").green().bold());
    }
}

/// Erase command implementation.
pub(crate) fn cmd_erase(
    cli: &Cli,
    config: &mut Config,
    all: bool,
    region: Option<(u32, u32)>,
    cancel: &CancelToken,
) -> Result<()> {
    let target = match (all, region) {
        (true, _) => EraseTarget::All,
        (false, Some((start, len))) => EraseTarget::Range(FlashRegion::new(start, len)),
        (false, None) => {
            return Err(crate::CliError::Usage(
                "pass --all to erase the entire flash or --region address:length".into(),
            )
            .into());
        },
    };

    let pb = percent_bar(!cli.quiet && use_fancy_output())?;
    pb.set_message("Erasing");
    with_flasher(cli, config, cancel, |flasher| {
        flasher.set_protection(false)?;
        flasher.erase(target, &mut |done, total| pb.set_position(percent(done, total)))?;
        flasher.set_protection(true)?;
        Ok(())
    })?;
    pb.finish_and_clear();

    done(cli, "Erase complete");
    Ok(())
}

/// Read command implementation.
pub(crate) fn cmd_read(
    cli: &Cli,
    config: &mut Config,
    address: u32,
    length: u32,
    output: &Path,
    cancel: &CancelToken,
) -> Result<()> {
    let pb = percent_bar(!cli.quiet && use_fancy_output())?;
    pb.set_message("Reading");
    let data = with_flasher(cli, config, cancel, |flasher| {
        Ok(flasher.read_region(address, length, &mut |done, total| {
            pb.set_position(percent(done, total));
        })?)
    })?;
    pb.finish_and_clear();

    fs::write(output, &data).with_context(|| format!("Failed to write {}", output.display()))?;
    done(
        cli,
        &format!(
            "Read {} bytes from 0x{address:08X} into {}",
            data.len(),
            output.display()
        ),
    );
    Ok(())
}

/// Chip-id command implementation.
pub(crate) fn cmd_chip_id(
    cli: &Cli,
    config: &mut Config,
    json: bool,
    cancel: &CancelToken,
) -> Result<()> {
    let (chip, flash) = with_flasher(cli, config, cancel, |flasher| {
        let chip = flasher
            .chip()
            .context("chip id was not read")?;
        let flash = flasher
            .flash()
            .context("flash id was not read")?;
        Ok((chip, flash))
    })?;

    if json {
        let info = serde_json::json!({
            "chip": chip.family,
            "chip_id": format!("0x{:x}", chip.id),
            "second_id": chip.second_id.map(|id| format!("0x{id:08x}")),
            "flash_mid": format!("0x{:06x}", flash.mid),
            "flash_manufacturer": flash.manufacturer(),
            "flash_size": flash.size,
        });
        println!("{}", serde_json::to_string_pretty(&info)?);
    } else {
        println!("Chip:  {chip}");
        println!("Flash: {flash}");
    }
    Ok(())
}
