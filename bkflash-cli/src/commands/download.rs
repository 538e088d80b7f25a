//! Download command: program binaries on one or more boards.

use anyhow::{Context, Result};
use bkflash::{
    BatchProgress, BatchReport, CancelToken, DownloadPlan, EraseMode, Segment, Stage, run_batch,
};
use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget};
use std::collections::HashMap;
use std::process::ExitCode;
use std::sync::Arc;

use super::{bar_style, percent};
use crate::config::Config;
use crate::serial::resolve_ports;
use crate::{Cli, CliError, DownloadArgs, use_fancy_output};

/// Build the download plan from the command line and config defaults.
fn build_plan(args: &DownloadArgs, config: &Config) -> Result<DownloadPlan> {
    let segments = args
        .bins
        .iter()
        .map(|(path, address)| {
            Segment::from_file(path, *address)
                .with_context(|| format!("Failed to read binary {}", path.display()))
        })
        .collect::<Result<Vec<_>>>()?;

    let erase = if args.erase_all {
        EraseMode::All
    } else if args.no_erase {
        EraseMode::None
    } else {
        EraseMode::Segments
    };

    let mut plan = DownloadPlan::new(segments)
        .with_erase(erase)
        .with_verify(args.verify || config.flash.verify)
        .with_reboot(!args.no_reboot)
        .with_skip_blank_pages(args.skip_blank || config.flash.skip_blank);
    for (address, data) in &args.info {
        plan = plan.with_device_info(*address, data.clone());
    }

    plan.validate()
        .map_err(|e| CliError::Usage(e.to_string()))?;
    Ok(plan)
}

/// One bar per port under a shared `MultiProgress`.
struct PortBars {
    bars: Arc<HashMap<String, ProgressBar>>,
}

impl PortBars {
    fn new(ports: &[String], visible: bool) -> Result<Self> {
        let multi = MultiProgress::with_draw_target(if visible {
            ProgressDrawTarget::stderr()
        } else {
            ProgressDrawTarget::hidden()
        });
        let style = bar_style()?;
        let bars = ports
            .iter()
            .map(|port| {
                let bar = multi.add(ProgressBar::new(100));
                bar.set_style(style.clone());
                bar.set_message(port.clone());
                (port.clone(), bar)
            })
            .collect();
        Ok(Self {
            bars: Arc::new(bars),
        })
    }

    fn callback(&self) -> BatchProgress {
        let bars = Arc::clone(&self.bars);
        Arc::new(move |port: &str, stage: Stage, done: usize, total: usize| {
            if let Some(bar) = bars.get(port) {
                bar.set_message(format!("{port}: {stage}"));
                bar.set_position(percent(done, total));
            }
        })
    }

    fn finish(&self, report: &BatchReport) {
        for outcome in &report.outcomes {
            if let Some(bar) = self.bars.get(&outcome.port) {
                if outcome.is_success() {
                    bar.finish_with_message(format!("{}: done", outcome.port));
                } else {
                    bar.abandon_with_message(format!("{}: failed", outcome.port));
                }
            }
        }
    }
}

fn print_plan(plan: &DownloadPlan, ports: &[String]) {
    for segment in &plan.segments {
        eprintln!(
            "    {} {} @ 0x{:08X} ({} bytes)",
            style("•").dim(),
            segment.name,
            segment.address,
            segment.data.len()
        );
    }
    eprintln!(
        "{} Downloading {} byte(s) to {} port(s)",
        style("🔌").cyan(),
        plan.total_bytes(),
        ports.len()
    );
}

fn print_report(report: &BatchReport) {
    eprintln!();
    for outcome in &report.outcomes {
        let secs = outcome.elapsed.as_secs_f64();
        let chip = outcome
            .chip
            .as_ref()
            .map(|c| format!("  {c}"))
            .unwrap_or_default();
        match &outcome.result {
            Ok(()) => eprintln!(
                "{} {}  {}  {secs:.2}s{chip}",
                style("✓").green(),
                style(&outcome.port).cyan(),
                style("PASS").green().bold()
            ),
            Err(e) => eprintln!(
                "{} {}  {}  {secs:.2}s  {e}",
                style("✗").red(),
                style(&outcome.port).cyan(),
                style("FAIL").red().bold()
            ),
        }
    }
    eprintln!(
        "\n{} passed, {} failed in {:.2}s",
        report.passed(),
        report.failed(),
        report.elapsed.as_secs_f64()
    );
}

/// Download command implementation.
pub(crate) fn cmd_download(
    cli: &Cli,
    config: &mut Config,
    args: &DownloadArgs,
    cancel: &CancelToken,
) -> Result<ExitCode> {
    let session = Arc::new(cli.session_config(config)?);
    let plan = Arc::new(build_plan(args, config)?);
    let ports = resolve_ports(&cli.serial_options(), config)?;

    let chatty = !cli.quiet && !args.json;
    if chatty {
        print_plan(&plan, &ports);
    }

    let bars = PortBars::new(&ports, chatty && use_fancy_output())?;
    let report = run_batch(&ports, plan, session, cancel, bars.callback());
    bars.finish(&report);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report.summaries())?);
    } else if !cli.quiet || !report.all_passed() {
        print_report(&report);
    }

    Ok(if report.all_passed() {
        ExitCode::SUCCESS
    } else if cancel.is_cancelled() {
        ExitCode::from(130)
    } else {
        ExitCode::FAILURE
    })
}
