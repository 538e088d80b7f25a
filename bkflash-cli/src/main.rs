//! bkflash CLI - Command-line tool for flashing Beken chips.
//!
//! ## Features
//!
//! - Download raw binaries to one or many boards in parallel
//! - Erase and read back flash regions
//! - Chip and flash identification
//! - Interactive serial port selection
//! - Shell completion generation
//! - Environment variable and config file support

use anyhow::Result;
use bkflash::{CancelToken, LinkCheckKind, ResetKind, SessionConfig};
use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use log::{debug, warn};
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};

mod commands;
mod config;
mod serial;

use config::Config;
use serial::SerialOptions;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Check if emoji/animations should be used (TTY and colors enabled).
fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Errors with a dedicated exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Bad arguments or an unusable environment (exit 2).
    #[error("{0}")]
    Usage(String),
    /// Interrupted by the user (exit 130).
    #[error("{0}")]
    Cancelled(String),
}

/// bkflash - A cross-platform tool for flashing Beken chips over the boot ROM
/// serial protocol.
///
/// Environment variables:
///   BKFLASH_PORT              - Serial port(s), comma-separated
///   BKFLASH_BAUD              - Working baud rate (default: 1500000)
///   BKFLASH_RESET             - Reset technique (0-3)
///   BKFLASH_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "bkflash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[allow(clippy::struct_excessive_bools)]
struct Cli {
    /// Serial port(s) to use; repeat for a parallel download.
    #[arg(
        short,
        long = "port",
        global = true,
        env = "BKFLASH_PORT",
        value_delimiter = ','
    )]
    ports: Vec<String>,

    /// Baud rate for data transfer.
    #[arg(short, long, global = true, env = "BKFLASH_BAUD")]
    baud: Option<u32>,

    /// Baud rate used while linking.
    #[arg(long, global = true)]
    link_baud: Option<u32>,

    /// Reset technique: 0 DTR/RTS, 1 ASCII reboot, 2 binary reboot, 3 rotate.
    #[arg(short, long, global = true, env = "BKFLASH_RESET", value_parser = parse_reset)]
    reset: Option<ResetKind>,

    /// Link-check handshake (rom, bootloader, mixed).
    #[arg(long, global = true, value_parser = parse_link_check)]
    link_check: Option<LinkCheckKind>,

    /// Number of link attempts before giving up.
    #[arg(long, global = true)]
    link_attempts: Option<u32>,

    /// Retries per command.
    #[arg(long, global = true)]
    retries: Option<u32>,

    /// Skip chip detection and assume this chip ID (hex).
    #[arg(long, global = true, value_parser = parse_hex_u32)]
    chip_id: Option<u32>,

    /// Key unlocking the extended boot ROM dialect (hex bytes).
    #[arg(long, global = true, value_parser = parse_link_key)]
    link_key: Option<LinkKey>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "BKFLASH_NON_INTERACTIVE")]
    non_interactive: bool,

    /// Confirm port selection even for auto-detected ports.
    #[arg(long, global = true)]
    confirm_port: bool,

    /// Offer all available ports (including unknown types).
    #[arg(long, global = true)]
    list_all_ports: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Link key bytes parsed from hex.
#[derive(Debug, Clone, PartialEq, Eq)]
struct LinkKey(Vec<u8>);

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Download binaries to flash.
    Download(DownloadArgs),

    /// Erase flash memory.
    Erase {
        /// Erase the entire flash.
        #[arg(long, conflicts_with = "region")]
        all: bool,

        /// Erase a region, as address:length (hex).
        #[arg(long, value_parser = parse_region)]
        region: Option<(u32, u32)>,
    },

    /// Read a flash region into a file.
    Read {
        /// Start address (hex).
        #[arg(value_parser = parse_hex_u32)]
        address: u32,

        /// Number of bytes (hex).
        #[arg(value_parser = parse_hex_u32)]
        length: u32,

        /// Output file.
        output: PathBuf,
    },

    /// Identify the chip and its flash.
    ChipId {
        /// Output as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// List available serial ports.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type (auto-detected with --install if omitted).
        #[arg(value_enum)]
        shell: Option<Shell>,

        /// Install completions into your shell configuration.
        #[arg(long)]
        install: bool,
    },
}

/// Arguments of the `download` command.
#[derive(Args)]
#[allow(clippy::struct_excessive_bools)]
struct DownloadArgs {
    /// Binary to flash, as file:address (hex); can be repeated.
    #[arg(long = "bin", required = true, value_parser = parse_bin_arg)]
    bins: Vec<(PathBuf, u32)>,

    /// Erase the entire flash first.
    #[arg(long, conflicts_with = "no_erase")]
    erase_all: bool,

    /// Do not erase before programming.
    #[arg(long)]
    no_erase: bool,

    /// Verify every segment after programming.
    #[arg(long)]
    verify: bool,

    /// Leave the target in the boot ROM when done.
    #[arg(long)]
    no_reboot: bool,

    /// Skip pages that are entirely 0xFF.
    #[arg(long)]
    skip_blank: bool,

    /// Bytes to patch after programming, as address=hex; can be repeated.
    #[arg(long = "info", value_parser = parse_info_arg)]
    info: Vec<(u32, Vec<u8>)>,

    /// Output per-port results as JSON to stdout.
    #[arg(long)]
    json: bool,
}

/// Parse binary argument in format "file:address".
///
/// The address follows the last colon so Windows drive letters survive.
fn parse_bin_arg(s: &str) -> Result<(PathBuf, u32), String> {
    let Some((path, addr)) = s.rsplit_once(':') else {
        return Err(format!(
            "Invalid format: '{s}'. Expected 'file:address' (e.g., 'app.bin:0x11000')"
        ));
    };
    if path.is_empty() {
        return Err(format!("Invalid format: '{s}'. Missing file name"));
    }
    Ok((PathBuf::from(path), parse_hex_u32(addr)?))
}

/// Parse "address:length" (both hex).
fn parse_region(s: &str) -> Result<(u32, u32), String> {
    let (addr, len) = s
        .split_once(':')
        .ok_or_else(|| format!("Invalid region '{s}'. Expected 'address:length'"))?;
    let len = parse_hex_u32(len)?;
    if len == 0 {
        return Err("Region length must be non-zero".into());
    }
    Ok((parse_hex_u32(addr)?, len))
}

/// Parse "address=hexbytes".
fn parse_info_arg(s: &str) -> Result<(u32, Vec<u8>), String> {
    let (addr, bytes) = s
        .split_once('=')
        .ok_or_else(|| format!("Invalid info '{s}'. Expected 'address=hexbytes'"))?;
    let bytes = parse_hex_bytes(bytes)?;
    if bytes.is_empty() {
        return Err("Info data must not be empty".into());
    }
    Ok((parse_hex_u32(addr)?, bytes))
}

/// Parse hexadecimal address (supports 0x prefix and underscores).
fn parse_hex_u32(s: &str) -> Result<u32, String> {
    let s = s.trim();
    let s = s.trim_start_matches("0x").trim_start_matches("0X");
    let s: String = s.chars().filter(|c| *c != '_').collect();
    u32::from_str_radix(&s, 16).map_err(|e| format!("Invalid hex value: {e}"))
}

/// Parse a hex byte string such as "0a1b2c" or "0a:1b:2c".
fn parse_hex_bytes(s: &str) -> Result<Vec<u8>, String> {
    let digits: Vec<char> = s
        .trim()
        .trim_start_matches("0x")
        .chars()
        .filter(|c| !matches!(c, ':' | '_' | ' '))
        .collect();
    if digits.len() % 2 != 0 {
        return Err(format!("Odd number of hex digits in '{s}'"));
    }
    digits
        .chunks(2)
        .map(|pair| {
            let byte: String = pair.iter().collect();
            u8::from_str_radix(&byte, 16).map_err(|e| format!("Invalid hex byte '{byte}': {e}"))
        })
        .collect()
}

fn parse_link_key(s: &str) -> Result<LinkKey, String> {
    parse_hex_bytes(s).map(LinkKey)
}

fn parse_reset(s: &str) -> Result<ResetKind, String> {
    s.parse().map_err(|e: bkflash::Error| e.to_string())
}

fn parse_link_check(s: &str) -> Result<LinkCheckKind, String> {
    s.parse().map_err(|e: bkflash::Error| e.to_string())
}

impl Cli {
    fn serial_options(&self) -> SerialOptions {
        SerialOptions {
            ports: self.ports.clone(),
            list_all_ports: self.list_all_ports,
            non_interactive: self.non_interactive,
            confirm_port: self.confirm_port,
        }
    }

    /// Session parameters: command line first, then config file, then
    /// library defaults.
    fn session_config(&self, config: &Config) -> Result<SessionConfig> {
        let mut session = SessionConfig::new();

        if let Some(baud) = self.link_baud.or(config.port.connection.baud) {
            session = session.with_link_baud(baud);
        }
        if let Some(baud) = self.baud.or(config.flash.baud) {
            session = session.with_work_baud(baud);
        }

        let reset = match (self.reset, config.flash.reset.as_deref()) {
            (Some(reset), _) => Some(reset),
            (None, Some(name)) => Some(name.parse().map_err(usage_from)?),
            (None, None) => None,
        };
        if let Some(reset) = reset {
            session = session.with_reset(reset);
        }

        let link_check = match (self.link_check, config.flash.link_check.as_deref()) {
            (Some(kind), _) => Some(kind),
            (None, Some(name)) => Some(name.parse().map_err(usage_from)?),
            (None, None) => None,
        };
        if let Some(kind) = link_check {
            session = session.with_link_check(kind);
        }

        if let Some(attempts) = self.link_attempts.or(config.flash.link_attempts) {
            session = session.with_link_attempts(attempts);
        }
        if let Some(retries) = self.retries.or(config.flash.retries) {
            session = session.with_retries(retries);
        }
        if let Some(id) = self.chip_id {
            session = session.with_chip_id(id);
        }
        if let Some(LinkKey(key)) = &self.link_key {
            session = session.with_link_key(key.clone());
        }

        session.validate().map_err(usage_from)?;
        Ok(session)
    }
}

fn usage_from(err: bkflash::Error) -> anyhow::Error {
    CliError::Usage(err.to_string()).into()
}

/// Map an error to the process exit code.
fn exit_code_for(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<CliError>() {
        Some(CliError::Usage(_)) => 2,
        Some(CliError::Cancelled(_)) => 130,
        None => {
            if err
                .downcast_ref::<bkflash::Error>()
                .is_some_and(bkflash::Error::is_cancelled)
            {
                130
            } else {
                1
            }
        },
    }
}

fn init_logging(cli: &Cli) {
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
}

fn install_interrupt_handler() -> CancelToken {
    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        if handler_token.is_cancelled() {
            std::process::exit(130);
        }
        eprintln!("\nInterrupted, finishing current command...");
        handler_token.cancel();
    }) {
        warn!("Could not install Ctrl-C handler: {e}");
    }
    cancel
}

fn run(cli: &Cli, cancel: &CancelToken) -> Result<ExitCode> {
    let mut config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::Download(args) => commands::download::cmd_download(cli, &mut config, args, cancel),
        Commands::Erase { all, region } => {
            commands::flash::cmd_erase(cli, &mut config, *all, *region, cancel)?;
            Ok(ExitCode::SUCCESS)
        },
        Commands::Read {
            address,
            length,
            output,
        } => {
            commands::flash::cmd_read(cli, &mut config, *address, *length, output, cancel)?;
            Ok(ExitCode::SUCCESS)
        },
        Commands::ChipId { json } => {
            commands::flash::cmd_chip_id(cli, &mut config, *json, cancel)?;
            Ok(ExitCode::SUCCESS)
        },
        Commands::ListPorts { json } => {
            commands::ports::cmd_list_ports(*json)?;
            Ok(ExitCode::SUCCESS)
        },
        Commands::Completions { shell, install } => {
            if *install {
                commands::completions::cmd_completions_install(*shell)?;
            } else {
                let shell = shell.ok_or_else(|| {
                    CliError::Usage(
                        "specify a shell type (e.g. `bkflash completions bash`) or use --install"
                            .into(),
                    )
                })?;
                commands::completions::cmd_completions(shell);
            }
            Ok(ExitCode::SUCCESS)
        },
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);
    if env::var_os("NO_COLOR").is_some() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    init_logging(&cli);
    debug!(
        "bkflash v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    let cancel = install_interrupt_handler();
    match run(&cli, &cancel) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{} {err:#}", style("Error:").red().bold());
            ExitCode::from(exit_code_for(&err))
        },
    }
}
