//! Shell completion generation and installation.

use anyhow::{Context, Result};
use clap::CommandFactory;
use clap_complete::{Shell, generate};
use console::style;
use directories::BaseDirs;
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::Cli;

const BIN: &str = "bkflash";

/// Generate shell completions to stdout.
pub(crate) fn cmd_completions(shell: Shell) {
    let mut cmd = Cli::command();
    generate(shell, &mut cmd, BIN, &mut io::stdout());
}

/// Detect the user's current shell from the environment.
fn detect_shell_type() -> Option<Shell> {
    if let Ok(shell_path) = env::var("SHELL") {
        return shell_from_path(&shell_path);
    }
    if cfg!(windows) && env::var_os("PSModulePath").is_some() {
        return Some(Shell::PowerShell);
    }
    None
}

/// Map a shell binary path to its `Shell`.
fn shell_from_path(shell_path: &str) -> Option<Shell> {
    let name = Path::new(shell_path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("");
    match name {
        "bash" => Some(Shell::Bash),
        "zsh" => Some(Shell::Zsh),
        "fish" => Some(Shell::Fish),
        "elvish" => Some(Shell::Elvish),
        "pwsh" | "powershell" => Some(Shell::PowerShell),
        _ => None,
    }
}

/// Where a completion script for `shell` is installed, relative to the
/// user's home, config and data directories.
fn completion_path(shell: Shell, home: &Path, config: &Path, data: &Path) -> Result<PathBuf> {
    let path = match shell {
        Shell::Bash => data.join("bash-completion/completions").join(BIN),
        Shell::Zsh => home.join(".zfunc").join(format!("_{BIN}")),
        Shell::Fish => config.join("fish/completions").join(format!("{BIN}.fish")),
        Shell::PowerShell => config.join("powershell/completions").join(format!("{BIN}.ps1")),
        Shell::Elvish => config.join("elvish/lib").join(format!("{BIN}.elv")),
        _ => anyhow::bail!("Unsupported shell for auto-install"),
    };
    Ok(path)
}

fn print_activation_hint(shell: Shell, path: &Path) {
    eprintln!();
    match shell {
        Shell::Bash => eprintln!(
            "To activate now: {}",
            style(format!("source {}", path.display())).cyan()
        ),
        Shell::Zsh => {
            eprintln!("Make sure ~/.zfunc is on your fpath, e.g. in ~/.zshrc:");
            eprintln!("  {}", style("fpath=(~/.zfunc $fpath)").cyan());
            eprintln!("  {}", style("autoload -Uz compinit && compinit").cyan());
        },
        Shell::PowerShell => eprintln!(
            "Add this to your PowerShell profile: {}",
            style(format!(". {}", path.display())).cyan()
        ),
        _ => eprintln!("Completions load automatically in new sessions."),
    }
}

/// Install shell completions.
pub(crate) fn cmd_completions_install(shell_arg: Option<Shell>) -> Result<()> {
    let shell = match shell_arg {
        Some(s) => s,
        None => detect_shell_type().context(
            "Could not detect your shell. Please specify it explicitly:\n  \
             bkflash completions --install bash",
        )?,
    };

    let dirs = BaseDirs::new().context("Could not determine home directory")?;
    let path = completion_path(shell, dirs.home_dir(), dirs.config_dir(), dirs.data_dir())?;

    let mut buf = Vec::new();
    generate(shell, &mut Cli::command(), BIN, &mut buf);

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    fs::write(&path, &buf)
        .with_context(|| format!("Failed to write completion file: {}", path.display()))?;

    eprintln!(
        "{} Installed {} completions to {}",
        style("✓").green().bold(),
        style(shell).cyan(),
        style(path.display()).yellow()
    );
    print_activation_hint(shell, &path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_from_path() {
        assert_eq!(shell_from_path("/bin/bash"), Some(Shell::Bash));
        assert_eq!(shell_from_path("/usr/bin/zsh"), Some(Shell::Zsh));
        assert_eq!(shell_from_path("/usr/local/bin/fish"), Some(Shell::Fish));
        assert_eq!(shell_from_path("/usr/bin/elvish"), Some(Shell::Elvish));
        assert_eq!(shell_from_path("pwsh"), Some(Shell::PowerShell));
        assert_eq!(shell_from_path("/usr/bin/tcsh"), None);
        assert_eq!(shell_from_path(""), None);
    }

    #[test]
    fn test_completion_paths() {
        let home = Path::new("/home/u");
        let config = Path::new("/home/u/.config");
        let data = Path::new("/home/u/.local/share");
        let path = |shell| completion_path(shell, home, config, data).unwrap();

        assert_eq!(
            path(Shell::Bash),
            PathBuf::from("/home/u/.local/share/bash-completion/completions/bkflash")
        );
        assert_eq!(path(Shell::Zsh), PathBuf::from("/home/u/.zfunc/_bkflash"));
        assert_eq!(
            path(Shell::Fish),
            PathBuf::from("/home/u/.config/fish/completions/bkflash.fish")
        );
        assert!(path(Shell::Elvish).ends_with("elvish/lib/bkflash.elv"));
        assert!(path(Shell::PowerShell).ends_with("bkflash.ps1"));
    }

    #[test]
    fn test_generate_mentions_subcommands() {
        let mut buf = Vec::new();
        generate(Shell::Bash, &mut Cli::command(), BIN, &mut buf);
        let script = String::from_utf8(buf).unwrap();
        assert!(script.contains("download"));
        assert!(script.contains("list-ports"));
    }
}
