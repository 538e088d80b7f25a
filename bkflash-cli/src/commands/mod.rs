//! Command implementations.
//!
//! Each subcommand is implemented in its own module for clean separation.

pub(crate) mod completions;
pub(crate) mod download;
pub(crate) mod flash;
pub(crate) mod ports;

use anyhow::Result;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

/// Style shared by every progress bar.
pub(crate) fn bar_style() -> Result<ProgressStyle> {
    Ok(ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")?
        .progress_chars("#>-"))
}

/// A percent bar on stderr, or a hidden one when `visible` is false.
pub(crate) fn percent_bar(visible: bool) -> Result<ProgressBar> {
    if !visible {
        return Ok(ProgressBar::hidden());
    }
    let pb = ProgressBar::with_draw_target(Some(100), ProgressDrawTarget::stderr());
    pb.set_style(bar_style()?);
    Ok(pb)
}

/// Percentage of `done` over `total`.
pub(crate) fn percent(done: usize, total: usize) -> u64 {
    if total == 0 {
        100
    } else {
        (done.min(total) * 100 / total) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent() {
        assert_eq!(percent(0, 0), 100);
        assert_eq!(percent(1, 4), 25);
        assert_eq!(percent(9, 4), 100);
    }

    #[test]
    fn test_bar_style_template_is_valid() {
        assert!(bar_style().is_ok());
    }
}
