//! # bkflash
//!
//! A library for flashing Beken chips through their boot ROM serial protocol.
//!
//! This crate provides the core functionality for talking to a Beken boot ROM
//! (or secondary bootloader) over a serial port, including:
//!
//! - Frame encoding and response validation for the v2 application and flash
//!   sub-dialects, and the legacy v1.4 flash dialect
//! - Link establishment with DTR/RTS, ASCII and binary reset techniques
//! - Command execution with idempotent retry
//! - Chip identification, flash erase/program/verify and protection
//! - A download orchestrator and a one-thread-per-port batch runner
//!
//! ## Features
//!
//! - `native` (default): Native serial port support via `serialport`
//! - `serde`: Serialization support for configuration enums and outcomes
//!
//! ## Example
//!
//! ```rust,no_run
//! use bkflash::{CancelToken, DownloadPlan, Downloader, Segment, SessionConfig, Transport};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SessionConfig::new().with_work_baud(1_500_000);
//!     let plan = DownloadPlan::new(vec![Segment::from_file("app.bin", 0x0)?]);
//!
//!     let transport = Transport::open("/dev/ttyUSB0", config.link_baud)?;
//!     let downloader = Downloader::new(config.into(), CancelToken::new());
//!     let outcome = downloader.run(transport, &plan, &mut |stage, done, total| {
//!         println!("{stage}: {done}/{total}");
//!     });
//!
//!     outcome.result?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

pub mod batch;
pub mod config;
pub mod connection;
pub mod device;
pub mod download;
pub mod error;
pub mod port;
pub mod protocol;
pub mod target;

#[cfg(test)]
pub(crate) mod testing;

/// Shared cancellation flag.
///
/// Clones observe the same flag. Long-running loops check it between link
/// attempts, command tries and flash pages.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Create a token that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0
            .store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0
            .load(Ordering::SeqCst)
    }

    /// Fail with [`Error::Cancelled`] if cancellation was requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

// Re-exports for convenience
#[cfg(feature = "native")]
pub use {
    batch::run_batch,
    device::{auto_detect_port, detect_ports},
    port::{NativePort, NativePortEnumerator},
};
pub use {
    batch::{BatchProgress, BatchReport, PortSummary, run_batch_with},
    config::{LinkCheckKind, ResetKind, SessionConfig},
    connection::{CommandExecutor, LinkOutcome, LinkState, Transport, establish},
    device::{DetectedPort, DeviceKind, select_port},
    download::{DownloadPlan, Downloader, EraseMode, InfoWrite, PortOutcome, Segment, Stage},
    error::{Error, Result},
    port::{Port, PortEnumerator, PortInfo, SerialConfig},
    protocol::{Command, FlashStatus, ValidationError},
    target::{ChipFamily, ChipId, EraseTarget, FlashInfo, FlashRegion, Flasher},
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_token_default_false() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        assert!(token.check().is_ok());
    }

    #[test]
    fn test_cancel_token_shared_between_clones() {
        let token = CancelToken::new();
        let worker = token.clone();
        token.cancel();

        assert!(worker.is_cancelled());
        assert!(matches!(worker.check(), Err(Error::Cancelled)));
    }
}
