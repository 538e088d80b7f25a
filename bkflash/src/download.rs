//! Download orchestration for a single port.
//!
//! A download runs a fixed sequence of [`Stage`]s against one target. The
//! first failing stage aborts the sequence; cleanup (optional reboot, then
//! closing the port) always runs.

use {
    crate::{
        CancelToken,
        config::SessionConfig,
        connection::{CommandExecutor, Transport, establish},
        error::{Error, Result},
        port::Port,
        target::{ChipId, EraseTarget, FlashInfo, FlashRegion, Flasher},
    },
    log::{debug, error, info, warn},
    std::{
        fmt, fs,
        path::Path,
        sync::Arc,
        thread::sleep,
        time::{Duration, Instant},
    },
};

/// Steps of a download, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum Stage {
    /// Reset and link check.
    Link,
    /// Chip identification.
    ChipId,
    /// Flash JEDEC ID.
    FlashId,
    /// Switch to the work baud rate.
    BaudRate,
    /// Clear flash write protection.
    Unprotect,
    /// Erase.
    Erase,
    /// Program segments.
    Program,
    /// Verify segments.
    Verify,
    /// Device name / ID writes.
    DeviceInfo,
    /// Restore flash write protection.
    Protect,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Link => "link",
            Self::ChipId => "chip id",
            Self::FlashId => "flash id",
            Self::BaudRate => "baud rate",
            Self::Unprotect => "unprotect",
            Self::Erase => "erase",
            Self::Program => "program",
            Self::Verify => "verify",
            Self::DeviceInfo => "device info",
            Self::Protect => "protect",
        };
        f.write_str(name)
    }
}

/// A binary image to write at a fixed flash address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Flash address of the first byte.
    pub address: u32,
    /// Image contents.
    pub data: Vec<u8>,
    /// Label for logs, usually the file name.
    pub name: String,
}

impl Segment {
    /// Create a segment from bytes.
    pub fn new(address: u32, data: Vec<u8>) -> Self {
        Self {
            address,
            data,
            name: format!("{address:#010x}"),
        }
    }

    /// Load a segment from a binary file.
    pub fn from_file(path: impl AsRef<Path>, address: u32) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read(path)?;
        let name = path
            .file_name()
            .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned());
        Ok(Self {
            address,
            data,
            name,
        })
    }

    /// Replace the log label.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Flash range covered by the segment.
    pub fn region(&self) -> Result<FlashRegion> {
        let len = u32::try_from(self.data.len())
            .map_err(|_| Error::Config(format!("segment {} is larger than 4 GiB", self.name)))?;
        Ok(FlashRegion::new(self.address, len))
    }
}

/// How much to erase before programming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum EraseMode {
    /// Program over the existing contents.
    None,
    /// Erase the sectors each segment covers.
    #[default]
    Segments,
    /// Erase the whole chip.
    All,
}

/// Bytes patched into an existing sector after programming (device name,
/// device ID).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoWrite {
    /// Flash address of the first byte.
    pub address: u32,
    /// Bytes to write. Must not cross a sector boundary.
    pub data: Vec<u8>,
}

/// Everything a download does to one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadPlan {
    /// Images, in ascending address order.
    pub segments: Vec<Segment>,
    /// Erase before programming.
    pub erase: EraseMode,
    /// Verify each segment after programming.
    pub verify: bool,
    /// Reboot into the application at the end.
    pub reboot: bool,
    /// Skip all-0xFF pages. Ignored unless the plan erases.
    pub skip_blank_pages: bool,
    /// Sector patches applied after programming.
    pub device_info: Vec<InfoWrite>,
}

impl DownloadPlan {
    /// Plan that erases and programs `segments`, then reboots.
    pub fn new(mut segments: Vec<Segment>) -> Self {
        segments.sort_by_key(|s| s.address);
        Self {
            segments,
            erase: EraseMode::default(),
            verify: false,
            reboot: true,
            skip_blank_pages: false,
            device_info: Vec::new(),
        }
    }

    /// Set the erase mode.
    #[must_use]
    pub fn with_erase(mut self, erase: EraseMode) -> Self {
        self.erase = erase;
        self
    }

    /// Enable or disable verification.
    #[must_use]
    pub fn with_verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    /// Enable or disable the final reboot.
    #[must_use]
    pub fn with_reboot(mut self, reboot: bool) -> Self {
        self.reboot = reboot;
        self
    }

    /// Enable or disable blank page skipping.
    #[must_use]
    pub fn with_skip_blank_pages(mut self, skip: bool) -> Self {
        self.skip_blank_pages = skip;
        self
    }

    /// Add a device info write.
    #[must_use]
    pub fn with_device_info(mut self, address: u32, data: Vec<u8>) -> Self {
        self.device_info
            .push(InfoWrite { address, data });
        self
    }

    /// Total image bytes.
    pub fn total_bytes(&self) -> usize {
        self.segments
            .iter()
            .map(|s| s.data.len())
            .sum()
    }

    /// Check ordering and overlap; segments must be sorted by address.
    pub fn validate(&self) -> Result<()> {
        for pair in self
            .segments
            .windows(2)
        {
            let (a, b) = (&pair[0], &pair[1]);
            if b.address < a.address {
                return Err(Error::Config(format!(
                    "segment {} must come before {}",
                    b.name, a.name
                )));
            }
            if a.region()?
                .overlaps(&b.region()?)
            {
                return Err(Error::Config(format!(
                    "segments {} and {} overlap",
                    a.name, b.name
                )));
            }
        }
        Ok(())
    }

    /// Check that every segment and info write fits in `flash`.
    pub fn check_bounds(&self, flash: &FlashInfo) -> Result<()> {
        for segment in &self.segments {
            flash.check_region(segment.region()?)?;
        }
        for info in &self.device_info {
            let len = u32::try_from(info.data.len())
                .map_err(|_| Error::Config("device info too large".into()))?;
            flash.check_region(FlashRegion::new(info.address, len))?;
        }
        Ok(())
    }
}

/// Result of a download on one port.
#[derive(Debug)]
pub struct PortOutcome {
    /// Port name.
    pub port: String,
    /// `Ok` if every stage passed.
    pub result: Result<()>,
    /// Wall time from start to the end of cleanup.
    pub elapsed: Duration,
    /// Chip identity, if it was read.
    pub chip: Option<ChipId>,
}

impl PortOutcome {
    /// Outcome for a port that failed before the download started.
    pub fn failed(port: impl Into<String>, error: Error) -> Self {
        Self {
            port: port.into(),
            result: Err(error),
            elapsed: Duration::ZERO,
            chip: None,
        }
    }

    /// Whether every stage passed.
    pub fn is_success(&self) -> bool {
        self.result
            .is_ok()
    }
}

/// Progress callback: `(stage, done, total)`.
pub type StageProgress<'a> = &'a mut dyn FnMut(Stage, usize, usize);

/// Runs a [`DownloadPlan`] against one target.
#[derive(Debug, Clone)]
pub struct Downloader {
    config: Arc<SessionConfig>,
    cancel: CancelToken,
}

impl Downloader {
    /// Create a downloader sharing `config` and `cancel`.
    pub fn new(config: Arc<SessionConfig>, cancel: CancelToken) -> Self {
        Self { config, cancel }
    }

    /// Session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Run `plan` on `transport`. The transport is always closed on return.
    pub fn run<P: Port>(
        &self,
        transport: Transport<P>,
        plan: &DownloadPlan,
        progress: StageProgress<'_>,
    ) -> PortOutcome {
        let started = Instant::now();
        let port = transport
            .name()
            .to_string();
        info!("{port}: starting download of {} byte(s)", plan.total_bytes());

        let mut chip = None;
        let result = self.session(transport, plan, progress, &mut chip);
        let elapsed = started.elapsed();

        match &result {
            Ok(()) => info!("{port}: PASS in {:.3}s", elapsed.as_secs_f64()),
            Err(e) => error!("{port}: FAIL after {:.3}s: {e}", elapsed.as_secs_f64()),
        }
        PortOutcome {
            port,
            result,
            elapsed,
            chip,
        }
    }

    fn session<P: Port>(
        &self,
        mut transport: Transport<P>,
        plan: &DownloadPlan,
        progress: StageProgress<'_>,
        chip: &mut Option<ChipId>,
    ) -> Result<()> {
        self.config
            .validate()?;
        plan.validate()?;

        let link = match establish(&mut transport, &self.config, &self.cancel) {
            Ok(link) => link,
            Err(e) => {
                if let Err(close) = transport.close() {
                    warn!("{}: close failed: {close}", transport.name());
                }
                return Err(e.in_stage(Stage::Link));
            },
        };
        progress(Stage::Link, 1, 1);

        let executor = CommandExecutor::new(transport, link.state, self.cancel.clone())
            .map_err(|e| e.in_stage(Stage::Link))?;
        let mut flasher = Flasher::new(executor, Arc::clone(&self.config));

        let result = self.flash(&mut flasher, plan, progress);
        *chip = flasher.chip();

        if plan.reboot {
            if let Err(e) = flasher.reboot() {
                warn!("Reboot failed: {e}");
            }
        }
        if let Err(e) = flasher.close() {
            warn!("Close failed: {e}");
        }
        result
    }

    fn flash<P: Port>(
        &self,
        flasher: &mut Flasher<P>,
        plan: &DownloadPlan,
        progress: StageProgress<'_>,
    ) -> Result<()> {
        sleep(self.config.post_link_delay);

        flasher
            .read_chip_id()
            .map_err(|e| e.in_stage(Stage::ChipId))?;
        progress(Stage::ChipId, 1, 1);

        let flash = flasher
            .read_flash_mid()
            .and_then(|flash| plan.check_bounds(&flash).map(|()| flash))
            .map_err(|e| e.in_stage(Stage::FlashId))?;
        debug!("Plan fits in {} KiB flash", flash.size / 1024);
        progress(Stage::FlashId, 1, 1);

        flasher
            .set_baudrate(self.config.work_baud, self.config.baud_switch_delay_ms)
            .map_err(|e| e.in_stage(Stage::BaudRate))?;
        progress(Stage::BaudRate, 1, 1);

        flasher
            .set_protection(false)
            .map_err(|e| e.in_stage(Stage::Unprotect))?;
        progress(Stage::Unprotect, 1, 1);

        self.erase(flasher, plan, progress)
            .map_err(|e| e.in_stage(Stage::Erase))?;

        flasher.set_skip_blank_pages(plan.skip_blank_pages && plan.erase != EraseMode::None);
        let total = plan.total_bytes();
        let mut written = 0;
        for segment in &plan.segments {
            info!(
                "Programming {} ({} bytes) at {:#010x}",
                segment.name,
                segment.data.len(),
                segment.address
            );
            let len = segment.data.len();
            flasher
                .program_region(segment.address, &segment.data, &mut |pages, _| {
                    let done = (pages * crate::protocol::PAGE_SIZE).min(len);
                    progress(Stage::Program, written + done, total);
                })
                .map_err(|e| e.in_stage(Stage::Program))?;
            written += len;

            if plan.verify {
                let matches = flasher
                    .verify_region(segment.address, &segment.data)
                    .map_err(|e| e.in_stage(Stage::Verify))?;
                if !matches {
                    return Err(Error::VerifyMismatch {
                        address: segment.address,
                    }
                    .in_stage(Stage::Verify));
                }
                debug!("{} verified", segment.name);
                progress(Stage::Verify, written, total);
            }
        }

        for (index, info) in plan
            .device_info
            .iter()
            .enumerate()
        {
            flasher
                .write_info(info.address, &info.data)
                .map_err(|e| e.in_stage(Stage::DeviceInfo))?;
            progress(Stage::DeviceInfo, index + 1, plan.device_info.len());
        }

        flasher
            .set_protection(true)
            .map_err(|e| e.in_stage(Stage::Protect))?;
        progress(Stage::Protect, 1, 1);
        Ok(())
    }

    fn erase<P: Port>(
        &self,
        flasher: &mut Flasher<P>,
        plan: &DownloadPlan,
        progress: StageProgress<'_>,
    ) -> Result<()> {
        match plan.erase {
            EraseMode::None => Ok(()),
            EraseMode::All => flasher.erase(EraseTarget::All, &mut |done, total| {
                progress(Stage::Erase, done, total);
            }),
            EraseMode::Segments => {
                let total = plan.segments.len();
                for (index, segment) in plan
                    .segments
                    .iter()
                    .enumerate()
                {
                    // With read-back, partially covered end sectors are
                    // merged and erased while programming.
                    let region = if flasher.can_read_back() {
                        segment.region()?.whole_sectors()
                    } else {
                        segment.region()?
                    };
                    if !region.is_empty() {
                        debug!("Erasing {region} for {}", segment.name);
                        flasher.erase(EraseTarget::Range(region), &mut |_, _| {})?;
                    }
                    progress(Stage::Erase, index + 1, total);
                }
                Ok(())
            },
        }
    }
}
