//! Flash operation sequencer.
//!
//! [`Flasher`] turns region-level requests (erase, program, verify, protect)
//! into sequences of boot ROM commands on a linked [`CommandExecutor`].

use {
    super::{
        chip::{ChipFamily, ChipId},
        flash_info::{EraseTarget, FlashInfo, FlashRegion, SECTOR_SIZE, SR_READ, SR_WRITE, erase_plan},
    },
    crate::{
        config::SessionConfig,
        connection::CommandExecutor,
        error::{Error, Result},
        port::Port,
        protocol::{
            Command, PAGE_SIZE,
            command::{CHIP_ID_REG, SECOND_ID_REG},
            crc::crc32,
        },
    },
    byteorder::{ByteOrder, LittleEndian},
    log::{debug, info, trace, warn},
    std::{sync::Arc, thread::sleep, time::Duration},
};

/// Extra time allowed for the baud rate echo beyond the switch delay.
const BAUD_ECHO_MARGIN: Duration = Duration::from_millis(500);

/// Time allowed for the ROM to checksum one sector during `CheckCrc`.
const CRC_TIME_PER_SECTOR: Duration = Duration::from_millis(2);

/// Progress callback: `(done, total)` in units of the current operation.
pub type Progress<'a> = &'a mut dyn FnMut(usize, usize);

fn to_address(value: u64) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| Error::FlashOperation(format!("address {value:#x} out of range")))
}

fn is_blank(bytes: &[u8]) -> bool {
    bytes
        .iter()
        .all(|&b| b == 0xFF)
}

fn region_for(start: u32, len: usize) -> Result<FlashRegion> {
    let len = u32::try_from(len)
        .map_err(|_| Error::FlashOperation(format!("{len} bytes do not fit in flash")))?;
    Ok(FlashRegion::new(start, len))
}

/// Flash sequencer for one linked target.
pub struct Flasher<P: Port> {
    executor: CommandExecutor<P>,
    config: Arc<SessionConfig>,
    chip: Option<ChipId>,
    flash: Option<FlashInfo>,
    skip_blank_pages: bool,
}

impl<P: Port> Flasher<P> {
    /// Wrap a linked executor.
    pub fn new(executor: CommandExecutor<P>, config: Arc<SessionConfig>) -> Self {
        Self {
            executor,
            config,
            chip: None,
            flash: None,
            skip_blank_pages: false,
        }
    }

    /// The underlying executor.
    pub fn executor(&self) -> &CommandExecutor<P> {
        &self.executor
    }

    /// Chip identity, once read or overridden.
    pub fn chip(&self) -> Option<ChipId> {
        self.chip
    }

    /// Flash identity, once read.
    pub fn flash(&self) -> Option<FlashInfo> {
        self.flash
    }

    /// Skip pages that are entirely 0xFF. Only valid when the target range
    /// has been erased first.
    pub fn set_skip_blank_pages(&mut self, skip: bool) {
        self.skip_blank_pages = skip;
    }

    fn run(&mut self, command: &Command, timeout: Duration) -> Result<Vec<u8>> {
        self.executor
            .execute(command, self.config.retries, timeout)
    }

    /// Read a 32-bit register.
    pub fn read_reg(&mut self, address: u32) -> Result<u32> {
        let payload = self.run(&Command::ReadReg { address }, self.config.command_timeout)?;
        Ok(LittleEndian::read_u32(&payload[4..8]))
    }

    /// Write a 32-bit register.
    pub fn write_reg(&mut self, address: u32, value: u32) -> Result<()> {
        self.run(&Command::WriteReg { address, value }, self.config.command_timeout)
            .map(|_| ())
    }

    /// Identify the chip, or trust the configured override.
    pub fn read_chip_id(&mut self) -> Result<ChipId> {
        let chip = if let Some(id) = self.config.chip_id {
            debug!("Using configured chip id {id:#x}");
            ChipId::resolve(id, None)?
        } else {
            let id = self.read_reg(CHIP_ID_REG)?;
            let second_id = if ChipFamily::needs_second_id(id) {
                Some(self.read_reg(SECOND_ID_REG)?)
            } else {
                None
            };
            ChipId::resolve(id, second_id)?
        };
        info!("Chip: {chip}");
        self.chip = Some(chip);
        Ok(chip)
    }

    /// Read the flash JEDEC ID and derive its size.
    pub fn read_flash_mid(&mut self) -> Result<FlashInfo> {
        let payload = self.run(&Command::GetFlashMid, self.config.command_timeout)?;
        let info = FlashInfo::from_mid(LittleEndian::read_u32(&payload))?;
        info!("Flash: {info}");
        self.flash = Some(info);
        Ok(info)
    }

    fn flash_info(&self) -> Result<FlashInfo> {
        self.flash
            .ok_or_else(|| Error::FlashOperation("flash id has not been read".into()))
    }

    fn check_region(&self, region: FlashRegion) -> Result<()> {
        self.flash_info()?
            .check_region(region)
    }

    /// Move both ends of the link to `baud`.
    ///
    /// The target switches `delay_ms` after receiving the request and then
    /// echoes it at the new rate.
    pub fn set_baudrate(&mut self, baud: u32, delay_ms: u8) -> Result<()> {
        let previous = self
            .executor
            .transport()
            .baud_rate();
        if previous == baud {
            debug!("Already at {baud} baud");
            return Ok(());
        }

        let command = Command::SetBaudrate { baud, delay_ms };
        let delay = Duration::from_millis(u64::from(delay_ms));
        self.executor
            .send(&command)?;
        sleep(delay / 2);
        self.executor
            .transport_mut()
            .reconfigure(baud)?;

        match self
            .executor
            .receive(&command, delay + BAUD_ECHO_MARGIN)
        {
            Ok(_) => {
                info!("Switched to {baud} baud");
                Ok(())
            },
            Err(e) if e.is_cancelled() => Err(e),
            Err(e) => {
                if let Err(restore) = self
                    .executor
                    .transport_mut()
                    .reconfigure(previous)
                {
                    warn!("Could not restore {previous} baud: {restore}");
                }
                Err(Error::FlashOperation(format!(
                    "baud rate switch to {baud} failed: {e}"
                )))
            },
        }
    }

    fn erase_sector(&mut self, address: u32) -> Result<()> {
        let ext = self
            .flash
            .is_some_and(|f| f.uses_ext_address());
        for (size, address) in erase_plan(FlashRegion::new(address, SECTOR_SIZE), ext) {
            self.run(&Command::FlashErase { size, address }, self.config.erase_timeout)?;
        }
        Ok(())
    }

    /// Erase the whole chip or the sectors covering a region.
    pub fn erase(&mut self, target: EraseTarget, progress: Progress<'_>) -> Result<()> {
        match target {
            EraseTarget::All => {
                info!("Erasing entire flash");
                self.run(&Command::FlashEraseAll, self.config.erase_all_timeout)?;
                progress(1, 1);
            },
            EraseTarget::Range(region) => {
                self.check_region(region)?;
                let ext = self
                    .flash_info()?
                    .uses_ext_address();
                let plan = erase_plan(region, ext);
                debug!("Erasing {region} with {} command(s)", plan.len());

                let total = plan.len();
                for (index, (size, address)) in plan.into_iter().enumerate() {
                    trace!("Erase {size:?} at {address:#010x}");
                    self.run(&Command::FlashErase { size, address }, self.config.erase_timeout)?;
                    progress(index + 1, total);
                }
            },
        }
        Ok(())
    }

    fn read_page(&mut self, address: u32) -> Result<Vec<u8>> {
        let mut payload = self.run(&Command::FlashRead4K { address }, self.config.command_timeout)?;
        Ok(payload.split_off(4))
    }

    /// Write one page and have the target checksum what it stored.
    fn write_and_check_page(&mut self, address: u32, page: &[u8]) -> Result<()> {
        self.run(
            &Command::FlashWrite4K {
                address,
                data: page.to_vec(),
            },
            self.config.command_timeout,
        )?;

        let end = address + (SECTOR_SIZE - 1);
        let payload = self.run(
            &Command::CheckCrc { start: address, end },
            self.config.command_timeout + CRC_TIME_PER_SECTOR,
        )?;
        let actual = LittleEndian::read_u32(&payload);
        let wanted = crc32(page);
        if actual != wanted {
            debug!("Page {address:#010x}: target CRC {actual:#010x}, image {wanted:#010x}");
            return Err(Error::VerifyMismatch { address });
        }
        Ok(())
    }

    fn write_page(&mut self, address: u32, page: &[u8]) -> Result<()> {
        debug_assert_eq!(page.len(), PAGE_SIZE);
        match self.write_and_check_page(address, page) {
            Ok(()) => Ok(()),
            Err(e) if e.is_cancelled() => Err(e),
            Err(e) => {
                warn!("Write at {address:#010x} failed ({e}), erasing sector and retrying");
                self.erase_sector(address)?;
                self.write_and_check_page(address, page)
            },
        }
    }

    /// Whether the link allows reading flash back.
    pub fn can_read_back(&self) -> bool {
        self.executor
            .dialects()
            .readback
    }

    fn require_readback(&self, what: &str) -> Result<()> {
        if self.can_read_back() {
            Ok(())
        } else {
            Err(Error::Unsupported(format!(
                "{what} needs flash read-back, which the {} link does not allow",
                self.executor.link_state()
            )))
        }
    }

    /// Program `data` at `start`, one 4 KiB page at a time.
    ///
    /// Every page is checksummed by the target after writing and rewritten
    /// once after a sector erase if it does not match.
    ///
    /// When the link allows read-back, a partially covered sector at either
    /// end keeps the bytes outside `data`: the sector is read, merged and
    /// erased first unless the bytes being replaced are already blank.
    /// Otherwise the last page is padded with 0xFF and an unaligned start is
    /// rejected.
    pub fn program_region(&mut self, start: u32, data: &[u8], progress: Progress<'_>) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let region = region_for(start, data.len())?;
        self.check_region(region)?;

        let head = (start % SECTOR_SIZE) as usize;
        let base = start - head as u32;
        let end = head + data.len();
        let tail = end % PAGE_SIZE;
        let mut image = Vec::with_capacity(end.div_ceil(PAGE_SIZE) * PAGE_SIZE);
        // Pages, by index, that must be erased before they are written.
        let mut needs_erase = Vec::new();

        let mut first_sector = None;
        if head > 0 {
            self.require_readback("an unaligned start address")?;
            debug!("Keeping {head} existing bytes before {start:#010x}");
            let existing = self.read_page(base)?;
            if !is_blank(&existing[head..end.min(PAGE_SIZE)]) {
                needs_erase.push(0);
            }
            image.extend_from_slice(&existing[..head]);
            first_sector = Some(existing);
        }
        image.extend_from_slice(data);

        if tail > 0 && self.can_read_back() {
            let last = end / PAGE_SIZE;
            let existing = match first_sector {
                Some(existing) if last == 0 => existing,
                _ => self.read_page(to_address(u64::from(base) + (last * PAGE_SIZE) as u64)?)?,
            };
            let lo = if last == 0 { head } else { 0 };
            debug!(
                "Keeping {} existing bytes after {:#x}",
                PAGE_SIZE - tail,
                region.end()
            );
            if !is_blank(&existing[lo..tail]) && !needs_erase.contains(&last) {
                needs_erase.push(last);
            }
            image.extend_from_slice(&existing[tail..]);
        } else {
            image.resize(end.div_ceil(PAGE_SIZE) * PAGE_SIZE, 0xFF);
        }

        let total = image.len() / PAGE_SIZE;
        let mut address = u64::from(base);
        let mut skipped = 0;
        for (index, page) in image
            .chunks(PAGE_SIZE)
            .enumerate()
        {
            self.executor
                .cancel_token()
                .check()?;
            let page_address = to_address(address)?;
            let erased = needs_erase.contains(&index);
            if erased {
                trace!("Erasing partially covered sector {page_address:#010x}");
                self.erase_sector(page_address)?;
            }
            if (self.skip_blank_pages || erased) && is_blank(page) {
                skipped += 1;
            } else {
                self.write_page(page_address, page)?;
            }
            address += u64::from(SECTOR_SIZE);
            progress(index + 1, total);
        }
        if skipped > 0 {
            debug!("Skipped {skipped} blank page(s)");
        }
        Ok(())
    }

    /// Read `len` bytes starting at `start`.
    pub fn read_region(&mut self, start: u32, len: u32, progress: Progress<'_>) -> Result<Vec<u8>> {
        self.require_readback("reading flash")?;
        let region = FlashRegion::new(start, len);
        self.check_region(region)?;

        let (first, last) = region.sector_bounds();
        let total = usize::try_from((last - first) / u64::from(SECTOR_SIZE)).unwrap_or(usize::MAX);
        let mut out = Vec::with_capacity(len as usize);
        let mut address = first;
        let mut done = 0;
        while address < last {
            self.executor
                .cancel_token()
                .check()?;
            let page = self.read_page(to_address(address)?)?;
            let lo = u64::from(start).max(address) - address;
            let hi = region
                .end()
                .min(address + u64::from(SECTOR_SIZE))
                - address;
            out.extend_from_slice(&page[lo as usize..hi as usize]);
            address += u64::from(SECTOR_SIZE);
            done += 1;
            progress(done, total);
        }
        Ok(out)
    }

    /// Compare flash contents at `start` with `expected`.
    ///
    /// Reads the data back when the link allows it, otherwise compares the
    /// target's CRC32 of the range.
    pub fn verify_region(&mut self, start: u32, expected: &[u8]) -> Result<bool> {
        if expected.is_empty() {
            return Ok(true);
        }
        let region = region_for(start, expected.len())?;
        self.check_region(region)?;

        if self.can_read_back() {
            let actual = self.read_region(start, region.len, &mut |_, _| {})?;
            return Ok(actual == expected);
        }

        let end = to_address(region.end() - 1)?;
        let sectors = u32::try_from(region.len.div_ceil(SECTOR_SIZE)).unwrap_or(u32::MAX);
        let timeout = self.config.command_timeout + CRC_TIME_PER_SECTOR * sectors;
        let payload = self.run(&Command::CheckCrc { start, end }, timeout)?;
        let actual = LittleEndian::read_u32(&payload);
        let wanted = crc32(expected);
        debug!("CRC of {region}: target {actual:#010x}, image {wanted:#010x}");
        Ok(actual == wanted)
    }

    /// Set or clear the flash block-protect bits and read them back.
    pub fn set_protection(&mut self, protect: bool) -> Result<()> {
        let mask = self
            .flash_info()?
            .protect_mask();
        let value = if protect { mask } else { 0x00 };
        self.run(
            &Command::FlashWriteSr {
                register: SR_WRITE,
                value,
            },
            self.config.command_timeout,
        )?;

        let payload = self.run(&Command::FlashReadSr { register: SR_READ }, self.config.command_timeout)?;
        let actual = payload
            .get(1)
            .copied()
            .unwrap_or_default();
        if actual & mask != value {
            return Err(Error::FlashOperation(format!(
                "status register reads {actual:#04x}, expected protect bits {value:#04x}"
            )));
        }
        debug!("Flash {}", if protect { "protected" } else { "unprotected" });
        Ok(())
    }

    /// Patch `bytes` into flash at `address`, keeping the rest of its
    /// sector.
    pub fn write_info(&mut self, address: u32, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        let offset = (address % SECTOR_SIZE) as usize;
        if offset + bytes.len() > PAGE_SIZE {
            return Err(Error::FlashOperation(format!(
                "{} bytes at {address:#010x} cross a sector boundary",
                bytes.len()
            )));
        }
        self.check_region(region_for(address, bytes.len())?)?;
        self.require_readback("writing device info")?;

        let base = address - offset as u32;
        let mut sector = self.read_page(base)?;
        sector[offset..offset + bytes.len()].copy_from_slice(bytes);
        self.erase_sector(base)?;
        self.write_page(base, &sector)?;

        if !self.verify_region(base, &sector)? {
            return Err(Error::VerifyMismatch { address: base });
        }
        debug!("Wrote {} info byte(s) at {address:#010x}", bytes.len());
        Ok(())
    }

    /// Reboot into the application. The target does not answer.
    pub fn reboot(&mut self) -> Result<()> {
        info!("Rebooting target");
        self.executor
            .send(&Command::Reboot)
    }

    /// Close the serial port.
    pub fn close(&mut self) -> Result<()> {
        self.executor
            .close()
    }
}
