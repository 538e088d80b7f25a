//! In-memory ports for unit tests.
//!
//! [`MockPort`] is a scripted byte pipe. [`SimDevice`] emulates a Beken boot
//! ROM (or secondary bootloader) in front of an in-memory flash array.

use {
    crate::{
        error::{Error, Result},
        port::Port,
        protocol::{
            command::{CHIP_ID_REG, PAGE_SIZE, SECOND_ID_REG, opcode},
            crc::{crc32, decode_page_with_crc},
            frame::{APP_REQUEST_HEADER, FLASH_RESPONSE_HEADER},
        },
    },
    std::{
        collections::VecDeque,
        io::{self, Read, Write},
        sync::{Arc, Mutex, MutexGuard},
        time::Duration,
    },
};

fn timed_out() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "no data")
}

/// Modem line change seen by a [`MockPort`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Line {
    Dtr(bool),
    Rts(bool),
}

#[derive(Debug, Default)]
pub(crate) struct MockState {
    pub rx: VecDeque<u8>,
    pub tx: Vec<u8>,
    pub lines: Vec<Line>,
    pub baud: u32,
    pub clears: usize,
    pub closed: bool,
}

/// Scripted port: reads drain `rx`, writes append to `tx`.
#[derive(Clone)]
pub(crate) struct MockPort {
    state: Arc<Mutex<MockState>>,
    timeout: Duration,
}

impl MockPort {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                baud: 115_200,
                ..MockState::default()
            })),
            timeout: Duration::from_millis(10),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state
            .lock()
            .unwrap()
    }

    pub fn push_rx(&self, bytes: &[u8]) {
        self.state()
            .rx
            .extend(bytes);
    }
}

impl Read for MockPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state();
        if state.closed {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "closed"));
        }
        if state
            .rx
            .is_empty()
        {
            return Err(timed_out());
        }
        let n = buf
            .len()
            .min(
                state
                    .rx
                    .len(),
            );
        for slot in buf.iter_mut().take(n) {
            *slot = state
                .rx
                .pop_front()
                .unwrap();
        }
        Ok(n)
    }
}

impl Write for MockPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state();
        if state.closed {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "closed"));
        }
        state
            .tx
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Port for MockPort {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        self.state().baud = baud_rate;
        Ok(())
    }

    fn baud_rate(&self) -> u32 {
        self.state().baud
    }

    fn clear_buffers(&mut self) -> Result<()> {
        self.state().clears += 1;
        Ok(())
    }

    fn name(&self) -> &str {
        "mock"
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        self.state()
            .lines
            .push(Line::Dtr(level));
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        self.state()
            .lines
            .push(Line::Rts(level));
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.state().closed = true;
        Ok(())
    }
}

/// What the simulated target is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SimMode {
    BootRom,
    Bootloader,
    Application,
    Silent,
}

pub(crate) const SIM_FLASH_SIZE: usize = 0x20_0000;

/// JEDEC ID of a 2 MiB part (capacity byte 0x15).
pub(crate) const SIM_FLASH_MID: u32 = 0x0015_60EB;

#[derive(Debug)]
pub(crate) struct SimState {
    pub mode: SimMode,
    pub link_key: Option<Vec<u8>>,
    pub flash: Vec<u8>,
    pub chip_id: u32,
    pub second_id: u32,
    pub flash_mid: u32,
    pub mid_overstates_length: bool,
    pub status_register: u8,
    pub drop_responses: usize,
    pub corrupt_responses: usize,
    pub reject: Option<(u8, u8)>,
    pub fail_baud_switch: bool,
    pub corrupt_page_writes: usize,
    pub frames: Vec<Vec<u8>>,
    pub link_checks: usize,
    pub erases: Vec<(u8, u32)>,
    pub erase_all: usize,
    pub page_writes: Vec<u32>,
    pub baud_changes: Vec<u32>,
    pub reboots: usize,
    pub resets: usize,
    pub closed: bool,
}

impl Default for SimState {
    fn default() -> Self {
        Self {
            mode: SimMode::BootRom,
            link_key: None,
            flash: vec![0xFF; SIM_FLASH_SIZE],
            chip_id: 0x7231c,
            second_id: 0,
            flash_mid: SIM_FLASH_MID,
            mid_overstates_length: true,
            status_register: 0x1C,
            drop_responses: 0,
            corrupt_responses: 0,
            reject: None,
            fail_baud_switch: false,
            corrupt_page_writes: 0,
            frames: Vec::new(),
            link_checks: 0,
            erases: Vec::new(),
            erase_all: 0,
            page_writes: Vec::new(),
            baud_changes: Vec::new(),
            reboots: 0,
            resets: 0,
            closed: false,
        }
    }
}

impl SimState {
    /// Sector-erase addresses in issue order.
    pub fn sector_erases(&self) -> Vec<u32> {
        self.erases
            .iter()
            .filter(|(cmd, _)| *cmd == 0x20 || *cmd == 0x21)
            .map(|(_, addr)| *addr)
            .collect()
    }

    fn legacy(&self) -> bool {
        self.mode == SimMode::Bootloader
    }
}

/// Boot ROM emulator.
pub(crate) struct SimDevice {
    state: Arc<Mutex<SimState>>,
    name: String,
    pending: Vec<u8>,
    rx: VecDeque<u8>,
    timeout: Duration,
    baud: u32,
}

impl SimDevice {
    pub fn new(name: &str) -> (Self, Arc<Mutex<SimState>>) {
        Self::with_state(name, SimState::default())
    }

    pub fn with_state(name: &str, state: SimState) -> (Self, Arc<Mutex<SimState>>) {
        let state = Arc::new(Mutex::new(state));
        let device = Self {
            state: Arc::clone(&state),
            name: name.to_string(),
            pending: Vec::new(),
            rx: VecDeque::new(),
            timeout: Duration::from_millis(10),
            baud: 115_200,
        };
        (device, state)
    }

    fn process(&mut self) {
        let state = Arc::clone(&self.state);
        let mut state = state
            .lock()
            .unwrap();
        loop {
            if self
                .pending
                .starts_with(b"reboot")
            {
                match self
                    .pending
                    .windows(2)
                    .position(|w| w == b"\r\n")
                {
                    Some(pos) => {
                        self.pending
                            .drain(..pos + 2);
                        state.resets += 1;
                        continue;
                    },
                    None => return,
                }
            }
            if self.pending.len() < 4 {
                return;
            }
            if self.pending[..3] != APP_REQUEST_HEADER {
                self.pending
                    .remove(0);
                continue;
            }
            if self.pending[3] == 0xFF {
                if self.pending.len() < 7 {
                    return;
                }
                let len_bytes = [self.pending[5], self.pending[6]];
                let len = if state.legacy() {
                    u16::from_be_bytes(len_bytes)
                } else {
                    u16::from_le_bytes(len_bytes)
                };
                let total = 7 + usize::from(len);
                if self.pending.len() < total {
                    return;
                }
                let frame: Vec<u8> = self
                    .pending
                    .drain(..total)
                    .collect();
                state
                    .frames
                    .push(frame.clone());
                let reply = handle_flash(&mut state, frame[7], &frame[8..]);
                self.respond(&mut state, reply);
            } else {
                let total = 4 + usize::from(self.pending[3]);
                if self.pending.len() < total {
                    return;
                }
                let frame: Vec<u8> = self
                    .pending
                    .drain(..total)
                    .collect();
                state
                    .frames
                    .push(frame.clone());
                let reply = handle_app(&mut state, frame[4], &frame[5..]);
                self.respond(&mut state, reply);
            }
        }
    }

    fn respond(&mut self, state: &mut SimState, reply: Option<Vec<u8>>) {
        let Some(mut reply) = reply else {
            return;
        };
        if state.mode == SimMode::Silent {
            return;
        }
        if state.drop_responses > 0 {
            state.drop_responses -= 1;
            return;
        }
        if state.corrupt_responses > 0 {
            state.corrupt_responses -= 1;
            reply[0] ^= 0xFF;
        }
        self.rx
            .extend(reply);
    }
}

fn le32(bytes: &[u8], offset: usize) -> u32 {
    bytes
        .get(offset..offset + 4)
        .map_or(0, |b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

fn app_reply(opcode: u8, payload: &[u8]) -> Option<Vec<u8>> {
    let mut out = vec![0x04, 0x0E, u8::try_from(4 + payload.len()).unwrap()];
    out.extend_from_slice(&APP_REQUEST_HEADER);
    out.push(opcode);
    out.extend_from_slice(payload);
    Some(out)
}

fn flash_reply(state: &SimState, status: u8, payload: &[u8], extra_len: usize) -> Option<Vec<u8>> {
    let mut out = FLASH_RESPONSE_HEADER.to_vec();
    let len = u16::try_from(1 + payload.len() + extra_len).unwrap();
    if state.legacy() {
        out.extend_from_slice(&len.to_be_bytes());
    } else {
        out.extend_from_slice(&len.to_le_bytes());
    }
    out.push(status);
    out.extend_from_slice(payload);
    Some(out)
}

fn handle_app(state: &mut SimState, op: u8, payload: &[u8]) -> Option<Vec<u8>> {
    if state.mode == SimMode::Application {
        return Some(b"ap0> unknown command\r\n".to_vec());
    }
    match op {
        opcode::LINK_CHECK => {
            state.link_checks += 1;
            if state.mode != SimMode::BootRom {
                return None;
            }
            if let Some(key) = &state.link_key {
                if payload != key.as_slice() {
                    return None;
                }
            }
            app_reply(opcode::LINK_CHECK_REPLY, &[0x00])
        },
        opcode::BOOTLOADER_LINK_CHECK => {
            state.link_checks += 1;
            if state.mode != SimMode::Bootloader {
                return None;
            }
            app_reply(opcode::BOOTLOADER_LINK_CHECK_REPLY, &[0x00])
        },
        opcode::READ_REG => {
            let address = le32(payload, 0);
            let value = match address {
                CHIP_ID_REG => state.chip_id,
                SECOND_ID_REG => state.second_id,
                _ => 0,
            };
            let mut out = address
                .to_le_bytes()
                .to_vec();
            out.extend_from_slice(&value.to_le_bytes());
            app_reply(op, &out)
        },
        opcode::WRITE_REG => app_reply(op, payload),
        opcode::REBOOT => {
            state.reboots += 1;
            state.resets += 1;
            None
        },
        opcode::SET_BAUDRATE => {
            state
                .baud_changes
                .push(le32(payload, 0));
            if state.fail_baud_switch {
                return None;
            }
            app_reply(op, payload)
        },
        opcode::CHECK_CRC => {
            let start = le32(payload, 0) as usize;
            let end = le32(payload, 4) as usize;
            if end < start || end >= state.flash.len() {
                return None;
            }
            app_reply(op, &crc32(&state.flash[start..=end]).to_le_bytes())
        },
        _ => None,
    }
}

fn handle_flash(state: &mut SimState, op: u8, payload: &[u8]) -> Option<Vec<u8>> {
    if let Some((rejected, status)) = state.reject {
        if rejected == op {
            return flash_reply(state, status, &[], 0);
        }
    }
    let extended = state
        .link_key
        .is_some();
    match op {
        opcode::FLASH_WRITE_4K => {
            let address = le32(payload, 0);
            let body = payload
                .get(4..)
                .unwrap_or_default();
            let data = if extended {
                decode_page_with_crc(body)
            } else {
                Some(body.to_vec())
            };
            let Some(mut data) = data.filter(|d| d.len() == PAGE_SIZE) else {
                return flash_reply(state, 0x04, &[], 0);
            };
            let start = address as usize;
            if start + PAGE_SIZE > state.flash.len() {
                return flash_reply(state, 0x06, &[], 0);
            }
            if state.corrupt_page_writes > 0 {
                state.corrupt_page_writes -= 1;
                data[0] ^= 0x81;
            }
            // NOR programming only clears bits.
            for (cell, byte) in state.flash[start..start + PAGE_SIZE]
                .iter_mut()
                .zip(&data)
            {
                *cell &= byte;
            }
            state
                .page_writes
                .push(address);
            flash_reply(state, 0x00, &address.to_le_bytes(), 0)
        },
        opcode::FLASH_READ_4K => {
            if extended {
                return flash_reply(state, 0x0A, &[], 0);
            }
            let address = le32(payload, 0);
            let start = address as usize;
            if start + PAGE_SIZE > state.flash.len() {
                return flash_reply(state, 0x06, &[], 0);
            }
            let mut out = address
                .to_le_bytes()
                .to_vec();
            out.extend_from_slice(&state.flash[start..start + PAGE_SIZE]);
            flash_reply(state, 0x00, &out, 0)
        },
        opcode::FLASH_ERASE_ALL => {
            state
                .flash
                .fill(0xFF);
            state.erase_all += 1;
            flash_reply(state, 0x00, &[], 0)
        },
        opcode::FLASH_READ_SR => {
            let register = payload
                .first()
                .copied()
                .unwrap_or_default();
            flash_reply(state, 0x00, &[register, state.status_register], 0)
        },
        opcode::FLASH_WRITE_SR => {
            if payload.len() != 2 {
                return flash_reply(state, 0x04, &[], 0);
            }
            state.status_register = payload[1];
            flash_reply(state, 0x00, payload, 0)
        },
        opcode::FLASH_GET_MID => {
            let extra = usize::from(state.mid_overstates_length);
            flash_reply(state, 0x00, &state.flash_mid.to_le_bytes(), extra)
        },
        opcode::FLASH_ERASE => {
            let instruction = payload
                .first()
                .copied()
                .unwrap_or_default();
            let address = le32(payload, 1);
            let size = match instruction {
                0x20 | 0x21 => 0x1000,
                0xD8 | 0xDC => 0x1_0000,
                _ => return flash_reply(state, 0x06, &[], 0),
            };
            let base = (address as usize) & !(size - 1);
            if base + size > state.flash.len() {
                return flash_reply(state, 0x06, &[], 0);
            }
            state.flash[base..base + size].fill(0xFF);
            state
                .erases
                .push((instruction, address));
            flash_reply(state, 0x00, payload, 0)
        },
        _ => flash_reply(state, 0x07, &[], 0),
    }
}

impl Read for SimDevice {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self
            .rx
            .is_empty()
        {
            return Err(timed_out());
        }
        let n = buf
            .len()
            .min(
                self.rx
                    .len(),
            );
        for slot in buf.iter_mut().take(n) {
            *slot = self
                .rx
                .pop_front()
                .unwrap();
        }
        Ok(n)
    }
}

impl Write for SimDevice {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending
            .extend_from_slice(buf);
        self.process();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Port for SimDevice {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        self.baud = baud_rate;
        Ok(())
    }

    fn baud_rate(&self) -> u32 {
        self.baud
    }

    fn clear_buffers(&mut self) -> Result<()> {
        self.rx
            .clear();
        self.pending
            .clear();
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn set_dtr(&mut self, _level: bool) -> Result<()> {
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        if level {
            self.state
                .lock()
                .map_err(|_| Error::Transport("simulator poisoned".into()))?
                .resets += 1;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.state
            .lock()
            .map_err(|_| Error::Transport("simulator poisoned".into()))?
            .closed = true;
        Ok(())
    }
}

/// Session timings short enough for tests.
pub(crate) fn fast_config() -> crate::config::SessionConfig {
    let _ = env_logger::builder()
        .is_test(true)
        .try_init();
    crate::config::SessionConfig {
        max_link_attempts: 5,
        retries: 2,
        command_timeout: Duration::from_millis(20),
        link_check_timeout: Duration::from_millis(5),
        erase_timeout: Duration::from_millis(20),
        erase_all_timeout: Duration::from_millis(50),
        reset_pulse: Duration::ZERO,
        post_reset_delay: Duration::ZERO,
        post_link_delay: Duration::ZERO,
        baud_switch_delay_ms: 0,
        ..crate::config::SessionConfig::default()
    }
}
