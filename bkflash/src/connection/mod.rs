//! Serial link to the target: byte transport, reset, link establishment and
//! command execution.

pub mod executor;
pub mod link;
pub mod reset;

pub use {
    executor::CommandExecutor,
    link::{LinkOutcome, LinkState, establish},
};

use {
    crate::{
        error::{Error, Result},
        port::Port,
    },
    log::{debug, trace},
    std::{
        io::ErrorKind,
        thread,
        time::{Duration, Instant},
    },
};

/// Largest chunk requested from the port in one read call.
const READ_CHUNK: usize = 4352;

/// Pause between polls while a port reports no data.
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Exclusive owner of one serial port.
///
/// The port is closed by [`Transport::close`] or on drop, whichever comes
/// first; closing twice is a no-op.
pub struct Transport<P: Port> {
    port: P,
    open: bool,
}

impl<P: Port> Transport<P> {
    /// Wrap an already opened port.
    pub fn new(port: P) -> Self {
        Self { port, open: true }
    }

    /// Port name.
    pub fn name(&self) -> &str {
        self.port
            .name()
    }

    /// Current baud rate.
    pub fn baud_rate(&self) -> u32 {
        self.port
            .baud_rate()
    }

    /// Whether the port has not been closed yet.
    pub fn is_open(&self) -> bool {
        self.open
    }

    fn ensure_open(&self) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(Error::Transport(format!("{} is closed", self.name())))
        }
    }

    /// Write `bytes` and flush.
    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.ensure_open()?;
        trace!("TX {} bytes: {:02X?}", bytes.len(), &bytes[..bytes.len().min(32)]);
        self.port
            .write_all_bytes(bytes)
    }

    /// Read up to `n` bytes, waiting at most `timeout`.
    ///
    /// Returns fewer than `n` bytes when the deadline passes first.
    pub fn read(&mut self, n: usize, timeout: Duration) -> Result<Vec<u8>> {
        self.ensure_open()?;
        let deadline = Instant::now() + timeout;
        let mut buf = Vec::with_capacity(n);
        let mut chunk = vec![0u8; n.min(READ_CHUNK)];

        while buf.len() < n {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            self.port
                .set_timeout(deadline - now)?;

            let want = (n - buf.len()).min(chunk.len());
            match self
                .port
                .read(&mut chunk[..want])
            {
                Ok(0) => thread::sleep(POLL_INTERVAL),
                Ok(count) => buf.extend_from_slice(&chunk[..count]),
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                    thread::sleep(POLL_INTERVAL);
                },
                Err(e) if e.kind() == ErrorKind::Interrupted => {},
                Err(e) => return Err(e.into()),
            }
        }

        trace!("RX {} of {n} bytes: {:02X?}", buf.len(), &buf[..buf.len().min(32)]);
        Ok(buf)
    }

    /// Drive the DTR and RTS lines.
    pub fn set_reset_lines(&mut self, dtr: bool, rts: bool) -> Result<()> {
        self.ensure_open()?;
        self.port
            .set_dtr(dtr)?;
        self.port
            .set_rts(rts)
    }

    /// Change the baud rate of the open port.
    pub fn reconfigure(&mut self, baud: u32) -> Result<()> {
        self.ensure_open()?;
        debug!("{}: switching host baud rate to {baud}", self.name());
        self.port
            .set_baud_rate(baud)
    }

    /// Drop any buffered input and output.
    pub fn clear(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.port
            .clear_buffers()
    }

    /// Close the port. Safe to call more than once.
    pub fn close(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        self.port
            .close()
    }
}

impl<P: Port> Drop for Transport<P> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            debug!("Error closing port: {e}");
        }
    }
}

#[cfg(feature = "native")]
impl Transport<crate::port::NativePort> {
    /// Open a native serial port at `baud`.
    pub fn open(path: &str, baud: u32) -> Result<Self> {
        let config = crate::port::SerialConfig::new(path, baud);
        crate::port::NativePort::open_with_retry(&config).map(Self::new)
    }
}
