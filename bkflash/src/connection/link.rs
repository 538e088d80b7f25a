//! Link establishment: reset the target and catch its boot ROM.

use {
    super::{Transport, reset::reset_target},
    crate::{
        CancelToken,
        config::{LinkCheckKind, SessionConfig},
        error::{Error, Result},
        port::Port,
        protocol::{Command, DialectSet, validate_response},
    },
    log::{debug, info, trace},
    std::{fmt, thread::sleep},
};

/// What the target is currently running, as far as the host knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum LinkState {
    /// No handshake completed.
    #[default]
    Unlinked,
    /// Boot ROM, plain dialect.
    BootRom,
    /// Secondary bootloader (legacy flash dialect).
    SecondaryBootloader,
    /// Boot ROM unlocked with a link key.
    BootRomExtended,
    /// Application firmware answered instead of a loader.
    Application,
}

impl LinkState {
    /// Dialects usable in this state, or `None` when no loader is linked.
    pub fn dialects(self) -> Option<DialectSet> {
        match self {
            Self::BootRom => Some(DialectSet::BOOT_ROM),
            Self::BootRomExtended => Some(DialectSet::BOOT_ROM_EXTENDED),
            Self::SecondaryBootloader => Some(DialectSet::SECONDARY_BOOTLOADER),
            Self::Unlinked | Self::Application => None,
        }
    }

    /// Whether commands can be sent.
    pub fn is_linked(self) -> bool {
        self.dialects()
            .is_some()
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unlinked => write!(f, "unlinked"),
            Self::BootRom => write!(f, "boot ROM"),
            Self::SecondaryBootloader => write!(f, "secondary bootloader"),
            Self::BootRomExtended => write!(f, "boot ROM (extended)"),
            Self::Application => write!(f, "application"),
        }
    }
}

/// Result of a successful [`establish`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkOutcome {
    /// Linked state.
    pub state: LinkState,
    /// Attempts used, counting the successful one.
    pub attempts: u32,
}

enum Probe {
    Linked,
    Application,
    Silent,
}

fn looks_like_console(raw: &[u8]) -> bool {
    !raw.is_empty()
        && raw
            .iter()
            .all(|b| b.is_ascii_graphic() || b.is_ascii_whitespace())
}

fn probe<P: Port>(
    transport: &mut Transport<P>,
    command: &Command,
    config: &SessionConfig,
) -> Result<Probe> {
    let Some(expect) = command.expectation(DialectSet::BOOT_ROM) else {
        return Ok(Probe::Silent);
    };
    transport.write(&command.encode(DialectSet::BOOT_ROM))?;
    let raw = transport.read(expect.response_len(), config.link_check_timeout)?;
    if raw.is_empty() {
        return Ok(Probe::Silent);
    }

    let reply = validate_response(&raw, &expect).and_then(|payload| command.check_echo(&payload));
    match reply {
        Ok(()) => Ok(Probe::Linked),
        Err(_) if looks_like_console(&raw) => {
            trace!("Console output: {:?}", String::from_utf8_lossy(&raw));
            Ok(Probe::Application)
        },
        Err(e) => {
            debug!("Ignoring unexpected link-check reply: {e}");
            Ok(Probe::Silent)
        },
    }
}

/// Handshakes to try, in order, with the state each one proves.
fn handshakes(config: &SessionConfig) -> Vec<(Command, LinkState)> {
    let rom = match &config.link_key {
        Some(key) => (
            Command::LinkCheck {
                key: Some(key.clone()),
            },
            LinkState::BootRomExtended,
        ),
        None => (Command::LinkCheck { key: None }, LinkState::BootRom),
    };
    let bootloader = (Command::BootloaderLinkCheck, LinkState::SecondaryBootloader);
    match config.link_check {
        LinkCheckKind::BootRom => vec![rom],
        LinkCheckKind::Bootloader => vec![bootloader],
        LinkCheckKind::Mixed => vec![rom, bootloader],
    }
}

/// Reset the target and wait for a link-check reply.
///
/// Makes exactly `config.max_link_attempts` attempts before failing with
/// [`Error::LinkEstablishment`].
pub fn establish<P: Port>(
    transport: &mut Transport<P>,
    config: &SessionConfig,
    cancel: &CancelToken,
) -> Result<LinkOutcome> {
    let handshakes = handshakes(config);
    let mut seen_application = false;

    for attempt in 1..=config.max_link_attempts {
        cancel.check()?;

        reset_target(transport, config.reset, attempt, config.reset_pulse)?;
        sleep(config.post_reset_delay);
        transport.clear()?;

        for (command, state) in &handshakes {
            match probe(transport, command, config)? {
                Probe::Linked => {
                    info!(
                        "{}: linked to {state} after {attempt} attempt(s)",
                        transport.name()
                    );
                    return Ok(LinkOutcome {
                        state: *state,
                        attempts: attempt,
                    });
                },
                Probe::Application => {
                    if !seen_application {
                        info!(
                            "{}: target is running application firmware, resetting",
                            transport.name()
                        );
                        seen_application = true;
                    }
                },
                Probe::Silent => {},
            }
        }
        debug!(
            "{}: link attempt {attempt}/{} failed",
            transport.name(),
            config.max_link_attempts
        );
    }

    Err(Error::LinkEstablishment {
        attempts: config.max_link_attempts,
    })
}
