//! Command execution with retry.
//!
//! A command is encoded once; every retry resends the identical bytes.
//! Timeouts and malformed replies are retried, an explicit device status is
//! returned immediately.

use {
    super::{LinkState, Transport},
    crate::{
        CancelToken,
        error::{CommandFailure, Error, Result},
        port::Port,
        protocol::{Command, DialectSet, ValidationError, validate_response},
    },
    log::{debug, warn},
    std::time::Duration,
};

/// Sends commands over a linked transport.
pub struct CommandExecutor<P: Port> {
    transport: Transport<P>,
    state: LinkState,
    dialects: DialectSet,
    cancel: CancelToken,
}

impl<P: Port> CommandExecutor<P> {
    /// Take over a transport linked in `state`.
    pub fn new(transport: Transport<P>, state: LinkState, cancel: CancelToken) -> Result<Self> {
        let dialects = state
            .dialects()
            .ok_or_else(|| Error::Unsupported(format!("cannot send commands while {state}")))?;
        Ok(Self {
            transport,
            state,
            dialects,
            cancel,
        })
    }

    /// Link state the executor was created for.
    pub fn link_state(&self) -> LinkState {
        self.state
    }

    /// Dialects in use.
    pub fn dialects(&self) -> DialectSet {
        self.dialects
    }

    /// Cancellation token shared with the session.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// The underlying transport.
    pub fn transport(&self) -> &Transport<P> {
        &self.transport
    }

    /// Mutable access to the underlying transport.
    pub fn transport_mut(&mut self) -> &mut Transport<P> {
        &mut self.transport
    }

    /// Send `command` and return its validated response payload.
    ///
    /// The frame is sent at most `retries + 1` times.
    pub fn execute(
        &mut self,
        command: &Command,
        retries: u32,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let frame = command.encode(self.dialects);
        let tries = retries + 1;
        let mut last = CommandFailure::Timeout {
            expected: 0,
            received: 0,
        };

        for attempt in 1..=tries {
            self.cancel
                .check()?;
            self.transport
                .clear()?;
            self.transport
                .write(&frame)?;

            match self.read_reply(command, timeout)? {
                Ok(payload) => {
                    if attempt > 1 {
                        debug!("{} succeeded on attempt {attempt}", command.name());
                    }
                    return Ok(payload);
                },
                Err(CommandFailure::Invalid(e)) if !e.is_transient() => {
                    return Err(Error::Command {
                        command: command.name(),
                        tries: attempt,
                        reason: CommandFailure::Invalid(e),
                    });
                },
                Err(failure) => {
                    if attempt < tries {
                        warn!(
                            "{} attempt {attempt}/{tries} failed: {failure}, retrying",
                            command.name()
                        );
                    }
                    last = failure;
                },
            }
        }

        Err(Error::Command {
            command: command.name(),
            tries,
            reason: last,
        })
    }

    /// Write `command` without waiting for a reply.
    pub fn send(&mut self, command: &Command) -> Result<()> {
        self.cancel
            .check()?;
        self.transport
            .clear()?;
        self.transport
            .write(&command.encode(self.dialects))
    }

    /// Wait once for the reply to a command sent with [`Self::send`].
    pub fn receive(&mut self, command: &Command, timeout: Duration) -> Result<Vec<u8>> {
        self.read_reply(command, timeout)?
            .map_err(|reason| Error::Command {
                command: command.name(),
                tries: 1,
                reason,
            })
    }

    fn read_reply(
        &mut self,
        command: &Command,
        timeout: Duration,
    ) -> Result<std::result::Result<Vec<u8>, CommandFailure>> {
        let Some(expect) = command.expectation(self.dialects) else {
            return Ok(Ok(Vec::new()));
        };
        let expected = expect.response_len();
        let raw = self
            .transport
            .read(expected, timeout)?;

        let validated = validate_response(&raw, &expect)
            .and_then(|payload| command.check_echo(&payload).map(|()| payload));
        Ok(match validated {
            Ok(payload) => Ok(payload),
            // A short reply may still carry an explicit rejection.
            Err(e @ ValidationError::Status(_)) => Err(e.into()),
            Err(_) if raw.len() < expected => Err(CommandFailure::Timeout {
                expected,
                received: raw.len(),
            }),
            Err(e) => Err(e.into()),
        })
    }

    /// Close the transport.
    pub fn close(&mut self) -> Result<()> {
        self.transport
            .close()
    }
}
