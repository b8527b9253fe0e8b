//! Interpreter control channel: drives the MicroPython prompt over a
//! [`Connection`].
//!
//! The prompt is a global mutable resource with a strict request/response
//! discipline, modelled as the following state machine:
//!
//! ```text
//!   Unknown ---> Interrupting ---> RawMode ---> Ready <---> Executing
//!      ^              |  ^            |           |             |
//!      |              |  '-- retry ---'           |          timeout
//!      |              '--> DeviceUnresponsive     v             |
//!      '------------------------------------- Exited <----------'
//!                                                  (via Unknown)
//! ```
//!
//! In raw mode a command is written as a block of text followed by `Ctrl-D`.
//! The interpreter acknowledges with `OK`, then sends the command output
//! terminated by `0x04`, then the error output terminated by `0x04 '>'`.
//! Marker matching is the only place where the channel interprets what the
//! device sends.

use std::{borrow::Cow, cmp, fmt, thread, time::Duration};

use log::{debug, info, trace, warn};

use crate::{
    error::{Error, Result},
    settings::Settings,
    transport::Connection,
};

/// `Ctrl-C` twice, to stop whatever program is running.
pub const INTERRUPT: &[u8] = b"\r\x03\x03";
/// `Ctrl-A`, to enter raw mode from the friendly prompt.
pub const ENTER_RAW_MODE: &[u8] = b"\r\x01";
/// `Ctrl-B`, to go back to the friendly prompt.
pub const EXIT_RAW_MODE: &[u8] = b"\r\x02";
/// `Ctrl-D` at the friendly prompt soft resets the interpreter.
pub const SOFT_RESET: &[u8] = b"\x04";
/// `Ctrl-D` in raw mode executes the submitted block.
pub const EXECUTE: &[u8] = b"\x04";

/// Acknowledgment printed by the interpreter when raw mode is entered.
pub const RAW_MODE_ACK: &[u8] = b"raw REPL; CTRL-B to exit\r\n>";
/// Acknowledgment of a submitted block.
pub const EXECUTE_ACK: &[u8] = b"OK";
/// Terminates the normal output of a command.
pub const OUTPUT_END: &[u8] = b"\x04";
/// Terminates the error output of a command, followed by the raw prompt.
pub const ERROR_END: &[u8] = b"\x04>";

/// How long the line must stay silent before an interrupt is considered
/// digested.
const QUIET_PERIOD: Duration = Duration::from_millis(100);

/// Commands are written in bursts of this size, spaced by [`WRITE_PAUSE`],
/// so that the interpreter's UART buffer is not overrun.
const WRITE_BURST: usize = 256;
const WRITE_PAUSE: Duration = Duration::from_millis(10);

// =============================================================================
// Public Interface
// =============================================================================

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ChannelState {
    /// Just connected or lost track of the prompt; a program may be running.
    Unknown,
    Interrupting,
    RawMode,
    /// In raw mode, waiting for the next command.
    Ready,
    Executing,
    /// Raw mode was left and the connection closed.
    Exited,
}

/// Outcome of one command.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CommandResult {
    /// Everything the command printed, byte for byte.
    pub output: Vec<u8>,
    /// The traceback text when the command raised.
    pub error: Option<String>,
}
impl CommandResult {
    pub fn success(&self) -> bool {
        self.error.is_none()
    }

    pub fn output_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.output)
    }
}

pub struct ControlChannel {
    conn: Connection,
    state: ChannelState,
    handshake_timeout: Duration,
    command_timeout: Duration,
    interrupt_attempts: u32,
    soft_reset_on_exit: bool,
}
impl ControlChannel {
    pub fn new(conn: Connection, settings: &Settings) -> Self {
        ControlChannel {
            conn,
            state: ChannelState::Unknown,
            handshake_timeout: settings.handshake_timeout,
            command_timeout: settings.command_timeout,
            interrupt_attempts: settings.interrupt_attempts,
            soft_reset_on_exit: settings.soft_reset_on_exit,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn port(&self) -> &str {
        self.conn.port()
    }

    /// Interrupt any running program and enter raw mode, discarding whatever
    /// the board printed in the meantime.
    ///
    /// The interrupt is repeated up to the configured number of attempts, each
    /// one waiting at most the handshake timeout for the raw mode banner.
    pub fn enter_raw_mode(&mut self) -> Result<()> {
        if self.state == ChannelState::Exited {
            return Err(Error::Protocol("the control channel was closed".into()));
        }

        for attempt in 1..=self.interrupt_attempts {
            debug!("Interrupt attempt {}/{}", attempt, self.interrupt_attempts);
            self.state = ChannelState::Interrupting;
            self.conn.write(INTERRUPT)?;
            self.conn.drain(QUIET_PERIOD, self.handshake_timeout)?;

            self.state = ChannelState::RawMode;
            self.conn.write(ENTER_RAW_MODE)?;
            match self.conn.read_until(RAW_MODE_ACK, self.handshake_timeout) {
                Ok(stray) => {
                    if !stray.is_empty() {
                        trace!(
                            "Ignored {} bytes before raw mode: {:?}",
                            stray.len(),
                            String::from_utf8_lossy(&stray)
                        );
                    }
                    self.state = ChannelState::Ready;
                    info!("Raw mode entered on {}", self.conn.port());
                    return Ok(());
                }
                Err(Error::Timeout(_)) => {
                    debug!("No raw mode banner after attempt {}", attempt);
                }
                Err(err) => {
                    self.state = ChannelState::Unknown;
                    return Err(err);
                }
            }
        }

        self.state = ChannelState::Unknown;
        Err(Error::DeviceUnresponsive {
            attempts: self.interrupt_attempts,
        })
    }

    /// Bring the channel back to [`ChannelState::Ready`] after a failed
    /// command. Never invoked by the channel itself.
    pub fn resync(&mut self) -> Result<()> {
        info!("Re-synchronizing with the board on {}", self.conn.port());
        self.enter_raw_mode()
    }

    /// Submit one command and collect its result.
    ///
    /// A command that raises on the board is not an error at this level: its
    /// traceback is returned in [`CommandResult::error`]. Any violation of the
    /// framing, including a missing marker, is an [`Error::Protocol`] and
    /// leaves the channel in [`ChannelState::Unknown`].
    pub fn execute(&mut self, command: &[u8]) -> Result<CommandResult> {
        if self.state != ChannelState::Ready {
            return Err(Error::Protocol(format!(
                "cannot submit a command while {:?}",
                self.state
            )));
        }
        if let Some(b) = command.iter().find(|b| (0x01..=0x04).contains(*b)) {
            return Err(Error::Protocol(format!(
                "command contains the reserved byte {:#04x}",
                b
            )));
        }

        self.state = ChannelState::Executing;
        trace!("exec: {}", String::from_utf8_lossy(command));
        match self.submit(command) {
            Ok(result) => {
                self.state = ChannelState::Ready;
                Ok(result)
            }
            Err(err) => {
                warn!("Lost the command framing: {}", err);
                self.state = ChannelState::Unknown;
                Err(err)
            }
        }
    }

    /// Leave raw mode (optionally soft resetting the interpreter) and close the
    /// connection. Closing twice is harmless.
    pub fn close(&mut self) -> Result<()> {
        if self.state == ChannelState::Exited {
            return Ok(());
        }
        let mut result = Ok(());
        if self.conn.is_open() {
            result = self.conn.write(EXIT_RAW_MODE);
            if result.is_ok() && self.soft_reset_on_exit {
                debug!("Soft resetting the interpreter");
                result = self.conn.write(SOFT_RESET);
            }
        }
        self.conn.close();
        self.state = ChannelState::Exited;
        result
    }

    fn submit(&mut self, command: &[u8]) -> Result<CommandResult> {
        for burst in command.chunks(WRITE_BURST) {
            self.conn.write(burst)?;
            if burst.len() == WRITE_BURST {
                thread::sleep(WRITE_PAUSE);
            }
        }
        self.conn.write(EXECUTE)?;

        // A long command keeps the line busy; only silence counts against it.
        let timeout = self.conn.read_timeout();
        let cap = cmp::max(self.command_timeout, timeout);
        let ack = self
            .conn
            .read_exact(EXECUTE_ACK.len(), timeout)
            .map_err(|e| missing_marker(e, "command acknowledgment"))?;
        if ack != EXECUTE_ACK {
            return Err(Error::Protocol(format!(
                "expected {:?}, got {:?}",
                String::from_utf8_lossy(EXECUTE_ACK),
                String::from_utf8_lossy(&ack)
            )));
        }

        let output = self
            .conn
            .read_until_idle(OUTPUT_END, timeout, cap)
            .map_err(|e| missing_marker(e, "end of output marker"))?;
        let error = self
            .conn
            .read_until_idle(ERROR_END, timeout, cap)
            .map_err(|e| missing_marker(e, "end of error marker"))?;

        let error = if error.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&error).into_owned())
        };
        Ok(CommandResult { output, error })
    }
}
impl fmt::Debug for ControlChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlChannel")
            .field("conn", &self.conn)
            .field("state", &self.state)
            .finish()
    }
}

// =============================================================================
// Private stuff
// =============================================================================

/// A timeout while waiting for a marker means the framing is lost: partial
/// output could otherwise be read as the next command's result.
fn missing_marker(err: Error, what: &str) -> Error {
    match err {
        Error::Timeout(waited) => {
            Error::Protocol(format!("no {} within {:?}", what, waited))
        }
        other => other,
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
