//! Byte-level connection to the board.
//!
//! A [`Connection`] wraps a [`Link`] (the serial port in production, a
//! simulated board in tests) and adds the line discipline used by the control
//! channel: bounded reads, reading up to a marker and draining noise. Every
//! read is bounded by an explicit deadline; the board may never answer if its
//! interpreter is in an unexpected state.
//!
//! Only one `Connection` per port name can be open in the process at any time.
//! A second attempt fails immediately with [`Error::PortBusy`].

mod serial;

use std::{
    cmp, fmt,
    sync::Mutex,
    time::{Duration, Instant},
};

use hexplay::HexViewBuilder;
use log::{debug, info, log_enabled, trace, Level::Trace};

use crate::{
    error::{Error, Result},
    settings::Settings,
};

pub use serial::SerialLink;

/// Largest number of bytes taken from the link in a single read.
pub const MAX_READ: usize = 4096;

// =============================================================================
// Public Interface
// =============================================================================

/// A raw, unbuffered byte link to the board.
pub trait Link {
    /// The port identifier, usually the device path.
    fn name(&self) -> String;

    /// Return whatever bytes are available, waiting for some to arrive at the
    /// latest until `deadline`. Fails with [`Error::Timeout`] when nothing was
    /// received in time; never returns an empty buffer.
    fn read(&mut self, deadline: Instant) -> Result<Vec<u8>>;

    /// Write all of `bytes` to the board.
    fn write(&mut self, bytes: &[u8]) -> Result<()>;
}

/// A live session with the board over a [`Link`].
pub struct Connection {
    link: Box<dyn Link>,
    port: String,
    baud_rate: u32,
    read_timeout: Duration,
    /// Bytes received but not consumed yet by the line discipline.
    pending: Vec<u8>,
    open: bool,
    _claim: PortClaim,
}
impl Connection {
    /// Open the serial port described by `settings`.
    ///
    /// Opening the port usually resets the board; the caller must expect a
    /// boot banner before the interpreter prompt.
    pub fn open(settings: &Settings) -> Result<Self> {
        let port = settings.path.clone().ok_or_else(|| Error::Connect {
            port: String::new(),
            reason: "no serial port was specified".into(),
        })?;
        let claim = PortClaim::acquire(&port)?;
        let link = SerialLink::open(&port, settings)?;
        Ok(Connection::from_parts(
            Box::new(link),
            claim,
            settings.baud_rate,
            settings.read_timeout,
        ))
    }

    /// Build a connection over an already open link.
    pub fn with_link(link: Box<dyn Link>, settings: &Settings) -> Result<Self> {
        let claim = PortClaim::acquire(&link.name())?;
        Ok(Connection::from_parts(
            link,
            claim,
            settings.baud_rate,
            settings.read_timeout,
        ))
    }

    fn from_parts(
        link: Box<dyn Link>,
        claim: PortClaim,
        baud_rate: u32,
        read_timeout: Duration,
    ) -> Self {
        let port = claim.port.clone();
        info!("Session opened on {}", port);
        Connection {
            link,
            port,
            baud_rate,
            read_timeout,
            pending: Vec::new(),
            open: true,
            _claim: claim,
        }
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    /// The default deadline for a command's response.
    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Read available bytes, buffered ones first, waiting at most until
    /// `deadline`.
    pub fn read(&mut self, deadline: Instant) -> Result<Vec<u8>> {
        if !self.pending.is_empty() {
            return Ok(std::mem::take(&mut self.pending));
        }
        self.read_link(deadline)
    }

    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.ensure_open()?;
        trace!("=> {} bytes", bytes.len());
        if let Err(err) = self.link.write(bytes) {
            self.fail(&err);
            return Err(err);
        }
        Ok(())
    }

    /// Read until `marker` is seen and return everything received before it.
    /// The marker itself is consumed and any byte after it stays buffered for
    /// the next read.
    ///
    /// Fails with [`Error::Timeout`] if the marker did not show up within
    /// `timeout`, even if the device kept sending. Bytes received so far
    /// remain buffered.
    pub fn read_until(&mut self, marker: &[u8], timeout: Duration) -> Result<Vec<u8>> {
        self.read_until_idle(marker, timeout, timeout)
    }

    /// Like [`Connection::read_until`], but the wait is only bounded by `idle`
    /// while data keeps arriving: the deadline restarts with every chunk. The
    /// whole wait never exceeds `cap`.
    ///
    /// The [`Error::Timeout`] carries `idle` when the line went quiet and
    /// `cap` when the device kept talking past it.
    pub fn read_until_idle(
        &mut self,
        marker: &[u8],
        idle: Duration,
        cap: Duration,
    ) -> Result<Vec<u8>> {
        let give_up = Instant::now() + cap;
        let mut deadline = cmp::min(Instant::now() + idle, give_up);
        let mut searched = 0;
        loop {
            if let Some(pos) = find(&self.pending[searched..], marker) {
                let end = searched + pos;
                let mut head: Vec<u8> = self.pending.drain(..end + marker.len()).collect();
                head.truncate(end);
                return Ok(head);
            }
            // The marker may straddle two reads.
            searched = self.pending.len().saturating_sub(marker.len() - 1);

            let now = Instant::now();
            if now >= give_up {
                return Err(Error::Timeout(cap));
            }
            if now >= deadline {
                return Err(Error::Timeout(idle));
            }
            match self.read_link(deadline) {
                Ok(bytes) => {
                    self.pending.extend_from_slice(&bytes);
                    deadline = cmp::min(Instant::now() + idle, give_up);
                }
                Err(Error::Timeout(_)) if Instant::now() >= give_up => {
                    return Err(Error::Timeout(cap))
                }
                Err(Error::Timeout(_)) => return Err(Error::Timeout(idle)),
                Err(err) => return Err(err),
            }
        }
    }

    /// Read exactly `count` bytes within `timeout`.
    pub fn read_exact(&mut self, count: usize, timeout: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        while self.pending.len() < count {
            if Instant::now() >= deadline {
                return Err(Error::Timeout(timeout));
            }
            match self.read_link(deadline) {
                Ok(bytes) => self.pending.extend_from_slice(&bytes),
                Err(Error::Timeout(_)) => return Err(Error::Timeout(timeout)),
                Err(err) => return Err(err),
            }
        }
        Ok(self.pending.drain(..count).collect())
    }

    /// Discard input until the line stays quiet for `quiet`, or `max` has
    /// elapsed. Returns the number of discarded bytes.
    pub fn drain(&mut self, quiet: Duration, max: Duration) -> Result<usize> {
        let mut discarded = self.pending.len();
        self.pending.clear();
        let give_up = Instant::now() + max;
        loop {
            let now = Instant::now();
            if now >= give_up {
                break;
            }
            let deadline = cmp::min(now + quiet, give_up);
            match self.read_link(deadline) {
                Ok(bytes) => discarded += bytes.len(),
                Err(Error::Timeout(_)) => break,
                Err(err) => return Err(err),
            }
        }
        if discarded > 0 {
            debug!("Discarded {} bytes of device output", discarded);
        }
        Ok(discarded)
    }

    /// Close the connection and release the port. Closing twice is harmless.
    pub fn close(&mut self) {
        if self.open {
            info!("Session on {} closed", self.port);
            self.open = false;
            self.pending.clear();
        }
    }

    fn read_link(&mut self, deadline: Instant) -> Result<Vec<u8>> {
        self.ensure_open()?;
        match self.link.read(deadline) {
            Ok(bytes) => {
                trace!("<= {} bytes", bytes.len());
                // Dump the received data in a hex table for debugging
                if log_enabled!(Trace) {
                    let view = HexViewBuilder::new(&bytes)
                        .address_offset(0)
                        .row_width(16)
                        .finish();
                    trace!("\n{}", view);
                }
                Ok(bytes)
            }
            Err(err) => {
                self.fail(&err);
                Err(err)
            }
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                format!("connection to {} is closed", self.port),
            )))
        }
    }

    /// A fatal I/O error destroys the connection; timeouts do not.
    fn fail(&mut self, err: &Error) {
        if let Error::Io(_) = err {
            info!("error: {}", err);
            self.close();
        }
    }
}
impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Connection")
            .field(&self.port)
            .field(&self.baud_rate)
            .field(&self.open)
            .finish()
    }
}

// =============================================================================
// Private stuff
// =============================================================================

/// Names of the ports currently owned by a connection in this process.
static OPEN_PORTS: Mutex<Vec<String>> = Mutex::new(Vec::new());

/// Exclusive ownership of a port name, released when dropped.
struct PortClaim {
    port: String,
}
impl PortClaim {
    fn acquire(port: &str) -> Result<Self> {
        let mut ports = OPEN_PORTS.lock().unwrap_or_else(|e| e.into_inner());
        if ports.iter().any(|p| p == port) {
            return Err(Error::PortBusy(port.to_owned()));
        }
        ports.push(port.to_owned());
        Ok(PortClaim { port: port.to_owned() })
    }
}
impl Drop for PortClaim {
    fn drop(&mut self) {
        let mut ports = OPEN_PORTS.lock().unwrap_or_else(|e| e.into_inner());
        ports.retain(|p| p != &self.port);
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{sim::SimBoard, SettingsBuilder};

    fn settings() -> Settings {
        SettingsBuilder::new()
            .read_timeout(Duration::from_millis(300))
            .finalize()
    }

    #[test]
    fn second_session_on_same_port_is_busy() {
        let board = SimBoard::new();
        let first = Connection::with_link(Box::new(board.clone()), &settings()).unwrap();
        match Connection::with_link(Box::new(board.clone()), &settings()) {
            Err(Error::PortBusy(port)) => assert_eq!(port, board.name()),
            other => panic!("expected PortBusy, got {:?}", other),
        }
        drop(first);
        assert!(Connection::with_link(Box::new(board), &settings()).is_ok());
    }

    #[test]
    fn read_until_keeps_surplus() {
        let board = SimBoard::new();
        board.emit(b"hello\x04world\x04>");
        let mut conn = Connection::with_link(Box::new(board), &settings()).unwrap();
        let timeout = Duration::from_millis(200);
        assert_eq!(conn.read_until(b"\x04", timeout).unwrap(), b"hello");
        assert_eq!(conn.read_until(b"\x04>", timeout).unwrap(), b"world");
    }

    #[test]
    fn read_until_times_out() {
        let board = SimBoard::new();
        board.emit(b"no marker here");
        let mut conn = Connection::with_link(Box::new(board), &settings()).unwrap();
        let timeout = Duration::from_millis(100);
        match conn.read_until(b"\x04", timeout) {
            Err(Error::Timeout(waited)) => assert_eq!(waited, timeout),
            other => panic!("expected a timeout, got {:?}", other),
        }
        // Nothing was lost
        assert_eq!(conn.read_exact(2, timeout).unwrap(), b"no");
    }

    #[test]
    fn chatty_device_cannot_hold_a_read() {
        // The program prints continuously and never sends the marker.
        let board = SimBoard::busy_for(Duration::from_secs(30));
        let mut conn = Connection::with_link(Box::new(board), &settings()).unwrap();
        let timeout = Duration::from_millis(200);

        let started = Instant::now();
        match conn.read_until(b"\x04>", timeout) {
            Err(Error::Timeout(waited)) => assert_eq!(waited, timeout),
            other => panic!("expected a timeout, got {:?}", other),
        }
        assert!(started.elapsed() < Duration::from_secs(1));

        let started = Instant::now();
        assert!(matches!(
            conn.read_exact(1 << 20, timeout),
            Err(Error::Timeout(_))
        ));
        assert!(started.elapsed() < Duration::from_secs(1));

        let cap = Duration::from_millis(400);
        let started = Instant::now();
        match conn.read_until_idle(b"\x04>", timeout, cap) {
            Err(Error::Timeout(waited)) => assert_eq!(waited, cap),
            other => panic!("expected a timeout, got {:?}", other),
        }
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn idle_deadline_restarts_with_each_byte() {
        let board = SimBoard::new();
        board.set_pace(Duration::from_millis(50));
        board.emit(b"thirty bytes of slow output..\x04");
        let mut conn = Connection::with_link(Box::new(board), &settings()).unwrap();

        let idle = Duration::from_millis(300);
        let output = conn
            .read_until_idle(b"\x04", idle, Duration::from_secs(10))
            .unwrap();
        assert_eq!(output, b"thirty bytes of slow output..");
    }

    #[test]
    fn closed_connection_refuses_io() {
        let board = SimBoard::new();
        let mut conn = Connection::with_link(Box::new(board), &settings()).unwrap();
        conn.close();
        assert!(!conn.is_open());
        assert!(matches!(conn.write(b"x"), Err(Error::Io(_))));
    }

    #[test]
    fn find_marker() {
        assert_eq!(find(b"abc\x04>", b"\x04>"), Some(3));
        assert_eq!(find(b"abc", b"\x04"), None);
        assert_eq!(find(b"", b"\x04"), None);
    }
}
