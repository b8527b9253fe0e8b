//! Error taxonomy shared by every layer of `mpsync`.
//!
//! Lower layers (transport, control channel, remote filesystem) always surface
//! a typed failure and never retry on their own. The sync session is the only
//! place where [`Error::is_transient`] is consulted to decide on a retry.

use std::{fmt, io, time::Duration};

use thiserror::Error;

// =============================================================================
// Public Interface
// =============================================================================

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Classes of faults reported by the device while running a command.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RemoteErrorKind {
    NotFound,
    AlreadyExists,
    NoSpace,
    PermissionDenied,
    Io,
    Other,
}
impl fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RemoteErrorKind::NotFound => "not found",
            RemoteErrorKind::AlreadyExists => "already exists",
            RemoteErrorKind::NoSpace => "no space left on device",
            RemoteErrorKind::PermissionDenied => "permission denied",
            RemoteErrorKind::Io => "I/O error",
            RemoteErrorKind::Other => "remote error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    /// The serial port could not be opened.
    #[error("cannot open `{port}`: {reason}")]
    Connect { port: String, reason: String },

    /// Another session already owns the port.
    #[error("port `{0}` is already in use by another session")]
    PortBusy(String),

    /// A bounded read expired before any data arrived.
    #[error("timed out after {0:?} waiting for the device")]
    Timeout(Duration),

    #[error("serial I/O error: {0}")]
    Io(#[from] io::Error),

    /// The interrupt / raw mode handshake failed on every attempt.
    #[error("device did not enter raw mode after {attempts} interrupt attempts")]
    DeviceUnresponsive { attempts: u32 },

    /// Marker framing was violated, or the markers never came.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A fault raised by the interpreter on the device, with its own message.
    #[error("{kind} on `{path}`: {message}")]
    Remote {
        kind: RemoteErrorKind,
        path: String,
        message: String,
    },

    #[error("cannot read local file `{path}`: {source}")]
    Local { path: String, source: io::Error },

    /// The local and remote trees disagree on whether `path` is a file or a
    /// directory.
    #[error("`{path}` is a {remote} on the device but a {local} locally")]
    Conflict {
        path: String,
        local: &'static str,
        remote: &'static str,
    },

    /// A plan step failed and the session was aborted.
    #[error("step {index} ({step}) failed: {source}")]
    Step {
        index: usize,
        step: String,
        #[source]
        source: Box<Error>,
    },

    #[error("sync cancelled")]
    Cancelled,
}

impl Error {
    /// Whether retrying the same operation after re-synchronizing the control
    /// channel has a chance to succeed. A serial I/O error closes the
    /// connection, so nothing can be retried on it.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Timeout(_) | Error::Protocol(_) => true,
            Error::Remote { kind, .. } => *kind == RemoteErrorKind::Io,
            _ => false,
        }
    }

    /// The device-reported class of this error, if it came from the device.
    pub fn remote_kind(&self) -> Option<RemoteErrorKind> {
        match self {
            Error::Remote { kind, .. } => Some(*kind),
            Error::Step { source, .. } => source.remote_kind(),
            _ => None,
        }
    }
}

impl From<serialport::Error> for Error {
    fn from(err: serialport::Error) -> Self {
        match err.kind() {
            serialport::ErrorKind::Io(kind) => Error::Io(io::Error::new(kind, err.description)),
            _ => Error::Io(io::Error::new(io::ErrorKind::Other, err.description)),
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[test]
fn transient_classes() {
    assert!(Error::Protocol("lost markers".into()).is_transient());
    assert!(Error::Timeout(Duration::from_secs(1)).is_transient());
    assert!(Error::Remote {
        kind: RemoteErrorKind::Io,
        path: "/main.py".into(),
        message: "OSError: [Errno 5] EIO".into(),
    }
    .is_transient());

    assert!(!Error::Remote {
        kind: RemoteErrorKind::NotFound,
        path: "/alarm/clock.py".into(),
        message: "OSError: [Errno 2] ENOENT".into(),
    }
    .is_transient());
    assert!(!Error::Io(io::Error::new(io::ErrorKind::BrokenPipe, "unplugged")).is_transient());
    assert!(!Error::DeviceUnresponsive { attempts: 3 }.is_transient());
    assert!(!Error::PortBusy("/dev/ttyUSB0".into()).is_transient());
}

#[test]
fn remote_kind_through_step() {
    let err = Error::Step {
        index: 2,
        step: "put /alarm/clock.py".into(),
        source: Box::new(Error::Remote {
            kind: RemoteErrorKind::NoSpace,
            path: "/alarm/clock.py".into(),
            message: "OSError: 28".into(),
        }),
    };
    assert_eq!(err.remote_kind(), Some(RemoteErrorKind::NoSpace));
    assert_eq!(
        err.to_string(),
        "step 2 (put /alarm/clock.py) failed: no space left on device on `/alarm/clock.py`: OSError: 28"
    );
}
