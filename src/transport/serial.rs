//! [`Link`](super::Link) implementation over a physical serial port.

use std::{
    cmp, fmt,
    io::{self, Read, Write},
    thread,
    time::{Duration, Instant},
};

use log::{debug, info, trace};
use serialport::SerialPort;

use super::{Link, MAX_READ};
use crate::{
    error::{Error, Result},
    settings::Settings,
};

/// Pause between two polls of the port input buffer.
const POLL_PERIOD: Duration = Duration::from_millis(10);

/// A serial port configured from the [`Settings`].
pub struct SerialLink {
    port: Box<dyn SerialPort>,
    name: String,
}
impl SerialLink {
    pub fn open(path: &str, settings: &Settings) -> Result<Self> {
        let port = serialport::new(path, settings.baud_rate)
            .data_bits(settings.data_bits)
            .stop_bits(settings.stop_bits)
            .parity(settings.parity)
            .flow_control(settings.flow_control)
            .timeout(POLL_PERIOD)
            .open()
            .map_err(|err| open_error(path, err))?;

        // A baud rate the driver silently rounded is as good as a failed open:
        // the interpreter would only see garbage.
        let actual = port.baud_rate()?;
        if actual != settings.baud_rate {
            return Err(Error::Connect {
                port: path.to_owned(),
                reason: format!(
                    "baud rate {} was not accepted (got {})",
                    settings.baud_rate, actual
                ),
            });
        }

        info!("Connected to {} at {} baud", path, actual);
        debug!("data_bits    : {:#?}", port.data_bits()?);
        debug!("stop_bits    : {:#?}", port.stop_bits()?);
        debug!("parity       : {:#?}", port.parity()?);
        debug!("flow control : {:#?}", port.flow_control()?);

        Ok(SerialLink {
            port,
            name: path.to_owned(),
        })
    }
}
impl Link for SerialLink {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn read(&mut self, deadline: Instant) -> Result<Vec<u8>> {
        let started = Instant::now();
        loop {
            // Blocking reads on serial ports are unreliable across platforms,
            // so only ever read what is already in the input buffer.
            let available = self.port.bytes_to_read()? as usize;
            if available > 0 {
                let mut buf = vec![0; cmp::min(available, MAX_READ)];
                match self.port.read(buf.as_mut_slice()) {
                    Ok(count) if count > 0 => {
                        buf.truncate(count);
                        return Ok(buf);
                    }
                    Ok(_) => {}
                    Err(ref e) if e.kind() == io::ErrorKind::TimedOut => {}
                    Err(e) => return Err(e.into()),
                }
            }

            let now = Instant::now();
            if now >= deadline {
                trace!("nothing received in {:?}", started.elapsed());
                return Err(Error::Timeout(now - started));
            }
            thread::sleep(cmp::min(POLL_PERIOD, deadline - now));
        }
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.port.write_all(bytes)?;
        self.port.flush()?;
        Ok(())
    }
}

impl fmt::Debug for SerialLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let port = &self.port;
        f.debug_tuple("SerialLink")
            .field(&port.name())
            .field(&port.baud_rate())
            .field(&port.data_bits())
            .field(&port.stop_bits())
            .field(&port.parity())
            .field(&port.flow_control())
            .finish()
    }
}

// =============================================================================
// Private stuff
// =============================================================================

/// Ports are opened for exclusive use; another process holding the port makes
/// the open fail with `EBUSY`.
fn open_error(path: &str, err: serialport::Error) -> Error {
    let busy_kind = matches!(
        err.kind(),
        serialport::ErrorKind::Io(io::ErrorKind::ResourceBusy)
    );
    if busy_kind || err.description.to_lowercase().contains("busy") {
        Error::PortBusy(path.to_owned())
    } else {
        Error::Connect {
            port: path.to_owned(),
            reason: err.to_string(),
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[test]
fn port_held_elsewhere_is_busy() {
    let err = serialport::Error::new(
        serialport::ErrorKind::Io(io::ErrorKind::ResourceBusy),
        "Device or resource busy",
    );
    match open_error("/dev/ttyUSB0", err) {
        Error::PortBusy(port) => assert_eq!(port, "/dev/ttyUSB0"),
        other => panic!("expected PortBusy, got {:?}", other),
    }

    // Without a dedicated kind, only the message tells.
    let err = serialport::Error::new(
        serialport::ErrorKind::Io(io::ErrorKind::Other),
        "Device or resource busy",
    );
    assert!(matches!(open_error("/dev/ttyUSB0", err), Error::PortBusy(_)));

    let err = serialport::Error::new(
        serialport::ErrorKind::NoDevice,
        "No such file or directory",
    );
    assert!(matches!(open_error("/dev/ttyUSB0", err), Error::Connect { .. }));
}
