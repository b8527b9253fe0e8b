//! Settings related to the serial port, the raw REPL handshake and the sync
//! session.
//!
//! Use the [builder](https://doc.rust-lang.org/1.0.0/style/ownership/builders.html)
//! pattern to set the configurable values.

use std::time::Duration;

pub use serialport::{DataBits, FlowControl, Parity, StopBits};

use crate::entry::rooted;

/// Largest chunk carried by a single write command. Escaping can grow a chunk
/// up to four times, which must stay well below the raw REPL input buffer.
pub const MAX_CHUNK_SIZE: usize = 1024;

// =============================================================================
// Public Interface
// =============================================================================

/// Groups all settings used by `mpsync` and acts as a
/// [builder](https://doc.rust-lang.org/1.0.0/style/ownership/builders.html)
/// for the settings.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Settings {
    /// The port name, usually the device path.
    pub path: Option<String>,
    /// The baud rate in symbols-per-second.
    pub baud_rate: u32,
    /// Number of bits used to represent a character sent on the line.
    pub data_bits: DataBits,
    /// The type of signalling to use for controlling data transfer.
    pub flow_control: FlowControl,
    /// The type of parity to use for error checking.
    pub parity: Parity,
    /// Number of bits to use to signal the end of a character.
    pub stop_bits: StopBits,

    /// Longest silence tolerated while waiting for a command's answer.
    pub read_timeout: Duration,
    /// Upper bound for a single command's answer, however busy the line is.
    pub command_timeout: Duration,
    /// Window in which the raw REPL banner must show up after each interrupt.
    pub handshake_timeout: Duration,
    /// How many times the running program is interrupted before giving up.
    pub interrupt_attempts: u32,

    /// Payload bytes per write command when pushing a file.
    pub chunk_size: usize,
    /// Directory on the device that mirrors the local root.
    pub remote_root: String,
    /// Extra attempts for a failed plan step (the first attempt not included).
    pub step_retries: usize,
    /// Pause between two attempts of the same plan step.
    pub retry_delay: Duration,
    /// Re-list the device after the push and compare against the plan.
    pub verify: bool,
    /// Remove remote entries that are absent locally.
    pub prune: bool,
    /// Compute the plan but do not execute it.
    pub dry_run: bool,
    /// Soft reset the interpreter when leaving raw mode.
    pub soft_reset_on_exit: bool,
    /// Draw a progress bar while executing the plan.
    pub progress: bool,

    /// Restrict creation of `Settings` instances unless through the
    /// `SettingsBuilder`.
    #[doc(hidden)]
    _private_use_builder: (),
}

/// The builder for the `Settings` values.
///
/// All values are optional and have default values that will be used if not
/// explicitly set.
///
/// **Example**
///
/// ```
/// use mpsync::SettingsBuilder;
///
/// let settings = SettingsBuilder::new().path("/dev/ttyUSB0").finalize();
/// assert_eq!(settings.baud_rate, 115_200);
/// ```
pub struct SettingsBuilder {
    settings: Settings,
}
impl Default for SettingsBuilder {
    fn default() -> Self {
        Self::new()
    }
}
impl SettingsBuilder {
    /// Start building the settings using default values and no path for the
    /// port.
    pub fn new() -> Self {
        SettingsBuilder {
            settings: Settings {
                path: None,
                baud_rate: 115_200,
                data_bits: DataBits::Eight,
                flow_control: FlowControl::None,
                parity: Parity::None,
                stop_bits: StopBits::One,
                read_timeout: Duration::from_secs(10),
                command_timeout: Duration::from_secs(120),
                handshake_timeout: Duration::from_secs(2),
                interrupt_attempts: 5,
                chunk_size: 256,
                remote_root: "/".into(),
                step_retries: 2,
                retry_delay: Duration::from_millis(500),
                verify: true,
                prune: false,
                dry_run: false,
                soft_reset_on_exit: true,
                progress: true,
                _private_use_builder: (),
            },
        }
    }

    /// Set the path to the serial port
    pub fn path<'a>(mut self, path: impl Into<std::borrow::Cow<'a, str>>) -> Self {
        self.settings.path = Some(path.into().as_ref().to_owned());
        self
    }

    /// Set the baud rate in symbols-per-second
    pub fn baud_rate(mut self, baud_rate: u32) -> Self {
        self.settings.baud_rate = baud_rate;
        self
    }

    /// Set the number of bits used to represent a character sent on the line
    pub fn data_bits(mut self, data_bits: DataBits) -> Self {
        self.settings.data_bits = data_bits;
        self
    }

    /// Set the type of signalling to use for controlling data transfer
    pub fn flow_control(mut self, flow_control: FlowControl) -> Self {
        self.settings.flow_control = flow_control;
        self
    }

    /// Set the type of parity to use for error checking
    pub fn parity(mut self, parity: Parity) -> Self {
        self.settings.parity = parity;
        self
    }

    /// Set the number of bits to use to signal the end of a character
    pub fn stop_bits(mut self, stop_bits: StopBits) -> Self {
        self.settings.stop_bits = stop_bits;
        self
    }

    pub fn read_timeout(mut self, read_timeout: Duration) -> Self {
        self.settings.read_timeout = read_timeout;
        self
    }

    pub fn command_timeout(mut self, command_timeout: Duration) -> Self {
        self.settings.command_timeout = command_timeout;
        self
    }

    pub fn handshake_timeout(mut self, handshake_timeout: Duration) -> Self {
        self.settings.handshake_timeout = handshake_timeout;
        self
    }

    /// Set how many interrupts are tried before the device is declared
    /// unresponsive; at least one is always sent.
    pub fn interrupt_attempts(mut self, attempts: u32) -> Self {
        self.settings.interrupt_attempts = attempts.max(1);
        self
    }

    /// Set the payload size of a single write command, clamped to
    /// `1..=MAX_CHUNK_SIZE`.
    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.settings.chunk_size = chunk_size.max(1).min(MAX_CHUNK_SIZE);
        self
    }

    /// Set the directory on the device receiving the files. Always stored
    /// rooted and without a trailing `/`, except for the root itself.
    pub fn remote_root<'a>(mut self, remote_root: impl Into<std::borrow::Cow<'a, str>>) -> Self {
        self.settings.remote_root = rooted(&remote_root.into());
        self
    }

    pub fn step_retries(mut self, step_retries: usize) -> Self {
        self.settings.step_retries = step_retries;
        self
    }

    pub fn retry_delay(mut self, retry_delay: Duration) -> Self {
        self.settings.retry_delay = retry_delay;
        self
    }

    pub fn verify(mut self, verify: bool) -> Self {
        self.settings.verify = verify;
        self
    }

    pub fn prune(mut self, prune: bool) -> Self {
        self.settings.prune = prune;
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.settings.dry_run = dry_run;
        self
    }

    pub fn soft_reset_on_exit(mut self, soft_reset: bool) -> Self {
        self.settings.soft_reset_on_exit = soft_reset;
        self
    }

    pub fn progress(mut self, progress: bool) -> Self {
        self.settings.progress = progress;
        self
    }

    pub fn finalize(self) -> Settings {
        self.settings
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[test]
fn all_default() {
    let settings = SettingsBuilder::new().finalize();
    assert_eq!(settings.path, None);
    assert_eq!(settings.baud_rate, 115_200);
    assert_eq!(settings.data_bits, DataBits::Eight);
    assert_eq!(settings.flow_control, FlowControl::None);
    assert_eq!(settings.parity, Parity::None);
    assert_eq!(settings.stop_bits, StopBits::One);
    assert_eq!(settings.chunk_size, 256);
    assert_eq!(settings.read_timeout, Duration::from_secs(10));
    assert_eq!(settings.command_timeout, Duration::from_secs(120));
    assert_eq!(settings.remote_root, "/");
    assert!(settings.verify);
    assert!(!settings.prune);
    assert!(!settings.dry_run);
}

#[test]
fn path() {
    let settings = SettingsBuilder::new().path("/dev/ttyUSB0").finalize();
    assert_eq!(settings.path.unwrap(), "/dev/ttyUSB0");
}

#[test]
fn baud_rate() {
    let baud_rate = 230_400;
    let settings = SettingsBuilder::new().baud_rate(baud_rate).finalize();
    assert_eq!(settings.baud_rate, baud_rate);
}

#[test]
fn parity() {
    let parity = Parity::Even;
    let settings = SettingsBuilder::new().parity(parity).finalize();
    assert_eq!(settings.parity, parity);
}

#[test]
fn chunk_size_is_clamped() {
    let settings = SettingsBuilder::new().chunk_size(64 * 1024).finalize();
    assert_eq!(settings.chunk_size, MAX_CHUNK_SIZE);
    let settings = SettingsBuilder::new().chunk_size(0).finalize();
    assert_eq!(settings.chunk_size, 1);
}

#[test]
fn remote_root_is_normalized() {
    let settings = SettingsBuilder::new().remote_root("lib/").finalize();
    assert_eq!(settings.remote_root, "/lib");
    let settings = SettingsBuilder::new().remote_root("/").finalize();
    assert_eq!(settings.remote_root, "/");
    let settings = SettingsBuilder::new().remote_root("").finalize();
    assert_eq!(settings.remote_root, "/");
    let settings = SettingsBuilder::new().remote_root("/lib//alarm/").finalize();
    assert_eq!(settings.remote_root, "/lib/alarm");
}

#[test]
fn interrupt_attempts_at_least_one() {
    let settings = SettingsBuilder::new().interrupt_attempts(0).finalize();
    assert_eq!(settings.interrupt_attempts, 1);
}
