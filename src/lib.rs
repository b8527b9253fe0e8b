//! `mpsync` pushes a local directory tree to the flash filesystem of a board
//! running MicroPython, over the board's serial console.
//!
//! The board is driven through its *raw REPL*: the running program is
//! interrupted, the interpreter switches to a mode where each submitted block
//! runs as one unit, and every filesystem operation is sent as a small Python
//! command whose output and error come back between fixed markers.
//!
//! The crate is layered bottom-up:
//!
//! * [`transport`]: a byte pipe to the board with bounded reads, owning the
//!   serial port for the duration of a session,
//! * [`control`]: the raw REPL handshake and command framing,
//! * [`remote_fs`]: `mkdir`, `put`, `ls` and `rm` on the board,
//! * [`plan`] and [`session`]: comparing the local and remote trees, then
//!   running the resulting steps with retries and a final verification.
//!
//! As in the rest of this family of tools, the session is implemented as a
//! state machine with the following characteristics:
//!
//! * Can only be in one state at any time.
//! * Each state can have its own associated data if needed.
//! * It is possible to have some shared data between **all** states.
//! * Transitions between states are triggered via typed **events** and follow
//!   defined semantics.
//! * Transitioning from one state to another consumes the original state.
//!   Data moves from one state to the next by being attached to the event.
//!
//! State transitions leverage `rust`'s `From` and `Into` pattern: only the
//! transitions for which a `From` implementation exists are possible, and any
//! other is rejected at compile-time.
//!
//! **Example**
//! ```no_run
//! use mpsync::{self as mp, CancelToken};
//!
//! let settings = mp::SettingsBuilder::new()
//!     .path("/dev/ttyUSB0")
//!     .remote_root("/")
//!     .finalize();
//! let local = mp::scan(std::path::Path::new("alarm-clock"), &[])?;
//! let report = mp::session::factory(settings, local, CancelToken::default()).run()?;
//! println!("{} step(s) executed", report.executed);
//! # Ok::<(), mp::Error>(())
//! ```

pub mod control;
mod entry;
mod error;
mod local;
pub mod plan;
pub mod remote_fs;
pub mod session;
mod settings;
pub mod transport;
mod utils;

#[cfg(test)]
mod sim;

pub use entry::EntryKind;
pub use error::{Error, RemoteErrorKind, Result};
pub use local::{digest, scan, LocalEntry};
pub use plan::{Mismatch, RemoteSnapshot, Step, SyncPlan};
pub use remote_fs::{RemoteEntry, RemoteFs};
pub use session::{CancelToken, SyncReport, SyncSession, Verification};
pub use settings::{Settings, SettingsBuilder};
pub use utils::{select_port, wait_for_port};
