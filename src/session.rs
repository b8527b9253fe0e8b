//! `mpsync` sync session.
//!
//! A session opens the serial port, snapshots the board, computes the
//! [`SyncPlan`](crate::SyncPlan), runs it step by step and verifies the
//! result, always closing the port before it returns.
//!
//! **Example** - Executing the session state machine event loop:
//! ```no_run
//! use mpsync::{self as mp, CancelToken};
//!
//! let settings = mp::SettingsBuilder::new().path("/dev/ttyUSB0").finalize();
//! let local = mp::scan(std::path::Path::new("."), &[]).unwrap();
//! let report = mp::session::factory(settings, local, CancelToken::default()).run();
//! println!("{:?}", report);
//! ```

mod cancel;
mod events;
mod report;
mod state_machine;
mod states;

pub use cancel::CancelToken;
pub use report::{SyncReport, Verification};
pub use state_machine::{factory, factory_with_link, SyncSession};
