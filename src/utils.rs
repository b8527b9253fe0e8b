//! Helper functions for finding the board's serial port from the command line.

mod keyboard;
mod ports;

pub(crate) use keyboard::*;
pub use ports::{select_port, wait_for_port};
