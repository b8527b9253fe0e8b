//! Serial port discovery.

use console::{style, Term};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use serialport::{available_ports, SerialPortType};

use std::{
    sync::mpsc::{self, RecvTimeoutError},
    thread,
    time::Duration,
};

use crate::utils::poll_stop_key;

// For more spinners check out the cli-spinners project:
// https://github.com/sindresorhus/cli-spinners/blob/master/spinners.json
const SPINNER: &[&str] = &["⠋", "⠙", "⠚", "⠞", "⠖", "⠦", "⠴", "⠲", "⠳", "⠓"];

//==============================================================================
// Public Interface
//==============================================================================

/// Let the user pick the board's port among the connected serial devices,
/// waiting for one to show up if there is none yet.
///
/// Returns `None` when the user dismisses the selection; calling again
/// refreshes the list of devices.
pub fn select_port() -> Option<String> {
    let mut found_ports;
    let mut attempt: usize = 1;
    let waiting_period: usize = 1;

    let pb = spinner();

    // Avoid cursor flicker during the waiting
    let _ = Term::stdout().hide_cursor();
    loop {
        found_ports = enumerate_serial_ports();
        let num_ports = found_ports.len();
        if num_ports > 0 {
            pb.finish_with_message("Select the port of the board:");
            break;
        }
        let waited = attempt * waiting_period;
        pb.set_message(format!(
            "[{:03}s {}] ⌛ Waiting for a board to be connected...",
            style(waited).dim(),
            num_ports
        ));
        attempt += 1;

        thread::sleep(Duration::from_secs(waiting_period as u64));
    }
    let _ = Term::stdout().show_cursor();

    let selection = select_port_interactive(&found_ports);
    match &selection {
        Some(path) => {
            pb.finish_with_message(format!("👍 Serial port {} is ready", style(path).green()));
        }
        None => {
            pb.finish_with_message("❌ Selection canceled");
        }
    }
    selection
}

/// Wait until a serial device named `path` exists, checking every couple of
/// seconds. The user can stop waiting with `Esc` or `Ctrl+C`.
///
/// Returns `true` when the wait was cancelled.
pub fn wait_for_port(path: &str) -> bool {
    let pb = spinner();

    let mut attempt: usize = 1;
    let waiting_period = 2;

    // The main thread polls for the device while a second one listens for
    // `Esc`. Each side tells the other when it is done.
    let (cancel_tx, cancel_rx) = mpsc::channel();
    let (done_tx, done_rx) = mpsc::channel::<()>();

    let cancelation_thread = thread::spawn(move || loop {
        if done_rx.try_recv().is_ok() {
            break;
        }
        if let Ok(Some(key)) = poll_stop_key(Duration::from_millis(500)) {
            debug!("{:?} pressed while waiting for the port", key);
            let _ = cancel_tx.send(());
            break;
        }
    });

    let cancelled;
    loop {
        let found_ports = enumerate_serial_ports();
        if check_requested_port(&found_ports, path) {
            let _ = done_tx.send(());
            pb.finish_with_message(format!("👍 Serial port {} is ready", style(path).green()));
            cancelled = false;
            break;
        }

        let waited = attempt * waiting_period;
        pb.set_message(format!(
            "[{:03}s {}] ⏳ Waiting for {} to be ready (ESC to cancel)...",
            style(waited).dim(),
            found_ports.len(),
            style(path).cyan()
        ));

        match cancel_rx.recv_timeout(Duration::from_secs(waiting_period as u64)) {
            Ok(()) => {
                pb.finish_with_message(format!(
                    "❌ Waiting on port {} canceled after {} seconds",
                    style(path).cyan(),
                    style(waited).dim()
                ));
                cancelled = true;
                break;
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                // The listener died; nobody can cancel anymore.
                cancelled = true;
                break;
            }
        }

        attempt += 1;
    }

    if cancelation_thread.join().is_err() {
        warn!("The keyboard listener panicked");
    }
    cancelled
}

//==============================================================================
// Private stuff
//==============================================================================

fn spinner() -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.enable_steady_tick(120);
    pb.set_style(
        ProgressStyle::default_spinner()
            .tick_strings(SPINNER)
            .template("[MP] {spinner:.blue} {msg}"),
    );
    pb
}

fn check_requested_port(ports: &[String], path: &str) -> bool {
    ports.iter().any(|p| port_name(p) == path)
}

/// The device path of an entry from [`enumerate_serial_ports`].
fn port_name(entry: &str) -> &str {
    entry.split(": (").next().unwrap_or(entry)
}

/// Enumerates serial devices on the system, with the manufacturer and product
/// of USB adapters.
fn enumerate_serial_ports() -> Vec<String> {
    let mut ports = vec![];
    match available_ports() {
        Ok(found) => {
            for p in found {
                match p.port_type {
                    SerialPortType::UsbPort(info) => {
                        let extended_name = format!(
                            "{}: ({} / {})",
                            p.port_name,
                            info.manufacturer.as_ref().map_or("", String::as_str),
                            info.product.as_ref().map_or("", String::as_str)
                        );
                        ports.push(extended_name);
                    }
                    // Virtual ports are handy for testing
                    _ => ports.push(p.port_name),
                }
            }
        }
        Err(ref e) => {
            info!("error: {}", e);
        }
    }
    debug!("serial ports: {:?}", ports);
    ports
}

fn select_port_interactive(ports: &[String]) -> Option<String> {
    use dialoguer::{theme::ColorfulTheme, Select};

    let term = Term::buffered_stderr();
    let theme = ColorfulTheme::default();

    let mut select = Select::with_theme(&theme);
    for item in ports {
        select.item(item);
    }

    let selection = select.default(0).interact_on_opt(&term).ok().flatten();
    selection
        .and_then(|index| ports.get(index))
        .map(|entry| port_name(entry).to_owned())
}

// =============================================================================
// Unit Tests
// =============================================================================

#[test]
fn usb_entries_resolve_to_their_path() {
    assert_eq!(port_name("/dev/ttyUSB0: (Silicon Labs / CP2102)"), "/dev/ttyUSB0");
    assert_eq!(port_name("/dev/ttyS1"), "/dev/ttyS1");
    let ports = vec!["/dev/ttyUSB0: (FTDI / FT232R)".to_owned()];
    assert!(check_requested_port(&ports, "/dev/ttyUSB0"));
    assert!(!check_requested_port(&ports, "/dev/ttyUSB"));
}
