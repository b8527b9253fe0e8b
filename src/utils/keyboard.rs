//! Key polling while the terminal is in raw mode.

use std::{io::stdout, time::Duration};

use crossterm::{
    cursor::{Hide, MoveToColumn, Show},
    event::{poll, read, Event, KeyCode, KeyEvent, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode},
    Result,
};

/// Keys that stop a wait for the board.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum StopKey {
    Escape,
    /// `Ctrl+C`, which raw mode delivers as a key instead of a signal.
    Interrupt,
}

/// Wait up to `timeout` for a key press, in raw mode.
pub(crate) fn poll_stop_key(timeout: Duration) -> Result<Option<StopKey>> {
    let pressed = {
        let _raw = RawTerminal::enter()?;
        if poll(timeout)? {
            // read() does not block once poll() said an event is ready.
            Some(read()?)
        } else {
            None
        }
    };
    Ok(pressed.as_ref().and_then(stop_key))
}

// =============================================================================
// Private stuff
// =============================================================================

/// Raw mode with a hidden cursor, restored when dropped, even on error.
struct RawTerminal;
impl RawTerminal {
    fn enter() -> Result<Self> {
        enable_raw_mode()?;
        execute!(stdout(), Hide)?;
        Ok(RawTerminal)
    }
}
impl Drop for RawTerminal {
    fn drop(&mut self) {
        let _ = execute!(stdout(), MoveToColumn(0), Show);
        let _ = disable_raw_mode();
    }
}

fn stop_key(event: &Event) -> Option<StopKey> {
    match event {
        Event::Key(KeyEvent {
            code: KeyCode::Esc, ..
        }) => Some(StopKey::Escape),
        Event::Key(KeyEvent {
            code: KeyCode::Char('c'),
            modifiers,
        }) if modifiers.contains(KeyModifiers::CONTROL) => Some(StopKey::Interrupt),
        _ => None,
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[test]
fn stop_keys() {
    let esc = Event::Key(KeyCode::Esc.into());
    assert_eq!(stop_key(&esc), Some(StopKey::Escape));

    let ctrl_c = Event::Key(KeyEvent {
        code: KeyCode::Char('c'),
        modifiers: KeyModifiers::CONTROL,
    });
    assert_eq!(stop_key(&ctrl_c), Some(StopKey::Interrupt));

    let plain_c = Event::Key(KeyCode::Char('c').into());
    assert_eq!(stop_key(&plain_c), None);
    assert_eq!(stop_key(&Event::Resize(80, 24)), None);
}
