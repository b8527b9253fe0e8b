//! `mpsync` sync session state machine.
//!
//! A session goes through the following states, each one owning the open
//! remote filesystem until it hands it over with the event it fires:
//!
//! ```text
//!   Init --Connected--> Snapshot --SnapshotTaken--> Plan --Execute--> Execute
//!    |                     |                         |                  |   \
//!    |                     |                         |                  |  Verify
//!    |                     |                         |                  |   |
//!    +---------------------+-----------Done----------+------------------+---+
//!                                        |
//!                                        v
//!                                      Done --Exit--> Done (should_exit)
//! ```
//!
//! Whatever happens, the `Done` state closes the connection before the event
//! loop returns.

use std::sync::Arc;

use super::{cancel::CancelToken, events::*, report::SyncReport, states::*};
use crate::{error::Result, local::LocalEntry, settings::Settings, transport::Link};

// =============================================================================
// Public Interface
// =============================================================================

/// A sync session ready to run. Use the [`factory()`] function to get an
/// instance then run it by calling its `run()` method.
pub struct SyncSession {
    sm: SessionStates,
}
impl SyncSession {
    /// The event loop runs until the `Done` state is reached and its
    /// `should_exit` flag is set, then returns the outcome of the session.
    pub fn run(mut self) -> Result<SyncReport> {
        loop {
            self.sm = self.sm.step();
            if let SessionStates::Done(sm) = &mut self.sm {
                if sm.state.should_exit {
                    return match sm.state.outcome.take() {
                        Some(outcome) => outcome,
                        None => unreachable!("an exiting session always has an outcome"),
                    };
                }
            }
        }
    }
}

/// Factory function for a session that opens the port named in `settings`.
///
/// `local` holds the entries to mirror under `settings.remote_root`, as
/// returned by [`scan`](crate::scan).
pub fn factory(settings: Settings, local: Vec<LocalEntry>, cancel: CancelToken) -> SyncSession {
    SyncSession {
        sm: SessionStates::Init(SessionSM::new(settings, local, cancel, None)),
    }
}

/// Same as [`factory()`] over an already open link.
pub fn factory_with_link(
    settings: Settings,
    local: Vec<LocalEntry>,
    cancel: CancelToken,
    link: Box<dyn Link>,
) -> SyncSession {
    SyncSession {
        sm: SessionStates::Init(SessionSM::new(settings, local, cancel, Some(link))),
    }
}

// =============================================================================
// Private stuff
// =============================================================================

/// The raw state machine, holding the data shared by all states next to the
/// current state.
#[derive(Debug)]
struct SessionSM<S: Runnable> {
    session: Session,
    state: S,
}
impl<S: Runnable> SessionSM<S> {
    fn run(&mut self) -> Event {
        self.state.run(&self.session)
    }
}

/// The state machine starts in the `InitState`.
impl SessionSM<InitState> {
    fn new(
        settings: Settings,
        local: Vec<LocalEntry>,
        cancel: CancelToken,
        link: Option<Box<dyn Link>>,
    ) -> Self {
        SessionSM {
            session: Session {
                settings,
                local: Arc::from(local),
                cancel,
            },
            state: InitState { link },
        }
    }
}

/// An enum wrapper around the states of the session state machine.
enum SessionStates {
    Init(SessionSM<InitState>),
    Snapshot(SessionSM<SnapshotState>),
    Plan(SessionSM<PlanState>),
    Execute(SessionSM<ExecuteState>),
    Verify(SessionSM<VerifyState>),
    Done(SessionSM<DoneState>),
}
impl SessionStates {
    /// The unit of work in the event loop: run the current state and follow
    /// the transition its event asks for. Transitions are implemented with
    /// the `From`/`Into` pattern below.
    fn step(self) -> Self {
        match self {
            SessionStates::Init(mut sm) => {
                let event = sm.run();
                match event {
                    Event::Connected(ev) => SessionStates::Snapshot(ev.into()),
                    Event::Done(ev) => SessionStates::Done(ev.into()),
                    _ => unreachable!("illegal event {:#?} at current state {:#?}", event, sm),
                }
            }
            SessionStates::Snapshot(mut sm) => {
                let event = sm.run();
                match event {
                    Event::SnapshotTaken(ev) => SessionStates::Plan(ev.into()),
                    Event::Done(ev) => SessionStates::Done(ev.into()),
                    _ => unreachable!("illegal event {:#?} at current state {:#?}", event, sm),
                }
            }
            SessionStates::Plan(mut sm) => {
                let event = sm.run();
                match event {
                    Event::Execute(ev) => SessionStates::Execute(ev.into()),
                    Event::Done(ev) => SessionStates::Done(ev.into()),
                    _ => unreachable!("illegal event {:#?} at current state {:#?}", event, sm),
                }
            }
            SessionStates::Execute(mut sm) => {
                let event = sm.run();
                match event {
                    Event::Verify(ev) => SessionStates::Verify(ev.into()),
                    Event::Done(ev) => SessionStates::Done(ev.into()),
                    _ => unreachable!("illegal event {:#?} at current state {:#?}", event, sm),
                }
            }
            SessionStates::Verify(mut sm) => {
                let event = sm.run();
                match event {
                    Event::Done(ev) => SessionStates::Done(ev.into()),
                    _ => unreachable!("illegal event {:#?} at current state {:#?}", event, sm),
                }
            }
            SessionStates::Done(mut sm) => {
                let event = sm.run();
                match event {
                    Event::Exit(ev) => SessionStates::Done(ev.into()),
                    _ => unreachable!("illegal event {:#?} at current state {:#?}", event, sm),
                }
            }
        }
    }
}

// -----------------------------------------------------------------------------
// State from Event transitions
// -----------------------------------------------------------------------------

impl From<ConnectedEvent> for SessionSM<SnapshotState> {
    fn from(event: ConnectedEvent) -> SessionSM<SnapshotState> {
        SessionSM {
            session: event.session,
            state: SnapshotState { fs: Some(event.fs) },
        }
    }
}

impl From<SnapshotTakenEvent> for SessionSM<PlanState> {
    fn from(event: SnapshotTakenEvent) -> SessionSM<PlanState> {
        SessionSM {
            session: event.session,
            state: PlanState {
                fs: Some(event.fs),
                snapshot: event.snapshot,
            },
        }
    }
}

impl From<ExecuteEvent> for SessionSM<ExecuteState> {
    fn from(event: ExecuteEvent) -> SessionSM<ExecuteState> {
        SessionSM {
            session: event.session,
            state: ExecuteState {
                fs: Some(event.fs),
                plan: event.plan,
                report: Some(event.report),
            },
        }
    }
}

impl From<VerifyEvent> for SessionSM<VerifyState> {
    fn from(event: VerifyEvent) -> SessionSM<VerifyState> {
        SessionSM {
            session: event.session,
            state: VerifyState {
                fs: Some(event.fs),
                plan: event.plan,
                report: Some(event.report),
            },
        }
    }
}

impl From<DoneEvent> for SessionSM<DoneState> {
    fn from(event: DoneEvent) -> SessionSM<DoneState> {
        SessionSM {
            session: event.session,
            state: DoneState {
                fs: event.fs,
                outcome: Some(event.outcome),
                should_exit: false,
            },
        }
    }
}
impl From<ExitEvent> for SessionSM<DoneState> {
    fn from(event: ExitEvent) -> SessionSM<DoneState> {
        SessionSM {
            session: event.session,
            state: DoneState {
                fs: None,
                outcome: Some(event.outcome),
                should_exit: true,
            },
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        error::{Error, RemoteErrorKind},
        session::Verification,
        sim::{Fault, SimBoard},
        transport::Connection,
        SettingsBuilder,
    };

    fn builder() -> SettingsBuilder {
        SettingsBuilder::new()
            .read_timeout(Duration::from_millis(300))
            .handshake_timeout(Duration::from_millis(300))
            .retry_delay(Duration::from_millis(10))
            .chunk_size(32)
            .progress(false)
    }

    fn alarm_project() -> Vec<LocalEntry> {
        vec![
            LocalEntry::file("settings.txt", b"SSID=home\nKEY=secret\n".to_vec()),
            LocalEntry::file("main.py", b"import alarm.clock\nalarm.clock.run()\n".to_vec()),
            LocalEntry::directory("alarm"),
            LocalEntry::file("alarm/clock.py", vec![b'#'; 100]),
        ]
    }

    fn push(board: &SimBoard, settings: Settings, local: Vec<LocalEntry>) -> Result<SyncReport> {
        factory_with_link(settings, local, CancelToken::default(), Box::new(board.clone())).run()
    }

    #[test]
    fn alarm_project_on_empty_board() {
        let board = SimBoard::new();
        let report = push(&board, builder().finalize(), alarm_project()).unwrap();

        assert_eq!(
            report.planned,
            vec![
                "mkdir /alarm",
                "put /settings.txt (21 bytes)",
                "put /main.py (37 bytes)",
                "put /alarm/clock.py (100 bytes)",
            ]
        );
        assert_eq!(report.executed, 4);
        assert_eq!(report.bytes_written, 158);
        assert_eq!(report.verification, Verification::Passed);
        assert_eq!(board.file("/alarm/clock.py").unwrap(), vec![b'#'; 100]);
        assert_eq!(board.file("/settings.txt").unwrap(), b"SSID=home\nKEY=secret\n");
        assert!(!board.handle_open());
        assert_eq!(board.soft_resets(), 1);
    }

    #[test]
    fn second_run_changes_nothing() {
        let board = SimBoard::new();
        push(&board, builder().finalize(), alarm_project()).unwrap();
        let mutations = board.mutations();

        let report = push(&board, builder().finalize(), alarm_project()).unwrap();
        assert!(report.planned.is_empty());
        assert_eq!(report.unchanged, 3);
        assert_eq!(report.verification, Verification::Skipped);
        assert_eq!(board.mutations(), mutations);
    }

    #[test]
    fn missing_remote_root_is_created() {
        let board = SimBoard::new();
        let settings = builder().remote_root("/lib/alarm").finalize();
        let local = vec![LocalEntry::file("clock.py", b"pass\n".to_vec())];

        let report = push(&board, settings, local).unwrap();
        assert_eq!(
            report.planned,
            vec!["mkdir /lib", "mkdir /lib/alarm", "put /lib/alarm/clock.py (5 bytes)"]
        );
        assert_eq!(board.file("/lib/alarm/clock.py").unwrap(), b"pass\n");
        assert_eq!(report.verification, Verification::Passed);
    }

    #[test]
    fn transient_failure_does_not_abort() {
        let board = SimBoard::new();
        // listing, mkdir, then the open of /settings.txt goes unanswered.
        board.inject_after(2, Fault::Silence);

        let report = push(&board, builder().finalize(), alarm_project()).unwrap();
        assert_eq!(report.executed, 4);
        assert_eq!(report.verification, Verification::Passed);
    }

    #[test]
    fn failing_step_aborts_the_session() {
        let board = SimBoard::new();
        board.set_capacity(64);

        let err = push(&board, builder().finalize(), alarm_project()).unwrap_err();
        match &err {
            Error::Step { index, step, .. } => {
                assert_eq!(*index, 4);
                assert_eq!(step, "put /alarm/clock.py (100 bytes)");
            }
            other => panic!("expected a step error, got {:?}", other),
        }
        assert_eq!(err.remote_kind(), Some(RemoteErrorKind::NoSpace));
        assert!(!board.handle_open());
        assert_eq!(board.soft_resets(), 1);
    }

    #[test]
    fn conflicts_abort_before_any_change() {
        let board = SimBoard::new();
        board.add_file("/alarm", b"not a directory");

        let err = push(&board, builder().finalize(), alarm_project()).unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
        assert_eq!(board.mutations(), 0);
    }

    #[test]
    fn cancelled_before_the_first_step() {
        let board = SimBoard::new();
        let cancel = CancelToken::default();
        cancel.cancel();

        let session = factory_with_link(
            builder().finalize(),
            alarm_project(),
            cancel,
            Box::new(board.clone()),
        );
        assert!(matches!(session.run(), Err(Error::Cancelled)));
        assert_eq!(board.mutations(), 0);
        assert_eq!(board.soft_resets(), 1);
    }

    #[test]
    fn cancel_waits_for_the_running_step() {
        let board = SimBoard::new();
        let cancel = CancelToken::default();
        // listing, mkdir, 3 blocks for settings.txt, then main.py is opened
        // and its first chunk written when Ctrl+C comes in.
        let pressed = cancel.clone();
        board.on_command(7, move || pressed.cancel());

        let session = factory_with_link(
            builder().finalize(),
            alarm_project(),
            cancel,
            Box::new(board.clone()),
        );
        assert!(matches!(session.run(), Err(Error::Cancelled)));
        assert_eq!(
            board.file("/main.py").unwrap(),
            b"import alarm.clock\nalarm.clock.run()\n"
        );
        assert!(!board.handle_open());
        assert_eq!(board.file("/alarm/clock.py"), None);
        assert_eq!(board.commands_executed(), 9);
        assert_eq!(board.soft_resets(), 1);
    }

    #[test]
    fn lost_device_is_not_retried() {
        let board = SimBoard::new();
        let unplugged = board.clone();
        // The cable goes while settings.txt is being opened.
        board.on_command(3, move || unplugged.unplug());

        let err = push(&board, builder().finalize(), alarm_project()).unwrap_err();
        match &err {
            Error::Step { index, source, .. } => {
                assert_eq!(*index, 2);
                assert!(matches!(**source, Error::Io(_)));
            }
            other => panic!("expected a step error, got {:?}", other),
        }
        assert_eq!(board.commands_executed(), 3);
    }

    #[test]
    fn dry_run_only_plans() {
        let board = SimBoard::new();
        let report = push(&board, builder().dry_run(true).finalize(), alarm_project()).unwrap();

        assert!(report.dry_run);
        assert_eq!(report.planned.len(), 4);
        assert_eq!(report.executed, 0);
        assert_eq!(board.mutations(), 0);
    }

    #[test]
    fn prune_removes_leftovers() {
        let board = SimBoard::new();
        board.add_dir("/old");
        board.add_file("/old/boot.py", b"x");
        board.add_file("/stale.py", b"y");

        let local = vec![LocalEntry::file("main.py", b"pass\n".to_vec())];
        let report = push(&board, builder().prune(true).finalize(), local.clone()).unwrap();
        assert_eq!(report.verification, Verification::Passed);
        assert!(!board.has_dir("/old"));
        assert_eq!(board.file("/stale.py"), None);

        board.add_file("/stale.py", b"y");
        push(&board, builder().finalize(), local).unwrap();
        assert_eq!(board.file("/stale.py").unwrap(), b"y");
    }

    #[test]
    fn unavailable_verification_is_reported() {
        let board = SimBoard::new();
        let local = vec![LocalEntry::file("main.py", b"pass\n".to_vec())];
        // listing, open, write, close, then the verification listing.
        board.inject_after(4, Fault::Raise("MemoryError: memory allocation failed".to_owned()));

        let report = push(&board, builder().finalize(), local).unwrap();
        assert_eq!(report.executed, 1);
        assert!(matches!(report.verification, Verification::Unavailable(_)));
        assert!(report.verification_failed());
    }

    #[test]
    fn verification_can_be_disabled() {
        let board = SimBoard::new();
        let local = vec![LocalEntry::file("main.py", b"pass\n".to_vec())];
        let report = push(&board, builder().verify(false).finalize(), local).unwrap();
        assert_eq!(report.verification, Verification::Skipped);
        assert!(!report.verification_failed());
    }

    #[test]
    fn busy_port_is_refused() {
        let board = SimBoard::new();
        let settings = builder().finalize();
        let _held = Connection::with_link(Box::new(board.clone()), &settings).unwrap();

        let err = push(&board, settings, alarm_project()).unwrap_err();
        assert!(matches!(err, Error::PortBusy(_)));
    }

    #[test]
    fn unresponsive_board() {
        let board = SimBoard::busy_for(Duration::from_secs(60));
        let settings = builder()
            .handshake_timeout(Duration::from_millis(100))
            .interrupt_attempts(2)
            .finalize();

        let err = push(&board, settings, alarm_project()).unwrap_err();
        assert!(matches!(err, Error::DeviceUnresponsive { attempts: 2 }));
    }
}
