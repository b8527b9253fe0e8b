//! Events of the sync session state machine.
//!
//! This module is private and restricted to the [`session`](crate::session)
//! scope. Each event carries the shared session data along with whatever the
//! origin state hands over to the target state.
//!
//! Refer to the [`state_machine`](super::state_machine) module for an overview
//! of states, events and transitions.

use super::{report::SyncReport, states::Session};
use crate::{
    error::Result,
    plan::{RemoteSnapshot, SyncPlan},
    remote_fs::RemoteFs,
};

// =============================================================================
// Crate-Public Interface
// =============================================================================

// ConnectedEvent ==============================================================

/// Event fired once the port is open and the board sits in raw mode. It
/// triggers a transition to the `Snapshot` state.
#[derive(Debug)]
pub(crate) struct ConnectedEvent {
    pub session: Session,
    /// Moved into the next state, like every `fs` below.
    pub fs: RemoteFs,
}

// SnapshotTakenEvent ==========================================================

/// Event fired after the remote tree under the sync root has been listed. It
/// triggers a transition to the `Plan` state.
#[derive(Debug)]
pub(crate) struct SnapshotTakenEvent {
    pub session: Session,
    pub fs: RemoteFs,
    pub snapshot: RemoteSnapshot,
}

// ExecuteEvent ================================================================

/// Event fired when the plan has at least one step to run and this is not a
/// dry run. It triggers a transition to the `Execute` state.
#[derive(Debug)]
pub(crate) struct ExecuteEvent {
    pub session: Session,
    pub fs: RemoteFs,
    pub plan: SyncPlan,
    pub report: SyncReport,
}

// VerifyEvent =================================================================

/// Event fired after every step ran, when verification is enabled.
#[derive(Debug)]
pub(crate) struct VerifyEvent {
    pub session: Session,
    pub fs: RemoteFs,
    pub plan: SyncPlan,
    pub report: SyncReport,
}

// DoneEvent ===================================================================

/// Event fired when the session completes, successfully or not, from any
/// state. The `Done` state still has to release the board.
#[derive(Debug)]
pub(crate) struct DoneEvent {
    pub session: Session,
    /// `None` when the board could not be reached at all.
    pub fs: Option<RemoteFs>,
    pub outcome: Result<SyncReport>,
}

// ExitEvent ===================================================================

/// The last event of the session; the event loop hands `outcome` back to the
/// caller.
#[derive(Debug)]
pub(crate) struct ExitEvent {
    pub session: Session,
    pub outcome: Result<SyncReport>,
}

// Events enum =================================================================

#[derive(Debug)]
pub(crate) enum Event {
    Connected(ConnectedEvent),
    SnapshotTaken(SnapshotTakenEvent),
    Execute(ExecuteEvent),
    Verify(VerifyEvent),
    Done(DoneEvent),
    Exit(ExitEvent),
}
