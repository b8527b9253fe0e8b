//! States for the sync session state machine.
//!
//! This module is private and restricted to the [`session`](crate::session)
//! scope. The public interface of the session is provided by
//! [`session`](crate::session).
//!
//! Refer to the [`state_machine`](super::state_machine) module for an overview
//! of states, events and transitions.

use std::{fmt, sync::Arc};

use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, error, info, warn};
use retry::{delay, retry_with_index, OperationResult};

use super::{
    cancel::CancelToken,
    events::*,
    report::{SyncReport, Verification},
};
use crate::{
    error::{Error, RemoteErrorKind, Result},
    local::LocalEntry,
    plan::{RemoteSnapshot, Step, SyncPlan},
    remote_fs::RemoteFs,
    settings::Settings,
    transport::Link,
};

// =============================================================================
// Crate-Public Interface
// =============================================================================

/// Data shared by all states for the lifetime of a session.
#[derive(Debug, Clone)]
pub(crate) struct Session {
    pub settings: Settings,
    /// The local entries to mirror, relative to the sync root.
    pub local: Arc<[LocalEntry]>,
    pub cancel: CancelToken,
}

/// Trait adding the ability for a state to be `run` after a transition into it.
pub(crate) trait Runnable {
    /// A state implements this method so it can be `run` after the state
    /// machine transitions into it.
    ///
    /// During this call, the state does its work and then requests a
    /// transition by returning the appropriate `event`. Whatever the state
    /// owns (the open filesystem, the plan) is moved into that event.
    fn run(&mut self, session: &Session) -> Event;
}

// Init State ==================================================================

/// The initial state of the session.
///
/// From the `InitState`, the state machine can evolve via the following
/// transitions:
///
///  * **[`ConnectedEvent`] => [`SnapshotState`]** after the port is open and
///    the board entered raw mode,
///  * **[`DoneEvent`] => [`DoneState`]** when the board cannot be reached.
pub(crate) struct InitState {
    /// An already open link to use instead of the port named in the settings.
    pub link: Option<Box<dyn Link>>,
}
impl Runnable for InitState {
    fn run(&mut self, session: &Session) -> Event {
        info!("=> Init");

        let connected = match self.link.take() {
            Some(link) => RemoteFs::connect_link(link, &session.settings),
            None => RemoteFs::connect(&session.settings),
        };
        match connected {
            Ok(fs) => Event::Connected(ConnectedEvent {
                session: session.clone(),
                fs,
            }),
            Err(err) => {
                error!("Cannot start the session: {}", err);
                Event::Done(DoneEvent {
                    session: session.clone(),
                    fs: None,
                    outcome: Err(err),
                })
            }
        }
    }
}
impl fmt::Debug for InitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let link = self.link.as_ref().map(|l| l.name());
        f.debug_struct("InitState").field("link", &link).finish()
    }
}

// Snapshot State ==============================================================

/// Lists the remote tree under the sync root.
///
///  * **[`SnapshotTakenEvent`] => [`PlanState`]** with the listing; a missing
///    sync root gives an empty snapshot,
///  * **[`DoneEvent`] => [`DoneState`]** when the board cannot be listed.
#[derive(Debug)]
pub(crate) struct SnapshotState {
    pub fs: Option<RemoteFs>,
}
impl Runnable for SnapshotState {
    fn run(&mut self, session: &Session) -> Event {
        info!("=> Snapshot");

        if let Some(mut fs) = self.fs.take() {
            let root = &session.settings.remote_root;
            let snapshot = match fs.list(root) {
                Ok(entries) => {
                    debug!("{} remote entries under {}", entries.len(), root);
                    RemoteSnapshot {
                        root_exists: true,
                        entries,
                    }
                }
                Err(err) if err.remote_kind() == Some(RemoteErrorKind::NotFound) => {
                    info!("{} does not exist on the board yet", root);
                    RemoteSnapshot::default()
                }
                Err(err) => {
                    error!("Cannot list {}: {}", root, err);
                    return Event::Done(DoneEvent {
                        session: session.clone(),
                        fs: Some(fs),
                        outcome: Err(err),
                    });
                }
            };
            return Event::SnapshotTaken(SnapshotTakenEvent {
                session: session.clone(),
                fs,
                snapshot,
            });
        }
        unreachable!("the snapshot state always holds the filesystem")
    }
}

// Plan State ==================================================================

/// Compares the local entries with the snapshot.
///
///  * **[`ExecuteEvent`] => [`ExecuteState`]** when there is work to do,
///  * **[`DoneEvent`] => [`DoneState`]** for an empty plan, a dry run, or a
///    file/directory conflict.
#[derive(Debug)]
pub(crate) struct PlanState {
    pub fs: Option<RemoteFs>,
    pub snapshot: RemoteSnapshot,
}
impl Runnable for PlanState {
    fn run(&mut self, session: &Session) -> Event {
        info!("=> Plan");

        let settings = &session.settings;
        let fs = self.fs.take();
        let plan = match SyncPlan::compute(
            &session.local,
            &self.snapshot,
            &settings.remote_root,
            settings.prune,
        ) {
            Ok(plan) => plan,
            Err(err) => {
                error!("Cannot plan the sync: {}", err);
                return Event::Done(DoneEvent {
                    session: session.clone(),
                    fs,
                    outcome: Err(err),
                });
            }
        };

        for step in plan.steps() {
            debug!("planned: {}", step);
        }
        let report = SyncReport::new(&plan, settings.dry_run);
        if plan.is_empty() || settings.dry_run {
            info!(
                "{} step(s) planned, {} file(s) unchanged{}",
                plan.len(),
                plan.unchanged(),
                if settings.dry_run { " (dry run)" } else { "" }
            );
            return Event::Done(DoneEvent {
                session: session.clone(),
                fs,
                outcome: Ok(report),
            });
        }

        match fs {
            Some(fs) => Event::Execute(ExecuteEvent {
                session: session.clone(),
                fs,
                plan,
                report,
            }),
            None => unreachable!("the plan state always holds the filesystem"),
        }
    }
}

// Execute State ===============================================================

/// Runs the plan steps strictly in order, retrying transient failures.
///
///  * **[`VerifyEvent`] => [`VerifyState`]** after the last step, when
///    verification is enabled,
///  * **[`DoneEvent`] => [`DoneState`]** otherwise, or as soon as a step fails
///    for good or the session is cancelled.
#[derive(Debug)]
pub(crate) struct ExecuteState {
    pub fs: Option<RemoteFs>,
    pub plan: SyncPlan,
    pub report: Option<SyncReport>,
}
impl Runnable for ExecuteState {
    fn run(&mut self, session: &Session) -> Event {
        info!("=> Execute");

        let settings = &session.settings;
        let (mut fs, mut report) = match (self.fs.take(), self.report.take()) {
            (Some(fs), Some(report)) => (fs, report),
            _ => unreachable!("the execute state always holds the filesystem and report"),
        };

        let pb = progress_bar(settings, self.plan.len());
        for (index, step) in self.plan.steps().iter().enumerate() {
            if session.cancel.is_cancelled() {
                pb.abandon_with_message("cancelled");
                warn!(
                    "Cancelled after {} of {} step(s)",
                    report.executed,
                    self.plan.len()
                );
                return Event::Done(DoneEvent {
                    session: session.clone(),
                    fs: Some(fs),
                    outcome: Err(Error::Cancelled),
                });
            }

            pb.set_message(step.to_string());
            if let Err(err) = run_step(&mut fs, step, settings) {
                pb.abandon_with_message(format!("{}", style("failed").red()));
                let err = Error::Step {
                    index: index + 1,
                    step: step.to_string(),
                    source: Box::new(err),
                };
                error!("{}", err);
                return Event::Done(DoneEvent {
                    session: session.clone(),
                    fs: Some(fs),
                    outcome: Err(err),
                });
            }
            report.record(step);
            pb.inc(1);
        }
        pb.finish_with_message("done");
        info!(
            "{} step(s) done, {} bytes written",
            report.executed, report.bytes_written
        );

        if settings.verify {
            Event::Verify(VerifyEvent {
                session: session.clone(),
                fs,
                plan: std::mem::take(&mut self.plan),
                report,
            })
        } else {
            Event::Done(DoneEvent {
                session: session.clone(),
                fs: Some(fs),
                outcome: Ok(report),
            })
        }
    }
}

// Verify State ================================================================

/// Lists the board again and checks it against the plan.
///
///  * **[`DoneEvent`] => [`DoneState`]** always; a failed listing is reported
///    as [`Verification::Unavailable`], not as a session error.
#[derive(Debug)]
pub(crate) struct VerifyState {
    pub fs: Option<RemoteFs>,
    pub plan: SyncPlan,
    pub report: Option<SyncReport>,
}
impl Runnable for VerifyState {
    fn run(&mut self, session: &Session) -> Event {
        info!("=> Verify");

        let (mut fs, mut report) = match (self.fs.take(), self.report.take()) {
            (Some(fs), Some(report)) => (fs, report),
            _ => unreachable!("the verify state always holds the filesystem and report"),
        };

        let root = &session.settings.remote_root;
        report.verification = match fs.list(root) {
            Ok(entries) => {
                let mismatches = self.plan.verify(root, &entries);
                if mismatches.is_empty() {
                    info!("Board content verified");
                    Verification::Passed
                } else {
                    for mismatch in &mismatches {
                        warn!("Verification: {}", mismatch);
                    }
                    Verification::Mismatched(mismatches)
                }
            }
            Err(err) => {
                warn!("Cannot verify the board content: {}", err);
                Verification::Unavailable(err.to_string())
            }
        };

        Event::Done(DoneEvent {
            session: session.clone(),
            fs: Some(fs),
            outcome: Ok(report),
        })
    }
}

// Done State ==================================================================

/// The final state of the session. It releases the board, then fires the
/// [`ExitEvent`] that ends the event loop.
#[derive(Debug)]
pub(crate) struct DoneState {
    pub fs: Option<RemoteFs>,
    pub outcome: Option<Result<SyncReport>>,
    pub should_exit: bool,
}
impl Runnable for DoneState {
    fn run(&mut self, session: &Session) -> Event {
        info!("=> Done");

        if let Some(mut fs) = self.fs.take() {
            if let Err(err) = fs.close() {
                warn!("Could not leave raw mode cleanly: {}", err);
            }
        }
        match self.outcome.take() {
            Some(outcome) => Event::Exit(ExitEvent {
                session: session.clone(),
                outcome,
            }),
            None => unreachable!("the done state runs once per outcome"),
        }
    }
}

// =============================================================================
// Private stuff
// =============================================================================

/// Run one plan step with the retry policy from `settings`.
///
/// Only transient failures are retried, each retry preceded by a resync of
/// the control channel. Device-reported faults other than I/O errors fail the
/// step right away.
fn run_step(fs: &mut RemoteFs, step: &Step, settings: &Settings) -> Result<()> {
    let delays = delay::Fixed::from_millis(settings.retry_delay.as_millis() as u64)
        .take(settings.step_retries);

    let result = retry_with_index(delays, |attempt| {
        if attempt > 1 {
            info!("Retrying `{}` (attempt {})", step, attempt);
            if let Err(err) = fs.resync() {
                return OperationResult::Err(err);
            }
        }
        match apply(fs, step) {
            Ok(()) => OperationResult::Ok(()),
            Err(err) if err.is_transient() => {
                warn!("`{}` failed: {}", step, err);
                OperationResult::Retry(err)
            }
            Err(err) => OperationResult::Err(err),
        }
    });

    match result {
        Ok(()) => Ok(()),
        Err(retry::Error::Operation {
            error,
            total_delay,
            tries,
        }) => {
            debug!(
                "`{}` given up after {} attempt(s) in {:?}",
                step, tries, total_delay
            );
            Err(error)
        }
        Err(retry::Error::Internal(reason)) => Err(Error::Protocol(reason)),
    }
}

/// A single attempt at `step`. Creating a directory that already exists and
/// removing an entry that is already gone both count as done, which keeps a
/// retried step idempotent.
fn apply(fs: &mut RemoteFs, step: &Step) -> Result<()> {
    match step {
        Step::MkDir(path) => match fs.mkdir(path) {
            Err(err) if err.remote_kind() == Some(RemoteErrorKind::AlreadyExists) => {
                debug!("{} already exists", path);
                Ok(())
            }
            other => other,
        },
        Step::PutFile { path, content, .. } => fs.put_file(path, content),
        Step::Remove { path, kind } => match fs.remove(path, *kind) {
            Err(err) if err.remote_kind() == Some(RemoteErrorKind::NotFound) => {
                debug!("{} already gone", path);
                Ok(())
            }
            other => other,
        },
    }
}

fn progress_bar(settings: &Settings, len: usize) -> ProgressBar {
    if !settings.progress {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(len as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[MP] ⏩ Syncing [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {wide_msg}")
            .progress_chars("=>-"),
    );
    pb
}

// =============================================================================
// Unit Tests
// =============================================================================
