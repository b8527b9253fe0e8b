//! What a session did, handed back to the caller.

use crate::plan::{Mismatch, Step, SyncPlan};

/// Outcome of the post-push verification.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Verification {
    /// Disabled, or nothing was executed.
    Skipped,
    Passed,
    Mismatched(Vec<Mismatch>),
    /// The board could not be listed after the push.
    Unavailable(String),
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SyncReport {
    /// Every planned step, as printed by its `Display`.
    pub planned: Vec<String>,
    /// How many of the planned steps completed.
    pub executed: usize,
    /// Files skipped because the board already has the same content.
    pub unchanged: usize,
    /// Payload bytes pushed by completed `put` steps.
    pub bytes_written: u64,
    pub dry_run: bool,
    pub verification: Verification,
}
impl SyncReport {
    pub(crate) fn new(plan: &SyncPlan, dry_run: bool) -> Self {
        SyncReport {
            planned: plan.steps().iter().map(|s| s.to_string()).collect(),
            executed: 0,
            unchanged: plan.unchanged(),
            bytes_written: 0,
            dry_run,
            verification: Verification::Skipped,
        }
    }

    pub(crate) fn record(&mut self, step: &Step) {
        self.executed += 1;
        if let Step::PutFile { content, .. } = step {
            self.bytes_written += content.len() as u64;
        }
    }

    /// `true` when the board did not end up as planned, or could not be
    /// checked.
    pub fn verification_failed(&self) -> bool {
        matches!(
            self.verification,
            Verification::Mismatched(_) | Verification::Unavailable(_)
        )
    }
}
