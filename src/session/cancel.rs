//! Cooperative cancellation of a running session.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// A flag shared between the session and whoever may want to stop it, such
/// as a `Ctrl+C` handler. The session only looks at it between two plan
/// steps, never while a command is running on the board.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);
impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[test]
fn clones_share_the_flag() {
    let token = CancelToken::default();
    let handler_side = token.clone();
    assert!(!token.is_cancelled());
    handler_side.cancel();
    assert!(token.is_cancelled());
}
