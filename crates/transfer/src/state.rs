use std::sync::atomic::{AtomicU32, Ordering};

use tokio::sync::watch;

use crate::types::TransferState;

/// Owns the session's observable [`TransferState`].
///
/// Both pipeline stages may be retrying at once; the session leaves
/// `Retrying` only when the last of them recovers.
#[derive(Debug)]
pub struct StateTracker {
    tx: watch::Sender<TransferState>,
    retrying: AtomicU32,
}

impl Default for StateTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StateTracker {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(TransferState::Idle);
        Self {
            tx,
            retrying: AtomicU32::new(0),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<TransferState> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> TransferState {
        *self.tx.borrow()
    }

    /// Applies `next` if the lifecycle allows it. Returns whether it changed.
    pub fn transition(&self, next: TransferState) -> bool {
        let changed = self.tx.send_if_modified(|state| {
            if state.can_transition_to(next) {
                *state = next;
                true
            } else {
                false
            }
        });
        if changed {
            tracing::debug!(state = %next, "transfer state changed");
        }
        changed
    }

    pub fn enter_retrying(&self) {
        if self.retrying.fetch_add(1, Ordering::SeqCst) == 0 {
            self.transition(TransferState::Retrying);
        }
    }

    pub fn leave_retrying(&self) {
        let prev = self
            .retrying
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if prev == Ok(1) {
            self.transition(TransferState::Running);
        }
    }
}
