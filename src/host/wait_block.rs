//! Wait blocks: the rendezvous between one waiting thread and the objects
//! (and message queue) it waits on.
//!
//! A wait block moves out of `Waiting` exactly once. Signalling objects and
//! message posters race to move it; the winner decides the outcome. All
//! transitions happen under the block's own lock, which is always the
//! innermost lock taken.

use parking_lot::{Condvar, Mutex};
use std::time::Instant;

/// Terminal state of a wait block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WakeReason {
    /// Still blocked.
    Waiting,
    /// The object at this index was signaled and its signal consumed for us.
    Object(usize),
    /// A message became available on the waiter's queue.
    Message,
    /// The waiter gave up when its budget ran out.
    TimedOut,
}

#[derive(Debug)]
pub(crate) struct WaitBlock {
    state: Mutex<WakeReason>,
    cond: Condvar,
}

impl WaitBlock {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(WakeReason::Waiting),
            cond: Condvar::new(),
        }
    }

    /// Claims the block for the object at `index`.
    ///
    /// Returns false if the block already left `Waiting`; the caller must then
    /// leave its signal untouched.
    pub(crate) fn try_claim(&self, index: usize) -> bool {
        self.transition(WakeReason::Object(index))
    }

    /// Wakes the block because a message is pending.
    pub(crate) fn try_wake_for_message(&self) -> bool {
        self.transition(WakeReason::Message)
    }

    /// Returns true once the block has left `Waiting`.
    pub(crate) fn is_settled(&self) -> bool {
        *self.state.lock() != WakeReason::Waiting
    }

    fn transition(&self, reason: WakeReason) -> bool {
        let mut state = self.state.lock();
        if *state != WakeReason::Waiting {
            return false;
        }
        *state = reason;
        self.cond.notify_one();
        true
    }

    /// Blocks until the block settles or `deadline` passes.
    ///
    /// On expiry the block is moved to `TimedOut` under its lock, so a claim
    /// that raced with the expiry still wins and is reported.
    pub(crate) fn block(&self, deadline: Option<Instant>) -> WakeReason {
        let mut state = self.state.lock();
        while *state == WakeReason::Waiting {
            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        *state = WakeReason::TimedOut;
                        break;
                    }
                    let _ = self.cond.wait_until(&mut state, deadline);
                }
                None => self.cond.wait(&mut state),
            }
        }
        *state
    }
}
