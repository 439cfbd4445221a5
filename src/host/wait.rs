//! The host's blocking wait primitive.

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::object::{KernelObject, Registration};
use super::wait_block::{WaitBlock, WakeReason};
use crate::message::MessageQueue;
use crate::per_thread::ThreadId;

/// Result of one host-level wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HostWait {
    /// The object at this index was signaled; its signal was consumed.
    Object(usize),
    /// A message is pending on the supplied queue.
    Message,
    /// The budget elapsed.
    Timeout,
}

/// Waits until any of `objects` is signaled for `caller`, or `budget`
/// elapses (`None` waits forever).
///
/// With a `queue`, the wait also completes when a message is pending on it.
/// When several objects are signaled at once, the lowest index wins.
pub(crate) fn wait_any(
    objects: &[&Arc<KernelObject>],
    budget: Option<Duration>,
    queue: Option<&MessageQueue>,
    caller: ThreadId,
) -> HostWait {
    let block = Arc::new(WaitBlock::new());
    // A budget too large for `Instant` arithmetic behaves as infinite.
    let deadline = budget.and_then(|budget| Instant::now().checked_add(budget));

    for (index, object) in objects.iter().enumerate() {
        if object.acquire_or_register(&block, index, caller) != Registration::Registered {
            break;
        }
    }
    if let Some(queue) = queue {
        queue.register_waiter(&block);
    }

    let reason = block.block(deadline);

    for object in objects {
        object.unregister(&block);
    }
    if let Some(queue) = queue {
        queue.unregister_waiter(&block);
    }

    match reason {
        WakeReason::Object(index) => HostWait::Object(index),
        WakeReason::Message => HostWait::Message,
        WakeReason::TimedOut | WakeReason::Waiting => HostWait::Timeout,
    }
}
