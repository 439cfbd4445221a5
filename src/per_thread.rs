//! Per-thread kernel state: thread ids, the owning-thread flag and the
//! thread's own kernel object.
//!
//! Threads started through [`KernelThread::begin`](crate::thread::KernelThread::begin)
//! install their state before running user code. Any other thread (the
//! main thread, threads spawned with `std::thread`) gets its state lazily on
//! first use and is recorded as exited with code 0 when its thread-local
//! storage is torn down.

use std::cell::{Cell, OnceCell};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::host::KernelObject;
use crate::message::MessageQueue;
use crate::tracing_compat::trace;

static NEXT_TID: AtomicU64 = AtomicU64::new(1);
static PRIMARY_TID: AtomicU64 = AtomicU64::new(0);

/// Kernel-assigned thread identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(u64);

impl ThreadId {
    /// Sentinel for "no thread" and for threads observed dead.
    pub const INVALID: Self = Self(0);

    /// Builds an id from its raw value.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns true unless this is [`ThreadId::INVALID`].
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }

    pub(crate) fn allocate() -> Self {
        Self(NEXT_TID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "T{}", self.0)
        } else {
            f.write_str("T-invalid")
        }
    }
}

struct PerThreadInfo {
    tid: ThreadId,
    object: Arc<KernelObject>,
    owning: Cell<bool>,
}

impl PerThreadInfo {
    fn foreign() -> Self {
        let tid = ThreadId::allocate();
        let object = KernelObject::thread(tid);
        if let Some(control) = object.thread_control() {
            control.release_start();
        }
        trace!(tid = %tid, "adopted foreign thread");
        Self {
            tid,
            object,
            owning: Cell::new(false),
        }
    }
}

impl Drop for PerThreadInfo {
    fn drop(&mut self) {
        // Runs during thread-local teardown: other thread-locals, including a
        // subscriber's, may already be gone, so nothing here may log. No-op
        // when the entry wrapper already recorded the exit.
        let _ = self.object.mark_exited(0);
    }
}

thread_local! {
    static INFO: OnceCell<PerThreadInfo> = const { OnceCell::new() };
}

fn with_info<R>(f: impl FnOnce(&PerThreadInfo) -> R) -> R {
    INFO.with(|cell| f(cell.get_or_init(PerThreadInfo::foreign)))
}

/// Installs the state for a thread started by this crate. Must run on the
/// new thread before any other kernel call.
pub(crate) fn install(tid: ThreadId, object: Arc<KernelObject>) {
    INFO.with(|cell| {
        let installed = cell
            .set(PerThreadInfo {
                tid,
                object,
                owning: Cell::new(false),
            })
            .is_ok();
        debug_assert!(installed, "per-thread state installed twice");
    });
}

/// Returns the calling thread's id.
#[must_use]
pub fn tid_caller() -> ThreadId {
    with_info(|info| info.tid)
}

/// Returns the id of the thread that called [`config::init`](crate::config::init),
/// or [`ThreadId::INVALID`] if it was never called.
#[must_use]
pub fn tid_primary() -> ThreadId {
    ThreadId(PRIMARY_TID.load(Ordering::Acquire))
}

/// Records the calling thread as the primary thread, unless one was already
/// recorded. Returns the primary thread's id.
pub(crate) fn record_primary() -> ThreadId {
    let caller = tid_caller();
    match PRIMARY_TID.compare_exchange(0, caller.0, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => caller,
        Err(existing) => ThreadId(existing),
    }
}

/// Flags the calling thread as the owning (message-pumping) thread.
///
/// Waits issued by an owning thread keep servicing its message queue.
pub fn mark_as_owning_thread() {
    with_info(|info| info.owning.set(true));
}

/// Returns true if the calling thread was flagged as the owning thread.
#[must_use]
pub fn is_caller_owning_thread() -> bool {
    with_info(|info| info.owning.get())
}

/// Returns the calling thread's kernel object.
pub(crate) fn current_object() -> Arc<KernelObject> {
    with_info(|info| Arc::clone(&info.object))
}

/// Returns the calling thread's message queue.
pub(crate) fn current_queue() -> Arc<MessageQueue> {
    with_info(|info| {
        info.object.thread_control().map_or_else(
            || Arc::new(MessageQueue::new()),
            |control| Arc::clone(control.queue()),
        )
    })
}
