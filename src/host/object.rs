//! Kernel objects: the shared state behind every waitable handle.
//!
//! Each object owns its signal state and a FIFO list of registered wait
//! blocks. Whenever the state changes toward signaled, the object walks its
//! waiters in order and hands its signal to the first eligible ones by
//! claiming their wait blocks, consuming the signal on their behalf.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use super::namespace::AccessPolicy;
use super::wait_block::WaitBlock;
use crate::error::{host_code, Error, Result};
use crate::message::MessageQueue;
use crate::per_thread::ThreadId;
use crate::thread::Priority;

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// The kind of a kernel object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    /// Recursive, thread-owned mutual exclusion lock.
    Mutex,
    /// Counting semaphore with a fixed maximum.
    Semaphore,
    /// Manual- or auto-reset event.
    Event,
    /// A thread; signaled once the thread has exited.
    Thread,
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Mutex => "mutex",
            Self::Semaphore => "semaphore",
            Self::Event => "event",
            Self::Thread => "thread",
        };
        f.write_str(name)
    }
}

/// Signal state of a kernel object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ObjectState {
    Mutex {
        owner: Option<ThreadId>,
        recursion: u32,
    },
    Semaphore {
        count: u32,
        max: u32,
    },
    Event {
        signaled: bool,
        manual_reset: bool,
    },
    Thread {
        exit_code: Option<u32>,
    },
}

impl ObjectState {
    pub(crate) const fn kind(&self) -> ObjectKind {
        match self {
            Self::Mutex { .. } => ObjectKind::Mutex,
            Self::Semaphore { .. } => ObjectKind::Semaphore,
            Self::Event { .. } => ObjectKind::Event,
            Self::Thread { .. } => ObjectKind::Thread,
        }
    }

    /// Returns true if a wait by `caller` would be satisfied right now.
    fn is_signaled_for(&self, caller: ThreadId) -> bool {
        match self {
            Self::Mutex { owner, .. } => owner.map_or(true, |owner| owner == caller),
            Self::Semaphore { count, .. } => *count > 0,
            Self::Event { signaled, .. } => *signaled,
            Self::Thread { exit_code } => exit_code.is_some(),
        }
    }

    /// Applies the side effect of a satisfied wait by `caller`.
    fn consume(&mut self, caller: ThreadId) {
        match self {
            Self::Mutex { owner, recursion } => {
                *owner = Some(caller);
                *recursion += 1;
            }
            Self::Semaphore { count, .. } => *count -= 1,
            Self::Event {
                signaled,
                manual_reset,
            } => {
                if !*manual_reset {
                    *signaled = false;
                }
            }
            Self::Thread { .. } => {}
        }
    }
}

#[derive(Debug)]
struct Waiter {
    block: Arc<WaitBlock>,
    index: usize,
    owner: ThreadId,
}

#[derive(Debug)]
struct ObjectInner {
    state: ObjectState,
    waiters: VecDeque<Waiter>,
}

impl ObjectInner {
    /// Hands the current signal to as many waiters as it satisfies, in FIFO
    /// order.
    fn satisfy_waiters(&mut self) {
        let Self { state, waiters } = self;
        waiters.retain(|waiter| {
            if !state.is_signaled_for(waiter.owner) {
                return true;
            }
            if waiter.block.try_claim(waiter.index) {
                state.consume(waiter.owner);
            }
            false
        });
    }
}

/// Result of trying to satisfy a wait on one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Registration {
    /// The object was signaled and the wait block was claimed for it.
    Acquired,
    /// The wait block is now queued on the object.
    Registered,
    /// The wait block had already settled elsewhere; nothing was done.
    Settled,
}

/// Suspension state of a thread object.
#[derive(Debug, Default)]
struct ParkState {
    started: bool,
    wake_token: bool,
}

/// Thread-only parts of a kernel object.
#[derive(Debug)]
pub(crate) struct ThreadControl {
    tid: ThreadId,
    park: Mutex<ParkState>,
    cond: Condvar,
    queue: Arc<MessageQueue>,
    priority: Mutex<Priority>,
}

impl ThreadControl {
    pub(crate) const fn tid(&self) -> ThreadId {
        self.tid
    }

    pub(crate) fn queue(&self) -> &Arc<MessageQueue> {
        &self.queue
    }

    pub(crate) fn priority(&self) -> Priority {
        *self.priority.lock()
    }

    pub(crate) fn set_priority(&self, priority: Priority) {
        *self.priority.lock() = priority;
    }

    /// Blocks the calling (new) thread until its creator releases it.
    pub(crate) fn wait_for_start(&self) {
        let mut park = self.park.lock();
        while !park.started {
            self.cond.wait(&mut park);
        }
    }

    /// Lets a thread created suspended begin running.
    pub(crate) fn release_start(&self) {
        let mut park = self.park.lock();
        park.started = true;
        self.cond.notify_all();
    }

    /// Blocks until [`unblock`](Self::unblock) has been called, consuming
    /// one wake token.
    pub(crate) fn block(&self) {
        let mut park = self.park.lock();
        while !park.wake_token {
            self.cond.wait(&mut park);
        }
        park.wake_token = false;
    }

    /// Stores a wake token and releases a blocked thread.
    pub(crate) fn unblock(&self) {
        let mut park = self.park.lock();
        park.wake_token = true;
        self.cond.notify_all();
    }
}

/// One kernel wait-object.
pub(crate) struct KernelObject {
    serial: u64,
    name: Option<String>,
    access: AccessPolicy,
    handles: AtomicUsize,
    inner: Mutex<ObjectInner>,
    thread: Option<ThreadControl>,
}

impl fmt::Debug for KernelObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelObject")
            .field("serial", &self.serial)
            .field("kind", &self.kind())
            .field("name", &self.name)
            .field("handles", &self.handles.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl KernelObject {
    fn build(
        state: ObjectState,
        name: Option<String>,
        access: AccessPolicy,
        thread: Option<ThreadControl>,
    ) -> Arc<Self> {
        Arc::new(Self {
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
            name,
            access,
            handles: AtomicUsize::new(0),
            inner: Mutex::new(ObjectInner {
                state,
                waiters: VecDeque::new(),
            }),
            thread,
        })
    }

    /// Creates an anonymous object.
    pub(crate) fn anonymous(state: ObjectState) -> Arc<Self> {
        Self::build(state, None, AccessPolicy::process_default(), None)
    }

    /// Creates a named object carrying `access`.
    pub(crate) fn named(state: ObjectState, name: &str, access: AccessPolicy) -> Arc<Self> {
        Self::build(state, Some(name.to_string()), access, None)
    }

    /// Creates a thread object. The thread starts suspended.
    pub(crate) fn thread(tid: ThreadId) -> Arc<Self> {
        let control = ThreadControl {
            tid,
            park: Mutex::new(ParkState::default()),
            cond: Condvar::new(),
            queue: Arc::new(MessageQueue::new()),
            priority: Mutex::new(Priority::default()),
        };
        Self::build(
            ObjectState::Thread { exit_code: None },
            None,
            AccessPolicy::process_default(),
            Some(control),
        )
    }

    pub(crate) const fn serial(&self) -> u64 {
        self.serial
    }

    pub(crate) fn kind(&self) -> ObjectKind {
        self.inner.lock().state.kind()
    }

    pub(crate) fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub(crate) const fn access(&self) -> &AccessPolicy {
        &self.access
    }

    pub(crate) fn thread_control(&self) -> Option<&ThreadControl> {
        self.thread.as_ref()
    }

    // ---------------------------------------------------------------------
    // Handle accounting
    // ---------------------------------------------------------------------

    pub(crate) fn open_handle(&self) {
        self.handles.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops one handle reference. Fails if no handle is open.
    pub(crate) fn close_handle(&self) -> Result<usize> {
        self.handles
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_sub(1)
            })
            .map(|previous| previous - 1)
            .map_err(|_| {
                Error::host(host_code::INVALID_HANDLE)
                    .with_message(format!("no open handle on object #{}", self.serial))
            })
    }

    pub(crate) fn handle_count(&self) -> usize {
        self.handles.load(Ordering::Acquire)
    }

    // ---------------------------------------------------------------------
    // Waiting
    // ---------------------------------------------------------------------

    /// Satisfies the wait immediately if possible, otherwise queues `block`.
    pub(crate) fn acquire_or_register(
        &self,
        block: &Arc<WaitBlock>,
        index: usize,
        caller: ThreadId,
    ) -> Registration {
        let mut inner = self.inner.lock();
        if block.is_settled() {
            return Registration::Settled;
        }
        if inner.state.is_signaled_for(caller) {
            if block.try_claim(index) {
                inner.state.consume(caller);
                return Registration::Acquired;
            }
            return Registration::Settled;
        }
        inner.waiters.push_back(Waiter {
            block: Arc::clone(block),
            index,
            owner: caller,
        });
        Registration::Registered
    }

    /// Removes `block` from the waiter list, if still present.
    pub(crate) fn unregister(&self, block: &Arc<WaitBlock>) {
        self.inner
            .lock()
            .waiters
            .retain(|waiter| !Arc::ptr_eq(&waiter.block, block));
    }

    #[cfg(test)]
    pub(crate) fn waiter_count(&self) -> usize {
        self.inner.lock().waiters.len()
    }

    // ---------------------------------------------------------------------
    // Kind-specific signalling
    // ---------------------------------------------------------------------

    /// Releases one level of ownership held by `caller`.
    pub(crate) fn release_mutex(&self, caller: ThreadId) -> Result<()> {
        let mut inner = self.inner.lock();
        match &mut inner.state {
            ObjectState::Mutex { owner, recursion } => {
                if *owner != Some(caller) {
                    return Err(Error::host(host_code::NOT_OWNER)
                        .with_message("mutex released by a thread that does not own it"));
                }
                *recursion -= 1;
                if *recursion == 0 {
                    *owner = None;
                    inner.satisfy_waiters();
                }
                Ok(())
            }
            other => Err(kind_mismatch(ObjectKind::Mutex, other.kind())),
        }
    }

    /// Adds `release` to the semaphore count and returns the previous count.
    pub(crate) fn release_semaphore(&self, release: u32) -> Result<u32> {
        let mut inner = self.inner.lock();
        match &mut inner.state {
            ObjectState::Semaphore { count, max } => {
                let previous = *count;
                match previous.checked_add(release) {
                    Some(next) if next <= *max => *count = next,
                    _ => {
                        return Err(Error::host(host_code::TOO_MANY_POSTS).with_message(format!(
                            "release of {release} exceeds maximum count {max}"
                        )))
                    }
                }
                inner.satisfy_waiters();
                Ok(previous)
            }
            other => Err(kind_mismatch(ObjectKind::Semaphore, other.kind())),
        }
    }

    /// Sets the event to signaled.
    pub(crate) fn set_event(&self) -> Result<()> {
        self.with_event(|signaled| *signaled = true, false)
    }

    /// Clears the event.
    pub(crate) fn reset_event(&self) -> Result<()> {
        self.with_event(|signaled| *signaled = false, false)
    }

    /// Signals the event for the waiters present right now, then clears it.
    pub(crate) fn pulse_event(&self) -> Result<()> {
        self.with_event(|signaled| *signaled = true, true)
    }

    fn with_event(&self, update: impl FnOnce(&mut bool), clear_after: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        match &mut inner.state {
            ObjectState::Event { signaled, .. } => update(signaled),
            other => return Err(kind_mismatch(ObjectKind::Event, other.kind())),
        }
        inner.satisfy_waiters();
        if clear_after {
            if let ObjectState::Event { signaled, .. } = &mut inner.state {
                *signaled = false;
            }
        }
        Ok(())
    }

    /// Records thread exit. Returns false if the exit was already recorded.
    pub(crate) fn mark_exited(&self, code: u32) -> bool {
        let mut inner = self.inner.lock();
        let ObjectState::Thread { exit_code } = &mut inner.state else {
            return false;
        };
        if exit_code.is_some() {
            return false;
        }
        *exit_code = Some(code);
        inner.satisfy_waiters();
        true
    }

    /// Returns the fixed maximum count of a semaphore object.
    pub(crate) fn semaphore_max(&self) -> Option<u32> {
        match self.inner.lock().state {
            ObjectState::Semaphore { max, .. } => Some(max),
            _ => None,
        }
    }

    /// Returns the exit code of a thread object that has exited.
    pub(crate) fn exit_code(&self) -> Option<u32> {
        match self.inner.lock().state {
            ObjectState::Thread { exit_code } => exit_code,
            _ => None,
        }
    }

    /// Returns true if a wait by `caller` would be satisfied right now.
    #[cfg(test)]
    pub(crate) fn is_signaled_for(&self, caller: ThreadId) -> bool {
        self.inner.lock().state.is_signaled_for(caller)
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> ObjectState {
        self.inner.lock().state.clone()
    }
}

fn kind_mismatch(expected: ObjectKind, found: ObjectKind) -> Error {
    Error::host(host_code::TYPE_MISMATCH)
        .with_message(format!("expected a {expected} object, found a {found}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: ThreadId = ThreadId::from_raw(100);
    const B: ThreadId = ThreadId::from_raw(101);

    fn event(manual_reset: bool) -> Arc<KernelObject> {
        KernelObject::anonymous(ObjectState::Event {
            signaled: false,
            manual_reset,
        })
    }

    #[test]
    fn mutex_is_recursive_for_owner() {
        let mutex = KernelObject::anonymous(ObjectState::Mutex {
            owner: None,
            recursion: 0,
        });
        let block = Arc::new(WaitBlock::new());
        assert_eq!(mutex.acquire_or_register(&block, 0, A), Registration::Acquired);
        assert!(mutex.is_signaled_for(A));
        assert!(!mutex.is_signaled_for(B));

        let again = Arc::new(WaitBlock::new());
        assert_eq!(mutex.acquire_or_register(&again, 0, A), Registration::Acquired);
        mutex.release_mutex(A).unwrap();
        assert!(!mutex.is_signaled_for(B), "one level still held");
        mutex.release_mutex(A).unwrap();
        assert!(mutex.is_signaled_for(B));
    }

    #[test]
    fn mutex_release_by_non_owner_fails() {
        let mutex = KernelObject::anonymous(ObjectState::Mutex {
            owner: Some(A),
            recursion: 1,
        });
        let err = mutex.release_mutex(B).unwrap_err();
        assert!(err.is_host_code(host_code::NOT_OWNER));
    }

    #[test]
    fn mutex_release_hands_ownership_to_waiter() {
        let mutex = KernelObject::anonymous(ObjectState::Mutex {
            owner: Some(A),
            recursion: 1,
        });
        let block = Arc::new(WaitBlock::new());
        assert_eq!(mutex.acquire_or_register(&block, 3, B), Registration::Registered);
        mutex.release_mutex(A).unwrap();
        assert!(block.is_settled());
        assert_eq!(
            mutex.state(),
            ObjectState::Mutex {
                owner: Some(B),
                recursion: 1
            }
        );
        assert_eq!(mutex.waiter_count(), 0);
    }

    #[test]
    fn semaphore_release_is_bounded() {
        let sem = KernelObject::anonymous(ObjectState::Semaphore { count: 0, max: 2 });
        assert_eq!(sem.release_semaphore(2).unwrap(), 0);
        let err = sem.release_semaphore(1).unwrap_err();
        assert!(err.is_host_code(host_code::TOO_MANY_POSTS));
    }

    #[test]
    fn auto_reset_event_wakes_one_waiter() {
        let ev = event(false);
        let first = Arc::new(WaitBlock::new());
        let second = Arc::new(WaitBlock::new());
        ev.acquire_or_register(&first, 0, A);
        ev.acquire_or_register(&second, 0, B);
        ev.set_event().unwrap();
        assert!(first.is_settled());
        assert!(!second.is_settled());
        assert!(!ev.is_signaled_for(A), "signal consumed by the first waiter");
    }

    #[test]
    fn manual_reset_event_wakes_all_waiters_and_stays_set() {
        let ev = event(true);
        let first = Arc::new(WaitBlock::new());
        let second = Arc::new(WaitBlock::new());
        ev.acquire_or_register(&first, 0, A);
        ev.acquire_or_register(&second, 0, B);
        ev.set_event().unwrap();
        assert!(first.is_settled() && second.is_settled());
        assert!(ev.is_signaled_for(A));
    }

    #[test]
    fn pulse_without_waiters_leaves_event_clear() {
        let ev = event(true);
        ev.pulse_event().unwrap();
        assert!(!ev.is_signaled_for(A));

        let block = Arc::new(WaitBlock::new());
        ev.acquire_or_register(&block, 0, A);
        ev.pulse_event().unwrap();
        assert!(block.is_settled());
        assert!(!ev.is_signaled_for(A));
    }

    #[test]
    fn settled_block_is_not_claimed_twice() {
        let ev = event(false);
        ev.set_event().unwrap();
        let block = Arc::new(WaitBlock::new());
        assert!(block.try_claim(7));
        assert_eq!(ev.acquire_or_register(&block, 0, A), Registration::Settled);
        assert!(ev.is_signaled_for(A), "signal must not be consumed");
    }

    #[test]
    fn thread_exit_is_recorded_once() {
        let thread = KernelObject::thread(A);
        assert!(thread.exit_code().is_none());
        assert!(thread.mark_exited(7));
        assert!(!thread.mark_exited(9));
        assert_eq!(thread.exit_code(), Some(7));
        assert!(thread.is_signaled_for(B));
    }

    #[test]
    fn wrong_kind_operation_is_a_type_mismatch() {
        let ev = event(false);
        let err = ev.release_semaphore(1).unwrap_err();
        assert!(err.is_host_code(host_code::TYPE_MISMATCH));
    }

    #[test]
    fn handle_count_never_underflows() {
        let ev = event(false);
        ev.open_handle();
        assert_eq!(ev.close_handle().unwrap(), 0);
        assert!(ev.close_handle().is_err());
    }
}
