//! The multi-handle wait dispatcher.
//!
//! Every blocking operation in the crate funnels through
//! [`wait_handles_with`]. A worker thread gets a plain blocking wait. An
//! owning thread waits for its handles *or* a pending message; each message
//! wake services exactly one message and the wait resumes with the remaining
//! budget. A quit message seen during the wait is held back and re-posted
//! when the wait returns, so the thread's own message loop still sees it.
//!
//! # Timeouts
//!
//! Timeouts are [`WaitMillis`] values. [`WaitMillis::ZERO`] polls once
//! without blocking. [`WaitMillis::INFINITE`] never expires and takes no
//! part in deadline arithmetic.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use smallvec::SmallVec;

use crate::error::{host_code, set_last_error, Error, ErrorKind, Result};
use crate::handle::{invalid_handle, WaitableHandle};
use crate::host::{wait_any, HostWait, KernelObject};
use crate::message::{dispatch_message, Message, MessageQueue};
use crate::per_thread;
use crate::tracing_compat::{trace, warn};

/// Maximum number of handles a single wait accepts.
pub const MAX_WAIT_HANDLES: usize = 64;

/// A wait timeout in milliseconds, with a reserved infinite value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WaitMillis(u32);

impl WaitMillis {
    /// Never time out.
    pub const INFINITE: Self = Self(u32::MAX);
    /// Poll without blocking.
    pub const ZERO: Self = Self(0);

    /// Builds a timeout from milliseconds. `u32::MAX` is [`Self::INFINITE`].
    #[must_use]
    pub const fn from_millis(ms: u32) -> Self {
        Self(ms)
    }

    /// Returns the raw millisecond value.
    #[must_use]
    pub const fn as_millis(self) -> u32 {
        self.0
    }

    /// Returns true for [`Self::INFINITE`].
    #[must_use]
    pub const fn is_infinite(self) -> bool {
        self.0 == u32::MAX
    }

    /// Returns the finite budget, or `None` when infinite.
    #[must_use]
    pub fn as_duration(self) -> Option<Duration> {
        if self.is_infinite() {
            None
        } else {
            Some(Duration::from_millis(u64::from(self.0)))
        }
    }
}

impl From<u32> for WaitMillis {
    fn from(ms: u32) -> Self {
        Self(ms)
    }
}

impl From<Duration> for WaitMillis {
    /// Converts a duration, saturating just below [`WaitMillis::INFINITE`].
    fn from(duration: Duration) -> Self {
        let ms = u32::try_from(duration.as_millis()).unwrap_or(u32::MAX);
        Self(ms.min(u32::MAX - 1))
    }
}

impl fmt::Display for WaitMillis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_infinite() {
            f.write_str("infinite")
        } else {
            write!(f, "{}ms", self.0)
        }
    }
}

/// How a wait treats the calling thread's message queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    /// Block on the handles only.
    Worker,
    /// Also wake for pending messages and service them one at a time.
    Owning,
}

impl WaitMode {
    /// The mode implied by the calling thread's owning-thread flag.
    #[must_use]
    pub fn current() -> Self {
        if per_thread::is_caller_owning_thread() {
            Self::Owning
        } else {
            Self::Worker
        }
    }
}

/// Result of a wait. Exactly one variant is produced per call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The handle at `index` was signaled.
    Signaled {
        /// Position of the signaled handle in the wait set.
        index: usize,
    },
    /// The budget elapsed first.
    Timeout,
    /// The wait failed.
    Error(Error),
}

impl WaitOutcome {
    /// Returns the signaled index, if any.
    #[must_use]
    pub const fn signaled_index(&self) -> Option<usize> {
        match self {
            Self::Signaled { index } => Some(*index),
            _ => None,
        }
    }

    /// Returns true for [`WaitOutcome::Timeout`].
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    /// Converts into a `Result`, mapping a timeout to [`ErrorKind::Timeout`].
    pub fn into_result(self) -> Result<usize> {
        match self {
            Self::Signaled { index } => Ok(index),
            Self::Timeout => Err(Error::new(ErrorKind::Timeout)),
            Self::Error(err) => Err(err),
        }
    }
}

/// Waits on `handles` using the calling thread's [`WaitMode`].
pub fn wait_handles(handles: &[&WaitableHandle], timeout: WaitMillis) -> WaitOutcome {
    wait_handles_with(WaitMode::current(), handles, timeout)
}

/// Waits until one of `handles` is signaled or `timeout` elapses.
///
/// If several handles are signaled, the lowest index is reported. A timeout
/// or failure is also recorded on the calling thread's last-error channel.
pub fn wait_handles_with(
    mode: WaitMode,
    handles: &[&WaitableHandle],
    timeout: WaitMillis,
) -> WaitOutcome {
    let outcome = match resolve(handles) {
        Ok(objects) => run(&objects, timeout, mode, false),
        Err(err) => WaitOutcome::Error(err),
    };
    match &outcome {
        WaitOutcome::Signaled { .. } => {}
        WaitOutcome::Timeout => set_last_error(&Error::new(ErrorKind::Timeout)),
        WaitOutcome::Error(err) => set_last_error(err),
    }
    outcome
}

/// Waits on a single handle. A timeout is returned as [`ErrorKind::Timeout`].
pub fn wait_handle(handle: &WaitableHandle, timeout: WaitMillis) -> Result<()> {
    wait_handles(&[handle], timeout).into_result().map(|_| ())
}

/// Suspends the calling thread for `timeout`.
///
/// An owning thread keeps servicing its message queue while it sleeps; a
/// quit message ends the sleep early and is re-posted.
pub fn sleep(timeout: WaitMillis) {
    match WaitMode::current() {
        WaitMode::Owning => {
            let _ = run(&[], timeout, WaitMode::Owning, true);
        }
        WaitMode::Worker => match timeout.as_duration() {
            Some(duration) => std::thread::sleep(duration),
            None => loop {
                std::thread::park();
            },
        },
    }
}

type ObjectSet<'a> = SmallVec<[&'a Arc<KernelObject>; 8]>;

fn resolve<'a>(handles: &[&'a WaitableHandle]) -> Result<ObjectSet<'a>> {
    if handles.len() > MAX_WAIT_HANDLES {
        return Err(Error::new(ErrorKind::MaxWaitHandles).with_message(format!(
            "{} handles exceed the limit of {MAX_WAIT_HANDLES}",
            handles.len()
        )));
    }
    if handles.is_empty() {
        return Err(Error::host(host_code::INVALID_PARAMETER).with_message("empty wait set"));
    }
    handles
        .iter()
        .enumerate()
        .map(|(index, handle)| {
            handle
                .object()
                .ok_or_else(|| invalid_handle(&format!("handle {index} in the wait set is invalid")))
        })
        .collect()
}

fn run(
    objects: &[&Arc<KernelObject>],
    timeout: WaitMillis,
    mode: WaitMode,
    stop_on_quit: bool,
) -> WaitOutcome {
    let caller = per_thread::tid_caller();
    let queue = match mode {
        WaitMode::Owning => Some(per_thread::current_queue()),
        WaitMode::Worker => None,
    };
    let deadline = timeout
        .as_duration()
        .and_then(|budget| Instant::now().checked_add(budget));
    trace!(
        count = objects.len(),
        timeout = %timeout,
        mode = ?mode,
        tid = %caller,
        "entering wait"
    );

    let mut held_quit: Option<i32> = None;
    let outcome = loop {
        let budget = deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()));
        match wait_any(objects, budget, queue.as_deref(), caller) {
            HostWait::Object(index) => break WaitOutcome::Signaled { index },
            HostWait::Message => {
                if let Some(queue) = queue.as_deref() {
                    if service_one(queue, &mut held_quit) && stop_on_quit {
                        break WaitOutcome::Timeout;
                    }
                }
            }
            HostWait::Timeout => {
                if deadline.is_some() {
                    break WaitOutcome::Timeout;
                }
                // Hosts have been seen to report a timeout during an
                // infinite wait. Treat it as spurious and wait again.
                warn!(tid = %caller, "spurious timeout during infinite wait");
            }
        }
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            break WaitOutcome::Timeout;
        }
    };

    if let (Some(code), Some(queue)) = (held_quit, queue.as_deref()) {
        trace!(code, tid = %caller, "re-posting held quit message");
        queue.push(Message::Quit(code));
    }
    trace!(outcome = ?outcome, tid = %caller, "wait finished");
    outcome
}

/// Takes one message off `queue` and services it. A quit message is held in
/// `held_quit` rather than dispatched; repeated quits collapse into the
/// first. Returns true if the message was a quit.
fn service_one(queue: &MessageQueue, held_quit: &mut Option<i32>) -> bool {
    match queue.pop() {
        Some(Message::Quit(code)) => {
            held_quit.get_or_insert(code);
            true
        }
        Some(message) => {
            dispatch_message(message);
            false
        }
        None => false,
    }
}

/// Waits on `handles`, failing with [`ErrorKind::Timeout`] on timeout.
pub(crate) fn wait_checked(
    mode: WaitMode,
    handles: &[&WaitableHandle],
    timeout: WaitMillis,
) -> Result<usize> {
    wait_handles_with(mode, handles, timeout).into_result()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::last_error;
    use crate::host::ObjectState;
    use crate::message::{pending_messages, peek_message, post_message, post_quit_message};

    fn event_handle(signaled: bool) -> WaitableHandle {
        WaitableHandle::open(KernelObject::anonymous(ObjectState::Event {
            signaled,
            manual_reset: false,
        }))
    }

    #[test]
    fn wait_millis_conversions() {
        assert!(WaitMillis::INFINITE.is_infinite());
        assert_eq!(WaitMillis::INFINITE.as_duration(), None);
        assert_eq!(WaitMillis::ZERO.as_duration(), Some(Duration::ZERO));
        assert_eq!(
            WaitMillis::from(Duration::from_secs(u64::MAX)),
            WaitMillis::from_millis(u32::MAX - 1)
        );
        assert_eq!(WaitMillis::from(Duration::from_millis(250)).as_millis(), 250);
        assert_eq!(WaitMillis::INFINITE.to_string(), "infinite");
        assert_eq!(WaitMillis::from_millis(5).to_string(), "5ms");
    }

    #[test]
    fn too_many_handles_fail_before_waiting() {
        let handles: Vec<_> = (0..=MAX_WAIT_HANDLES).map(|_| event_handle(true)).collect();
        let refs: Vec<_> = handles.iter().collect();
        let outcome = wait_handles_with(WaitMode::Worker, &refs, WaitMillis::INFINITE);
        match outcome {
            WaitOutcome::Error(err) => assert_eq!(err.kind(), ErrorKind::MaxWaitHandles),
            other => panic!("expected MaxWaitHandles, got {other:?}"),
        }
        let untouched = handles.iter().all(|handle| {
            handle
                .object()
                .is_some_and(|object| object.is_signaled_for(per_thread::tid_caller()))
        });
        assert!(untouched, "no signal may be consumed");
    }

    #[test]
    fn invalid_handle_in_set_is_a_host_error() {
        let live = event_handle(true);
        let dead = WaitableHandle::invalid();
        let outcome = wait_handles_with(WaitMode::Worker, &[&live, &dead], WaitMillis::ZERO);
        match outcome {
            WaitOutcome::Error(err) => assert!(err.is_host_code(host_code::INVALID_HANDLE)),
            other => panic!("expected invalid handle, got {other:?}"),
        }
    }

    #[test]
    fn empty_set_is_rejected() {
        let outcome = wait_handles_with(WaitMode::Worker, &[], WaitMillis::ZERO);
        assert!(matches!(outcome, WaitOutcome::Error(err) if err.is_host_code(host_code::INVALID_PARAMETER)));
    }

    #[test]
    fn zero_timeout_polls_and_records_timeout() {
        let handle = event_handle(false);
        let start = Instant::now();
        let outcome = wait_handles_with(WaitMode::Worker, &[&handle], WaitMillis::ZERO);
        assert!(outcome.is_timeout());
        assert!(start.elapsed() < Duration::from_millis(50));
        assert_eq!(last_error().map(|err| err.kind()), Some(ErrorKind::Timeout));
    }

    #[test]
    fn wait_handle_maps_timeout_to_error_kind() {
        let handle = event_handle(false);
        let err = wait_handle(&handle, WaitMillis::from_millis(5)).unwrap_err();
        assert!(err.is_timeout());
        let signaled = event_handle(true);
        assert!(wait_handle(&signaled, WaitMillis::ZERO).is_ok());
    }

    #[test]
    fn owning_wait_services_messages_and_reposts_quit() {
        std::thread::spawn(|| {
            per_thread::mark_as_owning_thread();
            let served = Arc::new(std::sync::atomic::AtomicUsize::new(0));
            for _ in 0..3 {
                let served = Arc::clone(&served);
                post_message(Message::call(move || {
                    served.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                }));
            }
            post_quit_message(42);

            let handle = event_handle(false);
            let outcome = wait_handles(&[&handle], WaitMillis::from_millis(30));
            assert!(outcome.is_timeout());
            assert_eq!(served.load(std::sync::atomic::Ordering::SeqCst), 3);
            assert_eq!(pending_messages(), 1);
            assert!(matches!(peek_message(), Some(Message::Quit(42))));
        })
        .join()
        .expect("join");
    }

    #[test]
    fn worker_wait_leaves_messages_alone() {
        std::thread::spawn(|| {
            post_message(Message::User { id: 1, param: 1 });
            let handle = event_handle(false);
            let outcome = wait_handles(&[&handle], WaitMillis::from_millis(5));
            assert!(outcome.is_timeout());
            assert_eq!(pending_messages(), 1);
        })
        .join()
        .expect("join");
    }

    #[test]
    fn owning_sleep_ends_on_quit() {
        std::thread::spawn(|| {
            per_thread::mark_as_owning_thread();
            post_quit_message(1);
            let start = Instant::now();
            sleep(WaitMillis::INFINITE);
            assert!(start.elapsed() < Duration::from_secs(5));
            assert!(matches!(peek_message(), Some(Message::Quit(1))));
        })
        .join()
        .expect("join");
    }
}
