//! Kernel thread records.
//!
//! A [`KernelThread`] moves through `NotStarted → Running → Dead` and never
//! back. [`KernelThread::begin`] starts the OS thread suspended, records its
//! id and handle, and only then lets it run, so the new thread can never
//! observe its own record half-filled.
//!
//! Death is observed through the wait dispatcher. Once observed, the record's
//! thread id becomes [`ThreadId::INVALID`] and later liveness queries return
//! without waiting. The handle is kept so the exit code stays available.
//!
//! Each thread object also carries a [`Priority`]. Threads start at
//! [`Priority::Normal`]; the level is shared by every record of the thread.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use crate::config;
use crate::error::{fail, Error, ErrorKind, Result};
use crate::handle::WaitableHandle;
use crate::host::{KernelObject, ThreadControl};
use crate::message::MessagePoster;
use crate::per_thread::{self, ThreadId};
use crate::sync::Event;
use crate::tracing_compat::{debug, warn};
use crate::wait::{wait_handles, wait_handles_with, WaitMillis, WaitMode, WaitOutcome};

/// Exit code recorded for a thread whose entry function panicked.
pub const EXIT_PANICKED: u32 = 101;

/// Scheduling priority levels a thread may be set to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Priority {
    /// Lowest supported level.
    Lowest = 0,
    /// Below normal.
    BelowNormal = 1,
    /// The level every thread starts at.
    #[default]
    Normal = 2,
    /// Above normal.
    AboveNormal = 3,
    /// Highest supported level.
    Highest = 4,
}

impl Priority {
    /// All levels, lowest first.
    pub const ALL: [Self; 5] = [
        Self::Lowest,
        Self::BelowNormal,
        Self::Normal,
        Self::AboveNormal,
        Self::Highest,
    ];

    /// Returns the raw level, 0 (lowest) to 4 (highest).
    #[must_use]
    pub const fn as_raw(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for Priority {
    type Error = Error;

    /// Fails with [`ErrorKind::InvalidPriority`] for values above 4.
    fn try_from(raw: u8) -> Result<Self> {
        match Self::ALL.get(usize::from(raw)) {
            Some(priority) => Ok(*priority),
            None => fail(
                Error::new(ErrorKind::InvalidPriority)
                    .with_message(format!("no priority level {raw}")),
            ),
        }
    }
}

/// Result of [`KernelThread::wait_for_death`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeathStatus {
    /// The thread has exited with this code.
    Dead {
        /// The thread's exit code.
        exit_code: u32,
    },
    /// The thread was still running when the wait ended.
    StillRunning,
}

impl DeathStatus {
    /// Returns true for [`DeathStatus::Dead`].
    #[must_use]
    pub const fn is_dead(&self) -> bool {
        matches!(self, Self::Dead { .. })
    }
}

/// Result of [`KernelThread::wait_event_or_death`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOrDeath {
    /// The thread exited.
    Died,
    /// The event was signaled.
    EventTriggered,
    /// Neither happened within the timeout.
    TimedOut,
}

/// A kernel thread record.
#[derive(Debug)]
pub struct KernelThread {
    handle: WaitableHandle,
    tid: AtomicU64,
    name: Option<String>,
}

impl Default for KernelThread {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelThread {
    /// Creates an empty, not-started record.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            handle: WaitableHandle::invalid(),
            tid: AtomicU64::new(0),
            name: None,
        }
    }

    /// Returns a record for the calling thread.
    #[must_use]
    pub fn current() -> Self {
        let mut record = Self::new();
        record.fill_from_caller();
        record
    }

    /// Points this empty record at the calling thread.
    pub fn adopt_caller(&mut self) -> Result<()> {
        if self.handle.is_valid() {
            return fail(ErrorKind::AlreadyStarted);
        }
        self.fill_from_caller();
        Ok(())
    }

    fn fill_from_caller(&mut self) {
        self.handle = WaitableHandle::open(per_thread::current_object());
        self.tid
            .store(per_thread::tid_caller().as_u64(), Ordering::Release);
        self.name = thread::current().name().map(str::to_string);
    }

    /// Starts a new thread running `entry`.
    ///
    /// A `stack_size` of 0 selects the configured default. Without a name
    /// the thread is called `{prefix}-{tid}`. The value returned by `entry`
    /// becomes the exit code; a panic exits with [`EXIT_PANICKED`].
    pub fn begin<F>(&mut self, name: Option<&str>, stack_size: usize, entry: F) -> Result<()>
    where
        F: FnOnce() -> u32 + Send + 'static,
    {
        if self.handle.is_valid() {
            return fail(ErrorKind::AlreadyStarted);
        }
        let config = config::current();
        let tid = ThreadId::allocate();
        let object = KernelObject::thread(tid);
        let name = name.map_or_else(
            || format!("{}-{}", config.thread_name_prefix, tid.as_u64()),
            str::to_string,
        );
        let stack_size = if stack_size == 0 {
            config.thread_stack_size
        } else {
            stack_size
        };

        let child = Arc::clone(&object);
        let spawned = thread::Builder::new()
            .name(name.clone())
            .stack_size(stack_size)
            .spawn(move || run_thread(tid, &child, entry));
        if let Err(err) = spawned {
            return fail(Error::from_io(&err).with_message(format!("failed to start {name}: {err}")));
        }

        self.handle = WaitableHandle::open(Arc::clone(&object));
        self.tid.store(tid.as_u64(), Ordering::Release);
        self.name = Some(name);
        debug!(
            tid = %tid,
            name = self.name.as_deref().unwrap_or_default(),
            stack_size,
            "thread started"
        );
        if let Some(control) = object.thread_control() {
            control.release_start();
        }
        Ok(())
    }

    /// The thread's id, or [`ThreadId::INVALID`] once death was observed.
    #[must_use]
    pub fn tid(&self) -> ThreadId {
        ThreadId::from_raw(self.tid.load(Ordering::Acquire))
    }

    /// The thread's name, if known.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// The thread's handle, for multi-handle waits.
    #[must_use]
    pub const fn handle(&self) -> &WaitableHandle {
        &self.handle
    }

    /// Returns true if the calling thread is the thread this record refers
    /// to.
    #[must_use]
    pub fn is_caller(&self) -> bool {
        let tid = self.tid();
        tid.is_valid() && tid == per_thread::tid_caller()
    }

    /// Marks the thread as no longer running without waiting on it.
    pub fn set_not_running(&self) {
        self.tid.store(ThreadId::INVALID.as_u64(), Ordering::Release);
    }

    /// Releases this record's handle without affecting the thread itself.
    pub fn orphan(&mut self) -> Result<()> {
        self.set_not_running();
        self.name = None;
        self.handle.close()
    }

    /// Returns a second record for the same thread with its own handle.
    pub fn duplicate(&self) -> Result<Self> {
        Ok(Self {
            handle: self.handle.duplicate()?,
            tid: AtomicU64::new(self.tid.load(Ordering::Acquire)),
            name: self.name.clone(),
        })
    }

    /// Returns a poster for the thread's message queue.
    pub fn poster(&self) -> Result<MessagePoster> {
        let control = self.control()?;
        Ok(MessagePoster::new(control.tid(), Arc::clone(control.queue())))
    }

    /// The thread's current priority.
    pub fn priority(&self) -> Result<Priority> {
        Self::priority_of(self)
    }

    /// Returns the priority of the thread `thread` refers to.
    pub fn priority_of(thread: &Self) -> Result<Priority> {
        Ok(thread.control()?.priority())
    }

    /// Sets the thread's priority. Every record of the thread sees the new
    /// level.
    pub fn set_priority(&self, priority: Priority) -> Result<()> {
        let control = self.control()?;
        control.set_priority(priority);
        debug!(tid = %control.tid(), ?priority, "thread priority set");
        Ok(())
    }

    fn object(&self) -> Result<&Arc<KernelObject>> {
        match self.handle.object() {
            Some(object) => Ok(object),
            None => fail(ErrorKind::NotReady),
        }
    }

    fn control(&self) -> Result<&ThreadControl> {
        match self.object()?.thread_control() {
            Some(control) => Ok(control),
            None => fail(ErrorKind::NotReady),
        }
    }

    /// Suspends the calling thread until [`unblock`](Self::unblock).
    ///
    /// Must be called by the thread this record refers to. An `unblock` that
    /// arrived earlier is consumed at once.
    pub fn block_self(&self) -> Result<()> {
        if !self.is_caller() {
            return fail(ErrorKind::NotThisThread);
        }
        self.control()?.block();
        Ok(())
    }

    /// Releases the thread from [`block_self`](Self::block_self).
    pub fn unblock(&self) -> Result<()> {
        self.control()?.unblock();
        Ok(())
    }

    fn observe_death(&self) {
        self.set_not_running();
    }

    /// Returns true until the thread's death has been observed.
    #[must_use]
    pub fn is_running(&self) -> bool {
        if !self.handle.is_valid() || !self.tid().is_valid() {
            return false;
        }
        match wait_handles_with(WaitMode::Worker, &[&self.handle], WaitMillis::ZERO) {
            WaitOutcome::Signaled { .. } => {
                self.observe_death();
                false
            }
            WaitOutcome::Timeout => true,
            WaitOutcome::Error(_) => false,
        }
    }

    /// Waits up to `timeout` for the thread to exit.
    ///
    /// A timeout is reported as [`DeathStatus::StillRunning`], not as an
    /// error.
    pub fn wait_for_death(&self, timeout: WaitMillis) -> Result<DeathStatus> {
        let object = self.object()?;
        match wait_handles(&[&self.handle], timeout) {
            WaitOutcome::Signaled { .. } => {
                self.observe_death();
                let exit_code = object.exit_code().unwrap_or_default();
                debug!(exit_code, name = self.name().unwrap_or_default(), "thread death observed");
                Ok(DeathStatus::Dead { exit_code })
            }
            WaitOutcome::Timeout => Ok(DeathStatus::StillRunning),
            WaitOutcome::Error(err) => Err(err),
        }
    }

    /// Waits up to `timeout` for either `event` or the thread's death.
    pub fn wait_event_or_death(&self, event: &Event, timeout: WaitMillis) -> Result<EventOrDeath> {
        self.object()?;
        if !event.is_valid() {
            return fail(ErrorKind::NotReady);
        }
        match wait_handles(&[&self.handle, event.handle()], timeout) {
            WaitOutcome::Signaled { index: 0 } => {
                self.observe_death();
                Ok(EventOrDeath::Died)
            }
            WaitOutcome::Signaled { .. } => Ok(EventOrDeath::EventTriggered),
            WaitOutcome::Timeout => Ok(EventOrDeath::TimedOut),
            WaitOutcome::Error(err) => Err(err),
        }
    }

    /// Returns the exit code of a thread that has exited.
    pub fn query_exit_code(&self) -> Result<u32> {
        match self.object()?.exit_code() {
            Some(code) => {
                self.observe_death();
                Ok(code)
            }
            None => fail(ErrorKind::StillRunning),
        }
    }
}

fn run_thread<F>(tid: ThreadId, object: &Arc<KernelObject>, entry: F)
where
    F: FnOnce() -> u32,
{
    per_thread::install(tid, Arc::clone(object));
    if let Some(control) = object.thread_control() {
        control.wait_for_start();
    }
    let exit_code = match panic::catch_unwind(AssertUnwindSafe(entry)) {
        Ok(code) => code,
        Err(_) => {
            warn!(tid = %tid, "thread entry panicked");
            EXIT_PANICKED
        }
    };
    object.mark_exited(exit_code);
    debug!(tid = %tid, exit_code, "thread exited");
}
