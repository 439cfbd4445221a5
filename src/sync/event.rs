//! Kernel events.
//!
//! A manual-reset event stays triggered until [`Event::reset`]; every waiter
//! is released while it is set. An auto-reset event releases one waiter and
//! clears itself. [`Event::pulse`] releases the threads waiting at that
//! moment and leaves the event cleared.

use super::lifecycle::{Creation, SyncCore};
use crate::error::{fail, Result};
use crate::handle::WaitableHandle;
use crate::host::{ObjectKind, ObjectState};
use crate::tracing_compat::trace;
use crate::wait::{wait_checked, WaitMillis, WaitMode};

/// How an event clears after releasing a waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetMode {
    /// Clears itself after releasing one waiter.
    Auto,
    /// Stays triggered until reset.
    Manual,
}

/// Initial state of a newly created event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventState {
    /// Signaled.
    Triggered,
    /// Not signaled.
    Reset,
}

/// A kernel event wrapper.
#[derive(Debug)]
pub struct Event {
    core: SyncCore,
    mode: ResetMode,
}

impl Event {
    /// Creates an empty anonymous wrapper.
    #[must_use]
    pub const fn new(mode: ResetMode) -> Self {
        Self {
            core: SyncCore::new(ObjectKind::Event, None),
            mode,
        }
    }

    /// Creates an empty wrapper for the event named `name`.
    #[must_use]
    pub fn named(name: impl Into<String>, mode: ResetMode) -> Self {
        Self {
            core: SyncCore::new(ObjectKind::Event, Some(name.into())),
            mode,
        }
    }

    /// The reset mode given at construction.
    #[must_use]
    pub const fn reset_mode(&self) -> ResetMode {
        self.mode
    }

    /// The wrapper's name, if any.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.core.name()
    }

    /// Sets the name used by later `create`/`open` calls.
    pub fn set_name(&mut self, name: impl Into<String>) -> Result<()> {
        self.core.set_name(name)
    }

    /// Returns true if the wrapper holds a live handle.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.core.is_valid()
    }

    /// The underlying handle, for multi-handle waits.
    #[must_use]
    pub const fn handle(&self) -> &WaitableHandle {
        self.core.raw_handle()
    }

    fn initial_state(&self, state: EventState) -> ObjectState {
        ObjectState::Event {
            signaled: state == EventState::Triggered,
            manual_reset: self.mode == ResetMode::Manual,
        }
    }

    /// Creates the event, or opens it if an event with this name exists.
    pub fn create(&mut self, state: EventState) -> Result<()> {
        let initial = self.initial_state(state);
        self.core.create(|| initial, Creation::OpenExisting).map(drop)
    }

    /// Creates the event, failing with `AlreadyExists` if the name is taken.
    pub fn create_exclusive(&mut self, state: EventState) -> Result<()> {
        let initial = self.initial_state(state);
        self.core.create(|| initial, Creation::Exclusive).map(drop)
    }

    /// Opens the existing event with this wrapper's name.
    pub fn open(&mut self) -> Result<()> {
        self.core.open()
    }

    /// Opens the named event or creates it. Returns true if it was created.
    pub fn open_or_create(&mut self, state: EventState) -> Result<bool> {
        let initial = self.initial_state(state);
        self.core.open_or_create(|| initial)
    }

    /// Replaces this wrapper's handle with a duplicate of `source`'s.
    pub fn duplicate(&mut self, source: &Self) -> Result<()> {
        self.core.duplicate_from(&source.core)?;
        self.mode = source.mode;
        Ok(())
    }

    /// Closes the handle. Closing a closed wrapper succeeds.
    pub fn close(&mut self) -> Result<()> {
        self.core.close()
    }

    /// Sets the event.
    pub fn trigger(&self) -> Result<()> {
        let object = self.core.object()?;
        object.set_event().or_else(fail)?;
        trace!(handle = self.core.raw_handle().raw(), "event triggered");
        Ok(())
    }

    /// Clears the event.
    pub fn reset(&self) -> Result<()> {
        self.core.object()?.reset_event().or_else(fail)
    }

    /// Releases the threads waiting right now, then clears the event.
    pub fn pulse(&self) -> Result<()> {
        self.core.object()?.pulse_event().or_else(fail)
    }

    /// Waits up to `timeout` for the event.
    pub fn wait_for(&self, timeout: WaitMillis) -> Result<()> {
        let handle = self.core.handle()?;
        wait_checked(WaitMode::current(), &[handle], timeout).map(drop)
    }
}
