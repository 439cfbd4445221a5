//! Kernel counting semaphore.
//!
//! A semaphore is constructed with a fixed maximum count that bounds every
//! later release. [`Semaphore::enter`] takes one unit, waiting if none is
//! available; [`Semaphore::exit`] returns one.

use super::lifecycle::{Creation, SyncCore};
use crate::error::{fail, host_code, Error, Result};
use crate::handle::WaitableHandle;
use crate::host::{ObjectKind, ObjectState};
use crate::tracing_compat::trace;
use crate::wait::{wait_checked, WaitMillis, WaitMode};

/// A kernel counting semaphore wrapper.
#[derive(Debug)]
pub struct Semaphore {
    core: SyncCore,
    max_count: u32,
}

impl Semaphore {
    /// Creates an empty anonymous wrapper with the given maximum count.
    #[must_use]
    pub const fn new(max_count: u32) -> Self {
        Self {
            core: SyncCore::new(ObjectKind::Semaphore, None),
            max_count,
        }
    }

    /// Creates an empty wrapper for the semaphore named `name`.
    #[must_use]
    pub fn named(name: impl Into<String>, max_count: u32) -> Self {
        Self {
            core: SyncCore::new(ObjectKind::Semaphore, Some(name.into())),
            max_count,
        }
    }

    /// The maximum count. Once a handle is open this is the object's own
    /// maximum, which may differ from the one given at construction.
    #[must_use]
    pub const fn max_count(&self) -> u32 {
        self.max_count
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

    fn initial_state(&self, initial_count: u32) -> Result<ObjectState> {
        if self.max_count == 0 || initial_count > self.max_count {
            return fail(Error::host(host_code::INVALID_PARAMETER).with_message(format!(
                "initial count {initial_count} outside 0..={}",
                self.max_count
            )));
        }
        Ok(ObjectState::Semaphore {
            count: initial_count,
            max: self.max_count,
        })
    }

    /// Creates the semaphore with `initial_count` units available, or opens
    /// it if a semaphore with this name exists.
    pub fn create(&mut self, initial_count: u32) -> Result<()> {
        let state = self.initial_state(initial_count)?;
        let created = self.core.create(|| state, Creation::OpenExisting)?;
        if !created {
            self.adopt_object_max()?;
        }
        Ok(())
    }

    /// Creates the semaphore, failing with `AlreadyExists` if the name is
    /// taken.
    pub fn create_exclusive(&mut self, initial_count: u32) -> Result<()> {
        let state = self.initial_state(initial_count)?;
        self.core.create(|| state, Creation::Exclusive).map(drop)
    }

    /// Opens the existing semaphore with this wrapper's name.
    pub fn open(&mut self) -> Result<()> {
        self.core.open()?;
        self.adopt_object_max()
    }

    /// Opens the named semaphore or creates it. Returns true if it was
    /// created.
    pub fn open_or_create(&mut self, initial_count: u32) -> Result<bool> {
        let state = self.initial_state(initial_count)?;
        let created = self.core.open_or_create(|| state)?;
        if !created {
            self.adopt_object_max()?;
        }
        Ok(created)
    }

    // An opened semaphore keeps the maximum it was created with.
    fn adopt_object_max(&mut self) -> Result<()> {
        if let Some(max) = self.core.object()?.semaphore_max() {
            self.max_count = max;
        }
        Ok(())
    }

    /// Replaces this wrapper's handle with a duplicate of `source`'s.
    pub fn duplicate(&mut self, source: &Self) -> Result<()> {
        self.core.duplicate_from(&source.core)?;
        self.max_count = source.max_count;
        Ok(())
    }

    /// Closes the handle. Closing a closed wrapper succeeds.
    pub fn close(&mut self) -> Result<()> {
        self.core.close()
    }

    /// Takes one unit, waiting up to `timeout`.
    pub fn enter(&self, timeout: WaitMillis) -> Result<()> {
        let handle = self.core.handle()?;
        wait_checked(WaitMode::current(), &[handle], timeout)?;
        trace!(handle = handle.raw(), "semaphore entered");
        Ok(())
    }

    /// Returns one unit. Fails with a host error if the count is already at
    /// its maximum.
    pub fn exit(&self) -> Result<()> {
        let object = self.core.object()?;
        match object.release_semaphore(1) {
            Ok(previous) => {
                trace!(previous, "semaphore exited");
                Ok(())
            }
            Err(err) => fail(err),
        }
    }
}
