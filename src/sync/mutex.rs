//! Kernel mutex: a recursive, thread-owned lock.
//!
//! The owning thread may lock again; every lock needs a matching unlock,
//! and only the owner may unlock.
//!
//! # Example
//!
//! ```
//! use hostsync::sync::{Mutex, MutexState};
//! use hostsync::WaitMillis;
//!
//! let mut mutex = Mutex::new();
//! mutex.create(MutexState::Unlocked)?;
//! {
//!     let _guard = mutex.lock_guard(WaitMillis::INFINITE)?;
//!     // critical section
//! }
//! mutex.close()?;
//! # Ok::<(), hostsync::Error>(())
//! ```

use super::lifecycle::{Creation, SyncCore};
use crate::error::{fail, Result};
use crate::handle::WaitableHandle;
use crate::host::{ObjectKind, ObjectState};
use crate::per_thread;
use crate::tracing_compat::trace;
use crate::wait::{wait_checked, WaitMillis, WaitMode};

/// Initial ownership of a newly created mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexState {
    /// Owned by the creating thread.
    Locked,
    /// Not owned.
    Unlocked,
}

impl MutexState {
    fn into_object_state(self) -> ObjectState {
        match self {
            Self::Locked => ObjectState::Mutex {
                owner: Some(per_thread::tid_caller()),
                recursion: 1,
            },
            Self::Unlocked => ObjectState::Mutex {
                owner: None,
                recursion: 0,
            },
        }
    }
}

/// A kernel mutex wrapper.
#[derive(Debug)]
pub struct Mutex {
    core: SyncCore,
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl Mutex {
    /// Creates an empty anonymous wrapper; call [`create`](Self::create).
    #[must_use]
    pub const fn new() -> Self {
        Self {
            core: SyncCore::new(ObjectKind::Mutex, None),
        }
    }

    /// Creates an empty wrapper for the mutex named `name`.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            core: SyncCore::new(ObjectKind::Mutex, Some(name.into())),
        }
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

    /// Creates the mutex, or opens it if a mutex with this name exists.
    pub fn create(&mut self, state: MutexState) -> Result<()> {
        self.core
            .create(|| state.into_object_state(), Creation::OpenExisting)
            .map(drop)
    }

    /// Creates the mutex, failing with `AlreadyExists` if the name is taken.
    pub fn create_exclusive(&mut self, state: MutexState) -> Result<()> {
        self.core
            .create(|| state.into_object_state(), Creation::Exclusive)
            .map(drop)
    }

    /// Opens the existing mutex with this wrapper's name.
    pub fn open(&mut self) -> Result<()> {
        self.core.open()
    }

    /// Opens the named mutex or creates it. Returns true if it was created.
    pub fn open_or_create(&mut self, state: MutexState) -> Result<bool> {
        self.core.open_or_create(|| state.into_object_state())
    }

    /// Replaces this wrapper's handle with a duplicate of `source`'s.
    pub fn duplicate(&mut self, source: &Self) -> Result<()> {
        self.core.duplicate_from(&source.core)
    }

    /// Closes the handle. Closing a closed wrapper succeeds.
    pub fn close(&mut self) -> Result<()> {
        self.core.close()
    }

    /// Acquires the mutex, waiting up to `timeout`.
    pub fn lock(&self, timeout: WaitMillis) -> Result<()> {
        let handle = self.core.handle()?;
        wait_checked(WaitMode::current(), &[handle], timeout)?;
        trace!(handle = handle.raw(), "mutex locked");
        Ok(())
    }

    /// Releases one level of ownership held by the calling thread.
    pub fn unlock(&self) -> Result<()> {
        let object = self.core.object()?;
        match object.release_mutex(per_thread::tid_caller()) {
            Ok(()) => Ok(()),
            Err(err) => fail(err),
        }
    }

    /// Acquires the mutex and returns a guard that unlocks it on drop.
    pub fn lock_guard(&self, timeout: WaitMillis) -> Result<MutexGuard<'_>> {
        self.lock(timeout)?;
        Ok(MutexGuard { mutex: self })
    }
}

/// Holds one level of ownership of a [`Mutex`] until dropped.
#[must_use = "the mutex is unlocked as soon as the guard is dropped"]
#[derive(Debug)]
pub struct MutexGuard<'a> {
    mutex: &'a Mutex,
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.mutex.unlock() {
            trace!(error = %err, "mutex guard failed to unlock");
        }
    }
}
