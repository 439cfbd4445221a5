//! Lifecycle shared by every synchronization object wrapper.

use std::sync::Arc;

use crate::error::{fail, host_code, Error, ErrorKind, Result};
use crate::handle::WaitableHandle;
use crate::host::{self, KernelObject, ObjectKind, ObjectState};
use crate::tracing_compat::debug;

/// Whether a named create may open an object that already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Creation {
    OpenExisting,
    Exclusive,
}

/// A handle slot plus an optional name.
#[derive(Debug)]
pub(crate) struct SyncCore {
    kind: ObjectKind,
    name: Option<String>,
    handle: WaitableHandle,
}

impl SyncCore {
    pub(crate) const fn new(kind: ObjectKind, name: Option<String>) -> Self {
        Self {
            kind,
            name,
            handle: WaitableHandle::invalid(),
        }
    }

    pub(crate) fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub(crate) fn set_name(&mut self, name: impl Into<String>) -> Result<()> {
        self.ensure_closed()?;
        self.name = Some(name.into());
        Ok(())
    }

    pub(crate) const fn is_valid(&self) -> bool {
        self.handle.is_valid()
    }

    /// The handle, for waits that mix this object with others. May be the
    /// invalid sentinel.
    pub(crate) const fn raw_handle(&self) -> &WaitableHandle {
        &self.handle
    }

    /// The handle, failing with `NotReady` if it is invalid.
    pub(crate) fn handle(&self) -> Result<&WaitableHandle> {
        if self.handle.is_valid() {
            Ok(&self.handle)
        } else {
            fail(ErrorKind::NotReady)
        }
    }

    pub(crate) fn object(&self) -> Result<&Arc<KernelObject>> {
        match self.handle.object() {
            Some(object) => Ok(object),
            None => fail(ErrorKind::NotReady),
        }
    }

    fn ensure_closed(&self) -> Result<()> {
        if self.handle.is_valid() {
            fail(ErrorKind::AlreadyOpen)
        } else {
            Ok(())
        }
    }

    /// Creates the object. Named objects go through the namespace; returns
    /// true if a new kernel object was created.
    pub(crate) fn create(
        &mut self,
        initial: impl FnOnce() -> ObjectState,
        creation: Creation,
    ) -> Result<bool> {
        self.ensure_closed()?;
        let Some(name) = self.name.as_deref() else {
            self.handle = WaitableHandle::open(KernelObject::anonymous(initial()));
            debug!(kind = %self.kind, handle = self.handle.raw(), "created anonymous object");
            return Ok(true);
        };

        let (object, existed) = match host::create_or_open(name, self.kind, initial) {
            Ok(found) => found,
            Err(err) => return fail(err),
        };
        let mut handle = WaitableHandle::adopt(object);
        if existed && creation == Creation::Exclusive {
            let _ = handle.close();
            return fail(Error::new(ErrorKind::AlreadyExists)
                .with_host_code(host_code::ALREADY_EXISTS)
                .with_message(format!("{} {name:?} already exists", self.kind)));
        }
        debug!(
            kind = %self.kind,
            name,
            existed,
            handle = handle.raw(),
            "created named object"
        );
        self.handle = handle;
        Ok(!existed)
    }

    /// Opens the existing object bound to this wrapper's name.
    pub(crate) fn open(&mut self) -> Result<()> {
        self.ensure_closed()?;
        let Some(name) = self.name.as_deref() else {
            return fail(ErrorKind::NullName);
        };
        match host::open(name, self.kind) {
            Ok(object) => {
                self.handle = WaitableHandle::adopt(object);
                debug!(kind = %self.kind, name, handle = self.handle.raw(), "opened named object");
                Ok(())
            }
            Err(err) => fail(err),
        }
    }

    /// Opens the named object, creating it if the name is unbound. Returns
    /// true if this call created it.
    pub(crate) fn open_or_create(&mut self, initial: impl FnOnce() -> ObjectState) -> Result<bool> {
        self.ensure_closed()?;
        if self.name.is_none() {
            return self.create(initial, Creation::OpenExisting);
        }
        match self.open() {
            Ok(()) => Ok(false),
            Err(err) if err.is_host_code(host_code::NOT_FOUND) => {
                self.create(initial, Creation::OpenExisting)
            }
            Err(err) => Err(err),
        }
    }

    /// Closes this wrapper's handle and replaces it with a duplicate of
    /// `source`'s, taking over its name.
    pub(crate) fn duplicate_from(&mut self, source: &Self) -> Result<()> {
        self.close()?;
        self.name.clone_from(&source.name);
        self.handle = source.handle.duplicate()?;
        Ok(())
    }

    pub(crate) fn close(&mut self) -> Result<()> {
        self.handle.close()
    }
}
