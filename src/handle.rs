//! Owned handles to kernel wait-objects.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config;
use crate::error::{fail, host_code, Error, Result};
use crate::host::{self, AccessPolicy, KernelObject, ObjectKind};
use crate::tracing_compat::{trace, warn};

static NEXT_RAW: AtomicU64 = AtomicU64::new(1);

type CloseFailureHook = Arc<dyn Fn(u64, &Error) + Send + Sync>;

static CLOSE_FAILURE_HOOK: RwLock<Option<CloseFailureHook>> = parking_lot::const_rwlock(None);

/// Installs the process-wide hook that receives close failures raised while
/// dropping a handle, replacing the default diagnostic.
///
/// The hook receives the raw value of the handle and the failure.
pub fn set_close_failure_hook(hook: impl Fn(u64, &Error) + Send + Sync + 'static) {
    *CLOSE_FAILURE_HOOK.write() = Some(Arc::new(hook));
}

/// Restores the default close-failure diagnostic.
pub fn clear_close_failure_hook() {
    *CLOSE_FAILURE_HOOK.write() = None;
}

fn report_close_failure(raw: u64, err: &Error) {
    let hook = CLOSE_FAILURE_HOOK.read().clone();
    match hook {
        Some(hook) => hook(raw, err),
        None if config::current().close_diagnostics => {
            warn!(handle = raw, error = %err, "failed to close handle on drop");
        }
        None => {}
    }
}

/// An owned reference to one kernel wait-object.
///
/// Each handle carries a raw value that is never reused within the process,
/// so a closed handle can never alias a later one. Dropping a valid handle
/// closes it.
pub struct WaitableHandle {
    raw: u64,
    object: Option<Arc<KernelObject>>,
}

impl WaitableHandle {
    /// Returns the invalid sentinel handle.
    #[must_use]
    pub const fn invalid() -> Self {
        Self {
            raw: 0,
            object: None,
        }
    }

    /// Wraps an object whose handle count already includes this handle.
    pub(crate) fn adopt(object: Arc<KernelObject>) -> Self {
        let raw = NEXT_RAW.fetch_add(1, Ordering::Relaxed);
        trace!(handle = raw, serial = object.serial(), "handle opened");
        Self {
            raw,
            object: Some(object),
        }
    }

    /// Opens a new handle on `object`.
    pub(crate) fn open(object: Arc<KernelObject>) -> Self {
        object.open_handle();
        Self::adopt(object)
    }

    /// Returns true if the handle refers to a live object.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.object.is_some()
    }

    /// Returns the raw handle value, or 0 for the invalid sentinel.
    #[must_use]
    pub const fn raw(&self) -> u64 {
        self.raw
    }

    /// Returns the kind of the referenced object.
    #[must_use]
    pub fn kind(&self) -> Option<ObjectKind> {
        self.object.as_ref().map(|object| object.kind())
    }

    /// Returns the name of the referenced object, if it is named.
    #[must_use]
    pub fn object_name(&self) -> Option<&str> {
        self.object.as_ref().and_then(|object| object.name())
    }

    /// Returns the access policy of the referenced object.
    #[must_use]
    pub fn access_policy(&self) -> Option<AccessPolicy> {
        self.object.as_ref().map(|object| *object.access())
    }

    /// Returns true if both handles refer to the same kernel object.
    #[must_use]
    pub fn same_object(&self, other: &Self) -> bool {
        match (&self.object, &other.object) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub(crate) fn object(&self) -> Option<&Arc<KernelObject>> {
        self.object.as_ref()
    }

    /// Produces a second, independently closable handle to the same object.
    pub fn duplicate(&self) -> Result<Self> {
        match &self.object {
            Some(object) => Ok(Self::open(Arc::clone(object))),
            None => fail(invalid_handle("cannot duplicate an invalid handle")),
        }
    }

    /// Closes the handle.
    ///
    /// Closing an invalid handle succeeds. The handle is invalid afterwards
    /// even if the close failed.
    pub fn close(&mut self) -> Result<()> {
        let Some(object) = self.object.take() else {
            return Ok(());
        };
        let raw = std::mem::take(&mut self.raw);
        match host::close_handle(&object) {
            Ok(remaining) => {
                trace!(handle = raw, remaining, "handle closed");
                Ok(())
            }
            Err(err) => fail(err),
        }
    }
}

pub(crate) fn invalid_handle(message: &str) -> Error {
    Error::host(host_code::INVALID_HANDLE).with_message(message)
}

impl Default for WaitableHandle {
    fn default() -> Self {
        Self::invalid()
    }
}

impl fmt::Debug for WaitableHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.object {
            Some(object) => f
                .debug_struct("WaitableHandle")
                .field("raw", &self.raw)
                .field("object", object)
                .finish(),
            None => f.write_str("WaitableHandle(invalid)"),
        }
    }
}

impl Drop for WaitableHandle {
    fn drop(&mut self) {
        let raw = self.raw;
        if let Err(err) = self.close() {
            report_close_failure(raw, &err);
        }
    }
}
