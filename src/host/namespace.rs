//! Process-wide named-object namespace.
//!
//! Named creation and opening happen under the namespace lock, as does the
//! close that releases the last handle of a named object, so a name is
//! always bound to at most one live object.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;

use super::object::{KernelObject, ObjectKind, ObjectState};
use crate::error::{host_code, Error, Result};
use crate::tracing_compat::trace;

/// Discretionary access policy attached to a kernel object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessPolicy {
    null_dacl: bool,
    inheritable: bool,
}

impl AccessPolicy {
    /// The policy given to anonymous objects: process-local, not inherited.
    #[must_use]
    pub const fn process_default() -> Self {
        Self {
            null_dacl: false,
            inheritable: false,
        }
    }

    /// The policy given to named objects: a null access list granting full
    /// access to any principal, inheritable by child processes.
    #[must_use]
    pub const fn permissive() -> Self {
        Self {
            null_dacl: true,
            inheritable: true,
        }
    }

    /// Returns true if any principal is granted full access.
    #[must_use]
    pub const fn grants_everyone(&self) -> bool {
        self.null_dacl
    }

    /// Returns true if handles to the object are inheritable.
    #[must_use]
    pub const fn is_inheritable(&self) -> bool {
        self.inheritable
    }
}

type Registry = Mutex<HashMap<String, Weak<KernelObject>>>;

fn registry() -> &'static Registry {
    static NAMES: OnceLock<Registry> = OnceLock::new();
    NAMES.get_or_init(|| Mutex::new(HashMap::new()))
}

fn live_entry(names: &HashMap<String, Weak<KernelObject>>, name: &str) -> Option<Arc<KernelObject>> {
    names
        .get(name)
        .and_then(Weak::upgrade)
        .filter(|object| object.handle_count() > 0)
}

fn check_kind(object: &KernelObject, expected: ObjectKind) -> Result<()> {
    let found = object.kind();
    if found == expected {
        Ok(())
    } else {
        Err(Error::host(host_code::TYPE_MISMATCH).with_message(format!(
            "name {:?} is bound to a {found}, not a {expected}",
            object.name().unwrap_or_default()
        )))
    }
}

/// Creates the named object, or opens it if the name is already bound.
///
/// The returned object already carries one open handle for the caller.
/// The flag is true if the object existed before this call.
pub(crate) fn create_or_open(
    name: &str,
    kind: ObjectKind,
    initial: impl FnOnce() -> ObjectState,
) -> Result<(Arc<KernelObject>, bool)> {
    let mut names = registry().lock();
    if let Some(object) = live_entry(&names, name) {
        check_kind(&object, kind)?;
        object.open_handle();
        trace!(name, kind = %kind, "opened existing named object");
        return Ok((object, true));
    }

    let object = KernelObject::named(initial(), name, AccessPolicy::permissive());
    object.open_handle();
    names.insert(name.to_string(), Arc::downgrade(&object));
    trace!(name, kind = %kind, serial = object.serial(), "created named object");
    Ok((object, false))
}

/// Opens an existing named object. The returned object carries one open
/// handle for the caller.
pub(crate) fn open(name: &str, kind: ObjectKind) -> Result<Arc<KernelObject>> {
    let names = registry().lock();
    let Some(object) = live_entry(&names, name) else {
        return Err(Error::host(host_code::NOT_FOUND)
            .with_message(format!("no object named {name:?}")));
    };
    check_kind(&object, kind)?;
    object.open_handle();
    Ok(object)
}

/// Releases one handle on `object`, unbinding its name when it was the last.
pub(crate) fn close_handle(object: &Arc<KernelObject>) -> Result<usize> {
    let Some(name) = object.name() else {
        return object.close_handle();
    };
    let mut names = registry().lock();
    let remaining = object.close_handle()?;
    if remaining == 0 {
        let bound_here = names
            .get(name)
            .is_some_and(|entry| Weak::ptr_eq(entry, &Arc::downgrade(object)));
        if bound_here {
            names.remove(name);
            trace!(name, "named object released");
        }
    }
    Ok(remaining)
}

#[cfg(test)]
fn is_bound(name: &str) -> bool {
    live_entry(&registry().lock(), name).is_some()
}
