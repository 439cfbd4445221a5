//! Kernel synchronization objects.
//!
//! # Primitives
//!
//! - [`Mutex`]: recursive, thread-owned lock
//! - [`Semaphore`]: counting semaphore with a fixed maximum
//! - [`Event`]: manual- or auto-reset event with pulse
//!
//! # Lifecycle
//!
//! Every wrapper starts empty, holding the invalid handle. It is populated
//! by `create`, `create_exclusive`, `open`, `open_or_create` or `duplicate`,
//! and emptied again by `close` (or on drop). Populating a wrapper that
//! already holds a live handle fails with
//! [`ErrorKind::AlreadyOpen`](crate::ErrorKind::AlreadyOpen) and leaves the
//! handle untouched. Actions on an empty wrapper fail with
//! [`ErrorKind::NotReady`](crate::ErrorKind::NotReady) without blocking.
//!
//! Wrappers given a name share the kernel object bound to that name with
//! every other wrapper of the same name. Named objects carry the fully
//! permissive access policy.

mod event;
mod lifecycle;
mod mutex;
mod semaphore;

pub use event::{Event, EventState, ResetMode};
pub use mutex::{Mutex, MutexGuard, MutexState};
pub use semaphore::Semaphore;
