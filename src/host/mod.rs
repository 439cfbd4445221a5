//! In-process model of the host kernel.
//!
//! Everything above this module treats kernel objects as opaque: it holds
//! handles, asks the host to signal objects, and blocks through
//! [`wait_any`]. The model supplies the semantics the rest of the crate
//! relies on:
//!
//! - a signal is handed to exactly one eligible waiter (or to all of them
//!   for manual-reset events and exited threads), in FIFO order;
//! - a signal that arrives between checking and blocking is never lost;
//! - named objects live in a process-wide namespace until their last handle
//!   is closed.

mod namespace;
mod object;
mod wait;
mod wait_block;

pub use namespace::AccessPolicy;
pub use object::ObjectKind;

pub(crate) use namespace::{close_handle, create_or_open, open};
pub(crate) use object::{KernelObject, ObjectState, ThreadControl};
pub(crate) use wait::{wait_any, HostWait};
pub(crate) use wait_block::WaitBlock;
