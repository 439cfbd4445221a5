//! Hostsync: kernel synchronization objects and a message-aware wait
//! dispatcher.
//!
//! # Overview
//!
//! Hostsync is the blocking core of an OS-abstraction kernel. It provides
//! handle-owning wrappers for kernel mutexes, semaphores and events, thread
//! records with a suspended-start handshake, and the single wait dispatcher
//! that every blocking operation goes through.
//!
//! # Core Guarantees
//!
//! - **One suspension point**: every blocking call reduces to
//!   [`wait_handles_with`]
//! - **Owning threads keep pumping**: a thread marked with
//!   [`mark_as_owning_thread`] services its message queue one message at a
//!   time while it waits, and never loses a quit message
//! - **Timeouts are outcomes**: a timeout is a value callers branch on, never
//!   a panic
//! - **Race-free lifecycle**: handles are owned, never reused, closed on
//!   drop, and duplicated into independently closable handles
//!
//! # Module Structure
//!
//! - [`sync`]: mutex, semaphore and event wrappers
//! - [`thread`]: thread records, death waits and block/unblock
//! - [`wait`]: the wait dispatcher and timeout types
//! - [`message`]: per-thread message queues
//! - [`handle`]: owned waitable handles
//! - [`per_thread`]: thread ids and the owning-thread flag
//! - [`config`]: process-wide configuration
//! - [`error`]: error types and the last-error channel

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::doc_markdown)]

pub mod config;
pub mod error;
pub mod handle;
mod host;
pub mod message;
pub mod per_thread;
pub mod sync;
pub mod thread;
pub mod tracing_compat;
pub mod wait;

#[cfg(test)]
pub(crate) mod test_utils;

pub use config::{ConfigError, KernelConfig};
pub use error::{clear_last_error, host_code, last_error, Error, ErrorKind, Result};
pub use handle::{clear_close_failure_hook, set_close_failure_hook, WaitableHandle};
pub use host::{AccessPolicy, ObjectKind};
pub use message::{Message, MessagePoster};
pub use per_thread::{is_caller_owning_thread, mark_as_owning_thread, ThreadId};
pub use sync::{Event, EventState, Mutex, MutexState, ResetMode, Semaphore};
pub use thread::{DeathStatus, EventOrDeath, KernelThread, Priority, EXIT_PANICKED};
pub use wait::{
    wait_handle, wait_handles, wait_handles_with, WaitMillis, WaitMode, WaitOutcome,
    MAX_WAIT_HANDLES,
};
