//! Error types and the per-thread "last error" channel.
//!
//! Error handling follows these principles:
//!
//! - Errors are explicit and typed (no stringly-typed errors)
//! - A timeout is a first-class outcome, never a panic
//! - Host failures pass through with their host code and are never retried here
//! - Every failing public operation also records its error on the calling
//!   thread's last-error slot, for callers that only inspect error state
//!
//! # Error Kinds
//!
//! - **Lifecycle**: `AlreadyOpen`, `NullName`, `NotReady`, `AlreadyExists`,
//!   `AlreadyStarted`
//! - **Threads**: `NotThisThread`, `StillRunning`, `InvalidPriority`
//! - **Waiting**: `MaxWaitHandles`, `Timeout`
//! - **Host**: `Host` with the passthrough host error code

use core::fmt;
use std::cell::RefCell;

/// Host error codes produced by the in-process kernel model.
///
/// Values follow the conventional host numbering so logs read the same as
/// native diagnostics.
pub mod host_code {
    /// The name does not refer to any live object.
    pub const NOT_FOUND: u32 = 2;
    /// The handle does not refer to a live object.
    pub const INVALID_HANDLE: u32 = 6;
    /// A parameter was out of range, such as an empty wait set.
    pub const INVALID_PARAMETER: u32 = 87;
    /// A named object with this name already existed.
    pub const ALREADY_EXISTS: u32 = 183;
    /// A mutex was released by a thread that does not own it.
    pub const NOT_OWNER: u32 = 288;
    /// A semaphore release would exceed its maximum count.
    pub const TOO_MANY_POSTS: u32 = 298;
    /// The name is bound to an object of a different kind.
    pub const TYPE_MISMATCH: u32 = 1309;
}

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    // === Lifecycle ===
    /// `create`/`open` was called on an object whose handle is already valid.
    AlreadyOpen,
    /// A named operation was requested but no name is set.
    NullName,
    /// The object has no valid handle.
    NotReady,
    /// Exclusive creation found an existing object with the same name.
    AlreadyExists,
    /// The thread record has already been started.
    AlreadyStarted,

    // === Threads ===
    /// The operation must be called by the thread the record refers to.
    NotThisThread,
    /// The thread has not exited yet.
    StillRunning,
    /// A raw value does not name one of the supported priority levels.
    InvalidPriority,

    // === Waiting ===
    /// More handles were passed than a single wait supports.
    MaxWaitHandles,
    /// The wait budget elapsed before anything was signaled.
    Timeout,

    // === Host ===
    /// A host call failed; see [`Error::host_code`].
    Host,
}

impl ErrorKind {
    /// Returns true for kinds that indicate caller misuse rather than an
    /// environment condition.
    #[must_use]
    pub const fn is_usage_error(&self) -> bool {
        matches!(
            self,
            Self::AlreadyOpen
                | Self::NullName
                | Self::NotReady
                | Self::AlreadyStarted
                | Self::NotThisThread
                | Self::InvalidPriority
                | Self::MaxWaitHandles
        )
    }
}

/// The main error type for hostsync operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    kind: ErrorKind,
    host_code: Option<u32>,
    message: Option<String>,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            host_code: None,
            message: None,
        }
    }

    /// Creates a passthrough host error.
    #[must_use]
    pub const fn host(code: u32) -> Self {
        Self {
            kind: ErrorKind::Host,
            host_code: Some(code),
            message: None,
        }
    }

    /// Creates a host error from an I/O error raised by the standard library.
    #[must_use]
    pub fn from_io(err: &std::io::Error) -> Self {
        let code = err
            .raw_os_error()
            .and_then(|code| u32::try_from(code).ok())
            .unwrap_or(0);
        Self::host(code).with_message(err.to_string())
    }

    /// Attaches the host code that accompanies a non-host error kind.
    #[must_use]
    pub const fn with_host_code(mut self, code: u32) -> Self {
        self.host_code = Some(code);
        self
    }

    /// Adds a message description to the error.
    #[must_use]
    pub fn with_message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the host error code. Always set for [`ErrorKind::Host`];
    /// a few kernel errors carry the matching host code too.
    #[must_use]
    pub const fn host_code(&self) -> Option<u32> {
        self.host_code
    }

    /// Returns the error message, if any.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Returns true if the wait budget elapsed.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self.kind, ErrorKind::Timeout)
    }

    /// Returns true if this is a passthrough host error.
    #[must_use]
    pub const fn is_host(&self) -> bool {
        matches!(self.kind, ErrorKind::Host)
    }

    /// Returns true if this is a host error with the given code.
    #[must_use]
    pub fn is_host_code(&self, code: u32) -> bool {
        self.is_host() && self.host_code == Some(code)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(code) = self.host_code {
            write!(f, " (host code {code})")?;
        }
        if let Some(msg) = &self.message {
            write!(f, ": {msg}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

/// A specialized Result type for hostsync operations.
pub type Result<T> = core::result::Result<T, Error>;

thread_local! {
    static LAST_ERROR: RefCell<Option<Error>> = const { RefCell::new(None) };
}

/// Returns the last error recorded on the calling thread.
#[must_use]
pub fn last_error() -> Option<Error> {
    LAST_ERROR.with(|slot| slot.borrow().clone())
}

/// Clears the calling thread's last-error slot.
pub fn clear_last_error() {
    LAST_ERROR.with(|slot| *slot.borrow_mut() = None);
}

/// Records `err` as the calling thread's last error.
pub(crate) fn set_last_error(err: &Error) {
    LAST_ERROR.with(|slot| *slot.borrow_mut() = Some(err.clone()));
}

/// Records `err` on the last-error channel and returns it as a failure.
pub(crate) fn fail<T>(err: impl Into<Error>) -> Result<T> {
    let err = err.into();
    set_last_error(&err);
    Err(err)
}
