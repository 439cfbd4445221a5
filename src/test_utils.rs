//! Test utilities for hostsync.
//!
//! This module provides shared helpers for unit tests:
//! - Consistent tracing-based logging initialization
//! - Phase/section macros for readable test output
//! - A lock for tests that mutate environment variables
//! - Helpers for running a closure on a fresh kernel thread

use std::sync::{Mutex, Once};
use std::time::{Duration, Instant};
use tracing_subscriber::fmt::format::FmtSpan;

static INIT_LOGGING: Once = Once::new();
static ENV_LOCK: Mutex<()> = Mutex::new(());

/// Initialize test logging with trace-level output.
///
/// Safe to call multiple times; only initializes once.
pub fn init_test_logging() {
    init_test_logging_with_level(tracing::Level::TRACE);
}

/// Initialize test logging with a custom level.
///
/// The first call wins; later calls are no-ops.
pub fn init_test_logging_with_level(level: tracing::Level) {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_test_writer()
            .with_file(true)
            .with_line_number(true)
            .with_target(true)
            .with_thread_ids(true)
            .with_thread_names(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_ansi(false)
            .try_init();
    });
}

/// Acquire the global environment lock for tests that mutate env vars.
pub fn env_lock() -> std::sync::MutexGuard<'static, ()> {
    ENV_LOCK
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Runs `f` on a fresh `std` thread and returns its result.
///
/// Per-thread kernel state (owning flag, message queue) starts clean there.
pub fn on_fresh_thread<T, F>(f: F) -> T
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    std::thread::spawn(f).join().expect("test thread panicked")
}

/// Asserts that `f` returns within `limit`, returning its value.
pub fn assert_completes_within<T>(limit: Duration, description: &str, f: impl FnOnce() -> T) -> T {
    let start = Instant::now();
    let value = f();
    let elapsed = start.elapsed();
    tracing::debug!(
        description = %description,
        elapsed_ms = elapsed.as_millis(),
        limit_ms = limit.as_millis(),
        "operation finished"
    );
    assert!(
        elapsed <= limit,
        "operation '{description}' took {elapsed:?}, limit {limit:?}"
    );
    value
}

/// Log a test phase transition with a visual separator.
#[macro_export]
macro_rules! test_phase {
    ($name:expr) => {
        tracing::info!(phase = %$name, "========================================");
        tracing::info!(phase = %$name, "TEST PHASE: {}", $name);
        tracing::info!(phase = %$name, "========================================");
    };
}

/// Log a section within a test phase.
#[macro_export]
macro_rules! test_section {
    ($name:expr) => {
        tracing::debug!(section = %$name, "--- {} ---", $name);
    };
}

/// Log test completion with summary.
#[macro_export]
macro_rules! test_complete {
    ($name:expr) => {
        tracing::info!(test = %$name, "test completed successfully: {}", $name);
    };
    ($name:expr, $($key:ident = $value:expr),* $(,)?) => {
        tracing::info!(
            test = %$name,
            $($key = %$value,)*
            "test completed successfully: {}",
            $name
        );
    };
}

/// Log before assertions for context.
#[macro_export]
macro_rules! assert_with_log {
    ($cond:expr, $msg:expr, $expected:expr, $actual:expr) => {
        tracing::debug!(
            expected = ?$expected,
            actual = ?$actual,
            "Asserting: {}",
            $msg
        );
        assert!($cond, "{}: expected {:?}, got {:?}", $msg, $expected, $actual);
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logging_init_is_idempotent() {
        init_test_logging();
        init_test_logging_with_level(tracing::Level::INFO);
        test_phase!("logging");
        test_section!("idempotent");
        test_complete!("logging_init_is_idempotent");
    }

    #[test]
    fn fresh_thread_returns_value() {
        let value = on_fresh_thread(|| 41 + 1);
        assert_with_log!(value == 42, "fresh thread result", 42, value);
    }

    #[test]
    fn completes_within_passes_fast_work() {
        let value = assert_completes_within(Duration::from_secs(5), "noop", || 7);
        assert_eq!(value, 7);
    }
}
