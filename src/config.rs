//! Process-wide kernel configuration.
//!
//! # Configuration Precedence
//!
//! Settings are resolved in this order (highest priority first):
//!
//! 1. **Programmatic**: values set on [`KernelConfig`] before [`init`]
//! 2. **Environment variables**: values from `HOSTSYNC_*` env vars
//! 3. **Config file**: values loaded from a TOML file (requires `config-file` feature)
//! 4. **Defaults**: built-in defaults from [`KernelConfig::default()`]
//!
//! # Supported Environment Variables
//!
//! | Variable | Type | Maps to |
//! |----------|------|---------|
//! | `HOSTSYNC_THREAD_STACK_SIZE` | `usize` | `thread_stack_size` |
//! | `HOSTSYNC_THREAD_NAME_PREFIX` | `String` | `thread_name_prefix` |
//! | `HOSTSYNC_CLOSE_DIAGNOSTICS` | `bool` | `close_diagnostics` |

use std::sync::OnceLock;

use crate::per_thread;
use crate::tracing_compat::debug;

/// Environment variable name for the default thread stack size.
pub const ENV_THREAD_STACK_SIZE: &str = "HOSTSYNC_THREAD_STACK_SIZE";
/// Environment variable name for the thread name prefix.
pub const ENV_THREAD_NAME_PREFIX: &str = "HOSTSYNC_THREAD_NAME_PREFIX";
/// Environment variable name for the close-failure diagnostics toggle.
pub const ENV_CLOSE_DIAGNOSTICS: &str = "HOSTSYNC_CLOSE_DIAGNOSTICS";

/// Default stack size for threads started with a stack size of 0.
pub const DEFAULT_STACK_SIZE: usize = 2 * 1024 * 1024;

static CONFIG: OnceLock<KernelConfig> = OnceLock::new();
// Served by `current` until `init` runs; never blocks a later `init`.
static DEFAULTS: OnceLock<KernelConfig> = OnceLock::new();

/// Error raised while resolving configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable held an unparseable value.
    #[error("invalid value for {var}: expected {expected}, got {value:?}")]
    InvalidValue {
        /// The offending variable.
        var: String,
        /// What was expected.
        expected: &'static str,
        /// The raw value.
        value: String,
    },
    /// A configuration file could not be read or parsed.
    #[error("config file error: {0}")]
    File(String),
    /// [`init`] was called more than once.
    #[error("kernel configuration already initialized")]
    AlreadyInitialized,
}

/// Process-wide kernel configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelConfig {
    /// Stack size used when a thread is started with a stack size of 0.
    pub thread_stack_size: usize,
    /// Prefix for the names of threads started without an explicit name.
    pub thread_name_prefix: String,
    /// Report handle close failures from destructors through the
    /// close-failure hook (default: on in debug builds).
    pub close_diagnostics: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            thread_stack_size: DEFAULT_STACK_SIZE,
            thread_name_prefix: "hostsync".to_string(),
            close_diagnostics: cfg!(debug_assertions),
        }
    }
}

impl KernelConfig {
    /// Returns the defaults with environment overrides applied.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        apply_env_overrides(&mut config)?;
        Ok(config)
    }

    /// Normalize configuration values to safe defaults.
    pub fn normalize(&mut self) {
        if self.thread_stack_size == 0 {
            self.thread_stack_size = DEFAULT_STACK_SIZE;
        }
        if self.thread_name_prefix.is_empty() {
            self.thread_name_prefix = "hostsync".to_string();
        }
    }
}

/// Installs the process configuration and records the calling thread as the
/// primary thread.
///
/// Fails with [`ConfigError::AlreadyInitialized`] if called twice.
pub fn init(mut config: KernelConfig) -> Result<(), ConfigError> {
    config.normalize();
    CONFIG
        .set(config)
        .map_err(|_| ConfigError::AlreadyInitialized)?;
    let primary = per_thread::record_primary();
    debug!(primary = %primary, "kernel configuration installed");
    Ok(())
}

/// Returns the installed configuration, or the defaults if [`init`] has not
/// been called yet.
///
/// Reading the defaults does not install them: a later [`init`] still
/// succeeds and takes effect for every read after it.
pub fn current() -> &'static KernelConfig {
    CONFIG
        .get()
        .unwrap_or_else(|| DEFAULTS.get_or_init(KernelConfig::default))
}

/// Apply environment variable overrides to a [`KernelConfig`].
///
/// Only variables that are set in the environment are applied.
/// Returns an error if a variable is set but contains an unparseable value.
pub fn apply_env_overrides(config: &mut KernelConfig) -> Result<(), ConfigError> {
    if let Some(val) = read_env(ENV_THREAD_STACK_SIZE) {
        config.thread_stack_size = parse_usize(ENV_THREAD_STACK_SIZE, &val)?;
    }
    if let Some(val) = read_env(ENV_THREAD_NAME_PREFIX) {
        config.thread_name_prefix = val;
    }
    if let Some(val) = read_env(ENV_CLOSE_DIAGNOSTICS) {
        config.close_diagnostics = parse_bool(ENV_CLOSE_DIAGNOSTICS, &val)?;
    }
    Ok(())
}

fn read_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

fn parse_usize(var: &str, val: &str) -> Result<usize, ConfigError> {
    val.trim()
        .parse::<usize>()
        .map_err(|_| ConfigError::InvalidValue {
            var: var.to_string(),
            expected: "unsigned integer",
            value: val.to_string(),
        })
}

fn parse_bool(var: &str, val: &str) -> Result<bool, ConfigError> {
    match val.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            var: var.to_string(),
            expected: "bool (true/false/1/0/yes/no)",
            value: val.to_string(),
        }),
    }
}

// =========================================================================
// TOML config file support (feature-gated)
// =========================================================================

/// TOML-deserializable kernel configuration.
///
/// ```toml
/// [threads]
/// stack_size = 1048576
/// name_prefix = "myapp"
///
/// [diagnostics]
/// close_failures = true
/// ```
#[cfg(feature = "config-file")]
#[derive(serde::Deserialize, Default, Debug)]
pub struct KernelTomlConfig {
    /// Thread settings.
    #[serde(default)]
    pub threads: ThreadsToml,
    /// Diagnostic settings.
    #[serde(default)]
    pub diagnostics: DiagnosticsToml,
}

/// Threads section of the TOML config.
#[cfg(feature = "config-file")]
#[derive(serde::Deserialize, Default, Debug)]
pub struct ThreadsToml {
    /// Default stack size in bytes.
    pub stack_size: Option<usize>,
    /// Name prefix for unnamed threads.
    pub name_prefix: Option<String>,
}

/// Diagnostics section of the TOML config.
#[cfg(feature = "config-file")]
#[derive(serde::Deserialize, Default, Debug)]
pub struct DiagnosticsToml {
    /// Report close failures from destructors.
    pub close_failures: Option<bool>,
}

/// Apply a parsed TOML config to a [`KernelConfig`].
///
/// Only fields that are `Some` in the TOML struct override the config.
#[cfg(feature = "config-file")]
pub fn apply_toml_config(config: &mut KernelConfig, toml: &KernelTomlConfig) {
    if let Some(v) = toml.threads.stack_size {
        config.thread_stack_size = v;
    }
    if let Some(ref v) = toml.threads.name_prefix {
        config.thread_name_prefix.clone_from(v);
    }
    if let Some(v) = toml.diagnostics.close_failures {
        config.close_diagnostics = v;
    }
}

/// Parse a TOML string into a [`KernelTomlConfig`].
#[cfg(feature = "config-file")]
pub fn parse_toml_str(toml_str: &str) -> Result<KernelTomlConfig, ConfigError> {
    toml::from_str(toml_str).map_err(|e| ConfigError::File(format!("failed to parse TOML: {e}")))
}

/// Resolve a config from a TOML file with environment overrides on top.
#[cfg(feature = "config-file")]
pub fn load_file(path: &std::path::Path) -> Result<KernelConfig, ConfigError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::File(format!("failed to read {}: {e}", path.display())))?;
    let parsed = parse_toml_str(&content)?;
    let mut config = KernelConfig::default();
    apply_toml_config(&mut config, &parsed);
    apply_env_overrides(&mut config)?;
    Ok(config)
}
