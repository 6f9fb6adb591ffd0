// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Logging facade shared by the bucketql crates
//!
//! Usage:
//! - Set BUCKETQL_LOG=off (default) - no logs
//! - Set BUCKETQL_LOG=info - fetches, resolutions, view registrations
//! - Set BUCKETQL_LOG=debug - cache hits, listing pages, retry delays
//!
//! The verbose-diagnostics configuration knob maps onto `info` when the
//! environment variable is unset; see [`init_with_default`].

use std::sync::Once;

// Re-export emit so macros can use it
pub use emit;

/// Environment variable selecting the log level.
pub const LOG_ENV: &str = "BUCKETQL_LOG";

static INIT: Once = Once::new();

/// Minimum level accepted by the emitter, or `None` to disable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    /// Parse a level name; unknown names yield `None`.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "off" | "" => Some(LogLevel::Off),
            "error" => Some(LogLevel::Error),
            "warn" | "warning" => Some(LogLevel::Warn),
            "info" => Some(LogLevel::Info),
            "debug" => Some(LogLevel::Debug),
            _ => None,
        }
    }

    fn emit_level(self) -> Option<emit::Level> {
        match self {
            LogLevel::Off => None,
            LogLevel::Error => Some(emit::Level::Error),
            LogLevel::Warn => Some(emit::Level::Warn),
            LogLevel::Info => Some(emit::Level::Info),
            LogLevel::Debug => Some(emit::Level::Debug),
        }
    }
}

/// Initialize diagnostics from BUCKETQL_LOG, defaulting to `off`.
///
/// Safe to call multiple times - only the first call has an effect.
pub fn init_diagnostics() {
    init_with_default(false);
}

/// Initialize diagnostics, using `info` instead of `off` when `verbose` is
/// set and BUCKETQL_LOG is absent. An explicit BUCKETQL_LOG always wins.
pub fn init_with_default(verbose: bool) {
    INIT.call_once(|| {
        let requested = std::env::var(LOG_ENV).ok();
        let (level, unknown) = match requested.as_deref() {
            None if verbose => (LogLevel::Info, None),
            None => (LogLevel::Off, None),
            Some(name) => match LogLevel::parse(name) {
                Some(level) => (level, None),
                None => (LogLevel::Info, Some(name.to_string())),
            },
        };

        let Some(min) = level.emit_level() else {
            return;
        };

        let rt = emit::setup()
            .emit_to(emit_term::stderr())
            .emit_when(emit::level::min_filter(min))
            .init();

        if let Some(value) = unknown {
            emit::warn!("Unknown {env} value '{value}', using 'info'", env: LOG_ENV, value: value);
        }

        // The runtime must outlive every emitting thread.
        std::mem::forget(rt);
    });
}

/// Log basic operations (fetches, resolutions, registrations)
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::emit::info!($($arg)*)
    };
}

/// Log detailed diagnostics (cache hits, listing pages, retry delays)
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::emit::debug!($($arg)*)
    };
}

/// Log recoverable conditions (retries, rejected catalog entries)
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::emit::warn!($($arg)*)
    };
}

/// Log failures that abort an operation
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::emit::error!($($arg)*)
    };
}

/// Short form of [`log_info!`]
#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::emit::info!($($arg)*)
    };
}

/// Short form of [`log_debug!`]
#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        $crate::emit::debug!($($arg)*)
    };
}

/// Short form of [`log_warn!`]
#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        $crate::emit::warn!($($arg)*)
    };
}

/// Short form of [`log_error!`]
#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::emit::error!($($arg)*)
    };
}

pub use init_diagnostics as init;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_safe_to_call_multiple_times() {
        init_diagnostics();
        init_with_default(true);
        init_diagnostics();
    }

    #[test]
    fn test_parse_levels() {
        assert_eq!(LogLevel::parse("off"), Some(LogLevel::Off));
        assert_eq!(LogLevel::parse("DEBUG"), Some(LogLevel::Debug));
        assert_eq!(LogLevel::parse(" warning "), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse("chatty"), None);
    }

    #[test]
    fn test_macros_compile() {
        log_info!("Test message");
        log_debug!("Debug message with {value}", value: 42);
        log_warn!("Warning message");
        log_error!("Error message");

        let key = "bucket/key.csv";
        info!("Fetched {key}", key: key);
        debug!("Cache hit for {key}", key: key);
        warn!("Retrying {key}", key: key);
        error!("Failed {key}", key: key);
    }

    #[test]
    fn test_macros_take_call_site_properties() {
        init_with_default(true);
        let bucket = "logs";
        let reason = String::from("connection reset");
        let written: u64 = 1024;
        let count: usize = 3;
        info!("Fetched {bucket}: {written} bytes", bucket: bucket, written: written);
        debug!("Matched {count} objects in {bucket}", count: count, bucket: bucket);
        warn!("Retrying {bucket} after: {reason}", bucket: bucket, reason: reason);
        log_error!("Gave up on {bucket}", bucket: bucket);
    }
}
