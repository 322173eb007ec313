//! Kernel logging (`klog`).
//!
//! Profile-aware logging macros for kernel sub-crates. Records are handed to
//! the [`log`] facade under the `"klog"` target, so whoever hosts the crate
//! (boot console, serial port, a test harness) installs the actual sink.
//!
//! # Macro Overview
//!
//! | Macro | Release build | Profile-aware | Use case |
//! |-------|--------------|---------------|----------|
//! | [`kprintln!`] | Compiled out | No | Debug diagnostics |
//! | [`klog!`] | Active | Yes | Operational logging with level filter |
//! | [`klog_always!`] | Active | Secure-gated | Status messages |
//! | [`klog_force!`] | Active | No | Pre-panic diagnostics, critical errors |
//!
//! # Hardening Profile Integration
//!
//! Filtering is decided at runtime from the active hardening profile, set
//! once through [`set_profile`]:
//!
//! - **Secure** : no output
//! - **Balanced**: `Error` + `Warn` only
//! - **Performance**: all levels
//!
//! The hot path is a single `Relaxed` atomic load + integer compare.
//!
//! # Pointer Safety
//!
//! Callers must not format kernel physical or virtual addresses. Log table
//! indices, levels and device-visible addresses instead.

#![cfg_attr(not(test), no_std)]

use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

pub use log;

// ============================================================================
// Log Levels
// ============================================================================

/// Severity level for [`klog!`] messages.
///
/// Ordered from least severe ([`Level::Trace`]) to most severe
/// ([`Level::Error`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Level {
    /// Extremely verbose tracing (compiled out in release).
    Trace = 0,
    /// Developer-oriented debug information (compiled out in release).
    Debug = 1,
    /// Normal operational information.
    Info = 2,
    /// Potential problems that merit attention.
    Warn = 3,
    /// Errors that affect correctness or security.
    Error = 4,
}

impl From<Level> for log::Level {
    fn from(level: Level) -> Self {
        match level {
            Level::Trace => log::Level::Trace,
            Level::Debug => log::Level::Debug,
            Level::Info => log::Level::Info,
            Level::Warn => log::Level::Warn,
            Level::Error => log::Level::Error,
        }
    }
}

// ============================================================================
// Profile Filter
// ============================================================================

/// Sentinel: all output suppressed.
const LEVEL_DISABLED: u8 = u8::MAX;

/// Runtime minimum level. Starts disabled until [`set_profile`] runs.
static LOG_MIN_LEVEL: AtomicU8 = AtomicU8::new(LEVEL_DISABLED);

/// Runtime gate for [`klog_always!`]; `false` until [`set_profile`] runs.
static LOG_ALWAYS_ENABLED: AtomicBool = AtomicBool::new(false);

/// Hardening profiles understood by the filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum KlogProfile {
    /// Maximum security, no klog output.
    Secure = 0,
    /// Balanced: errors and warnings only.
    Balanced = 1,
    /// Performance/debug: all levels.
    Performance = 2,
}

/// Set the klog filter from a profile.
///
/// Safe to call again if the profile changes at runtime. `Secure` also
/// silences [`klog_always!`]; [`klog_force!`] is never filtered.
#[inline]
pub fn set_profile(profile: KlogProfile) {
    let min = match profile {
        KlogProfile::Secure => LEVEL_DISABLED,
        KlogProfile::Balanced => Level::Warn as u8,
        KlogProfile::Performance => Level::Trace as u8,
    };
    LOG_MIN_LEVEL.store(min, Ordering::Release);
    LOG_ALWAYS_ENABLED.store(profile != KlogProfile::Secure, Ordering::Release);
}

/// Disable all klog output. Does **not** affect [`klog_always!`].
#[inline]
pub fn disable() {
    LOG_MIN_LEVEL.store(LEVEL_DISABLED, Ordering::Release);
}

/// Returns `true` if a message at `level` would currently be emitted.
#[inline(always)]
pub fn enabled(level: Level) -> bool {
    level as u8 >= LOG_MIN_LEVEL.load(Ordering::Relaxed)
}

#[doc(hidden)]
#[inline(always)]
pub fn _klog_always_enabled() -> bool {
    LOG_ALWAYS_ENABLED.load(Ordering::Relaxed)
}

// ============================================================================
// Output Helpers (not public API — used by macros)
// ============================================================================

#[doc(hidden)]
#[inline(always)]
pub fn _klog_print(level: Level, args: core::fmt::Arguments) {
    log::log!(target: "klog", log::Level::from(level), "{}", args);
}

// ============================================================================
// Macros
// ============================================================================

/// Profile-gated status output, emitted at `Info`.
///
/// Suppressed in [`KlogProfile::Secure`]. Use [`klog_force!`] for output that
/// must appear regardless of profile.
#[macro_export]
macro_rules! klog_always {
    ($($arg:tt)+) => {{
        if $crate::_klog_always_enabled() {
            $crate::_klog_print($crate::Level::Info, format_args!($($arg)+));
        }
    }};
}

/// Unconditional output, emitted at `Error`. Never suppressed by a profile.
///
/// Reserve for messages that must precede a `panic!` or report a fatal
/// table inconsistency.
#[macro_export]
macro_rules! klog_force {
    ($($arg:tt)+) => {{
        $crate::_klog_print($crate::Level::Error, format_args!($($arg)+));
    }};
}

/// Debug-only print. Fully compiled out in release builds.
#[macro_export]
macro_rules! kprintln {
    ($($arg:tt)+) => {{
        #[cfg(debug_assertions)]
        $crate::klog_always!($($arg)+);
    }};
}

/// Profile-aware kernel logging.
///
/// `Debug` and `Trace` levels are additionally compiled out in release builds.
///
/// # Examples
///
/// ```ignore
/// klog!(Warn,  "iommu: domain {} table page alloc failed", id);
/// klog!(Info,  "iommu: domain {} table ready ({} levels)", id, pglvl);
/// klog!(Trace, "iommu: freed table page idx={} lvl={}", idx, lvl);
/// ```
#[macro_export]
macro_rules! klog {
    (Error, $($arg:tt)+) => {{
        if $crate::enabled($crate::Level::Error) {
            $crate::_klog_print($crate::Level::Error, format_args!($($arg)+));
        }
    }};
    (Warn, $($arg:tt)+) => {{
        if $crate::enabled($crate::Level::Warn) {
            $crate::_klog_print($crate::Level::Warn, format_args!($($arg)+));
        }
    }};
    (Info, $($arg:tt)+) => {{
        if $crate::enabled($crate::Level::Info) {
            $crate::_klog_print($crate::Level::Info, format_args!($($arg)+));
        }
    }};
    (Debug, $($arg:tt)+) => {{
        #[cfg(debug_assertions)]
        if $crate::enabled($crate::Level::Debug) {
            $crate::_klog_print($crate::Level::Debug, format_args!($($arg)+));
        };
    }};
    (Trace, $($arg:tt)+) => {{
        #[cfg(debug_assertions)]
        if $crate::enabled($crate::Level::Trace) {
            $crate::_klog_print($crate::Level::Trace, format_args!($($arg)+));
        };
    }};
}
