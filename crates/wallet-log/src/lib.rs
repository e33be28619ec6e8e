//! Conditional logging macros for the wallet core.
//!
//! In the default build these delegate to `tracing`. With the `plain`
//! feature enabled they fall back to `println!`/`eprintln!`, for hosts that
//! embed the wallet core without installing a tracing subscriber.

#[cfg(not(feature = "plain"))]
#[doc(hidden)]
pub use tracing;

#[cfg(feature = "plain")]
#[doc(hidden)]
#[inline]
pub fn _log_info_impl(msg: std::fmt::Arguments<'_>) {
    println!("[INFO] {msg}");
}

#[cfg(feature = "plain")]
#[doc(hidden)]
#[inline]
pub fn _log_warn_impl(msg: std::fmt::Arguments<'_>) {
    eprintln!("[WARN] {msg}");
}

#[cfg(feature = "plain")]
#[doc(hidden)]
#[inline]
pub fn _log_error_impl(msg: std::fmt::Arguments<'_>) {
    eprintln!("[ERROR] {msg}");
}

#[cfg(feature = "plain")]
#[doc(hidden)]
#[inline]
pub fn _log_debug_impl(msg: std::fmt::Arguments<'_>) {
    #[cfg(debug_assertions)]
    println!("[DEBUG] {msg}");
    #[cfg(not(debug_assertions))]
    let _ = msg;
}

/// Log an info-level message.
#[macro_export]
#[cfg(feature = "plain")]
macro_rules! log_info {
    ($($arg:tt)*) => { $crate::_log_info_impl(format_args!($($arg)*)) };
}

/// Log an info-level message.
#[macro_export]
#[cfg(not(feature = "plain"))]
macro_rules! log_info {
    ($($arg:tt)*) => { $crate::tracing::info!($($arg)*) };
}

/// Log a warning-level message.
#[macro_export]
#[cfg(feature = "plain")]
macro_rules! log_warn {
    ($($arg:tt)*) => { $crate::_log_warn_impl(format_args!($($arg)*)) };
}

/// Log a warning-level message.
#[macro_export]
#[cfg(not(feature = "plain"))]
macro_rules! log_warn {
    ($($arg:tt)*) => { $crate::tracing::warn!($($arg)*) };
}

/// Log an error-level message.
#[macro_export]
#[cfg(feature = "plain")]
macro_rules! log_error {
    ($($arg:tt)*) => { $crate::_log_error_impl(format_args!($($arg)*)) };
}

/// Log an error-level message.
#[macro_export]
#[cfg(not(feature = "plain"))]
macro_rules! log_error {
    ($($arg:tt)*) => { $crate::tracing::error!($($arg)*) };
}

/// Log a debug-level message.
#[macro_export]
#[cfg(feature = "plain")]
macro_rules! log_debug {
    ($($arg:tt)*) => { $crate::_log_debug_impl(format_args!($($arg)*)) };
}

/// Log a debug-level message.
#[macro_export]
#[cfg(not(feature = "plain"))]
macro_rules! log_debug {
    ($($arg:tt)*) => { $crate::tracing::debug!($($arg)*) };
}
