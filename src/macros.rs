//! Hot-path logging macros
//!
//! The decode loop and the download stream log once per token or chunk.
//! Both macros gate on `cfg!(debug_assertions)`: release builds still
//! type-check the arguments, and the optimizer drops the call.

/// `log::debug!` in debug builds only
#[macro_export]
macro_rules! perf_debug {
    ($($arg:tt)*) => {
        if cfg!(debug_assertions) {
            log::debug!($($arg)*);
        }
    };
}

/// `log::trace!` in debug builds only
#[macro_export]
macro_rules! perf_trace {
    ($($arg:tt)*) => {
        if cfg!(debug_assertions) {
            log::trace!($($arg)*);
        }
    };
}
