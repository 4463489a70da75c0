//! Logging wrappers used across the crate.
//!
//! Syscall paths are hot and mostly uninteresting in production, so these only expand to
//! [`tracing`] events in test builds. Anything which must always be reported (a descriptor that
//! failed to close in `Drop`, a panicking notification callback) calls [`tracing`] directly.

#[macro_export]
macro_rules! debug {
    ($($arg:tt)+) => {
        #[cfg(test)]
        tracing::debug!($($arg)+)
    };
}
pub(crate) use crate::debug;

#[macro_export]
macro_rules! warn {
    ($($arg:tt)+) => {
        #[cfg(test)]
        tracing::warn!($($arg)+)
    };
}
pub(crate) use crate::warn;
