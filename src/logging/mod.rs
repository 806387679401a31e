// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Compile-time feature-gated structured logger, carried alongside plain
//! `log` crate calls in the hot path (`ring.rs` uses `log::debug!`/
//! `log::warn!` directly). This module exists for callers who want a
//! zero-cost-when-disabled logger instead: with the `logging` feature off,
//! every `hub_*!` macro expands to nothing and the format arguments are
//! never even evaluated.

pub mod logger;
pub mod output;

pub use logger::init;

/// Emit at [`log::Level::Error`] through the structured logger. Compiles to
/// nothing without the `logging` feature.
#[macro_export]
macro_rules! hub_error {
    ($($arg:tt)*) => {
        #[cfg(feature = "logging")]
        $crate::logging::logger::record(log::Level::Error, format_args!($($arg)*));
    };
}

#[macro_export]
macro_rules! hub_warn {
    ($($arg:tt)*) => {
        #[cfg(feature = "logging")]
        $crate::logging::logger::record(log::Level::Warn, format_args!($($arg)*));
    };
}

#[macro_export]
macro_rules! hub_info {
    ($($arg:tt)*) => {
        #[cfg(feature = "logging")]
        $crate::logging::logger::record(log::Level::Info, format_args!($($arg)*));
    };
}

#[macro_export]
macro_rules! hub_debug {
    ($($arg:tt)*) => {
        #[cfg(feature = "logging")]
        $crate::logging::logger::record(log::Level::Debug, format_args!($($arg)*));
    };
}

/// Only compiled in at all under the `trace` feature (which implies
/// `logging`, per `Cargo.toml`'s `trace = ["logging"]`), since trace-level
/// output on the ring's hot path is expensive enough to want out of the
/// binary entirely, not just filtered at runtime.
#[macro_export]
macro_rules! hub_trace {
    ($($arg:tt)*) => {
        #[cfg(feature = "trace")]
        $crate::logging::logger::record(log::Level::Trace, format_args!($($arg)*));
    };
}

#[cfg(test)]
mod tests {
    #[test]
    fn macros_compile_with_no_arguments_evaluated_twice() {
        let mut calls = 0;
        let mut bump = || {
            calls += 1;
            calls
        };
        hub_debug!("value = {}", bump());
        // Without the `logging` feature this macro expands to nothing, so
        // `bump` is never called; this test only asserts it compiles either way.
        let _ = &mut bump;
    }
}
