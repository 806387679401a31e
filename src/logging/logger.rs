// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Global state for the `hub_*!` macros (§"Ambient Stack" logging):
//! independent of the `log` crate's own global logger, since a collaborator
//! process may already have installed its own `log::Log` implementation and
//! this module must not fight it for the slot.

use super::output::format_line;
use std::io::Write;
use std::sync::atomic::{AtomicU8, Ordering};

/// `log::LevelFilter` encoded as its discriminant so it fits in an atomic;
/// `0` means "logging not yet initialized", matching `log::LevelFilter::Off`
/// shifted by one so the default state is unambiguous.
static MAX_LEVEL: AtomicU8 = AtomicU8::new(0);

fn level_filter_to_code(filter: log::LevelFilter) -> u8 {
    match filter {
        log::LevelFilter::Off => 1,
        log::LevelFilter::Error => 2,
        log::LevelFilter::Warn => 3,
        log::LevelFilter::Info => 4,
        log::LevelFilter::Debug => 5,
        log::LevelFilter::Trace => 6,
    }
}

fn level_to_code(level: log::Level) -> u8 {
    match level {
        log::Level::Error => 2,
        log::Level::Warn => 3,
        log::Level::Info => 4,
        log::Level::Debug => 5,
        log::Level::Trace => 6,
    }
}

/// Install the structured logger's level. Call once, at process start;
/// callers that only want the plain `log` facade never need this.
pub fn init(filter: log::LevelFilter) {
    MAX_LEVEL.store(level_filter_to_code(filter), Ordering::Release);
}

/// Write one line to stderr if `level` is at or under the configured filter.
/// Called only from the `hub_*!` macros; never call directly.
#[doc(hidden)]
pub fn record(level: log::Level, args: std::fmt::Arguments<'_>) {
    let configured = MAX_LEVEL.load(Ordering::Acquire);
    if configured == 0 || level_to_code(level) > configured {
        return;
    }
    let line = format_line(level, &args);
    let _ = writeln!(std::io::stderr(), "{line}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uninitialized_logger_suppresses_everything() {
        MAX_LEVEL.store(0, Ordering::Release);
        // No observable assertion beyond "does not panic": record() with an
        // unset level must be a silent no-op.
        record(log::Level::Error, format_args!("should not print"));
    }

    #[test]
    fn init_raises_the_configured_ceiling() {
        init(log::LevelFilter::Warn);
        assert_eq!(MAX_LEVEL.load(Ordering::Acquire), level_filter_to_code(log::LevelFilter::Warn));
        init(log::LevelFilter::Off);
    }
}
