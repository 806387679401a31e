// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Line formatting for the structured logger, kept separate from
//! [`super::logger`] so the format can be unit-tested without touching the
//! global logger state.

use std::time::{SystemTime, UNIX_EPOCH};

/// `[seconds.micros LEVEL] message`, e.g. `[1732999999.123456 WARN] ring full`.
/// No module path: the structured logger is for operational messages an
/// operator reads directly, not for `RUST_LOG`-style filtering by target.
pub fn format_line(level: log::Level, message: &std::fmt::Arguments<'_>) -> String {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    format!("[{}.{:06} {level}] {message}", now.as_secs(), now.subsec_micros())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_line_includes_level_and_message() {
        let line = format_line(log::Level::Warn, &format_args!("ring full on channel {}", "x"));
        assert!(line.contains("WARN"));
        assert!(line.contains("ring full on channel x"));
    }
}
