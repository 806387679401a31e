// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Ring Coordinator counters (§4.C "Required counters").
//!
//! Metrics live inside the mapped segment, not per-process, because
//! `get_metrics`/`reset_metrics` must report a single, consistent view no
//! matter which process's handle calls them.

use std::sync::atomic::{AtomicU64, Ordering};

/// All `Relaxed`: these are observational counters, not coordination
/// points, mirroring the teacher's `ShmMetrics` (`transport/shm/metrics.rs`).
#[repr(C)]
pub struct RingMetrics {
    total_slots_written: AtomicU64,
    total_slots_read: AtomicU64,
    writer_timeout_count: AtomicU64,
    writer_lock_timeout_count: AtomicU64,
    writer_reader_timeout_count: AtomicU64,
    checksum_failures: AtomicU64,
    reader_race_detected: AtomicU64,
}

/// Point-in-time copy returned by `get_metrics`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub total_slots_written: u64,
    pub total_slots_read: u64,
    pub writer_timeout_count: u64,
    pub writer_lock_timeout_count: u64,
    pub writer_reader_timeout_count: u64,
    pub checksum_failures: u64,
    pub reader_race_detected: u64,
    pub recovery_actions_count: u64,
}

impl RingMetrics {
    pub fn inc_total_slots_written(&self) {
        self.total_slots_written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_total_slots_read(&self) {
        self.total_slots_read.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_writer_timeout(&self) {
        self.writer_timeout_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_writer_lock_timeout(&self) {
        self.writer_lock_timeout_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_writer_reader_timeout(&self) {
        self.writer_reader_timeout_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_checksum_failures(&self) {
        self.checksum_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_reader_race_detected(&self) {
        self.reader_race_detected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, recovery_actions_count: u64) -> MetricsSnapshot {
        MetricsSnapshot {
            total_slots_written: self.total_slots_written.load(Ordering::Relaxed),
            total_slots_read: self.total_slots_read.load(Ordering::Relaxed),
            writer_timeout_count: self.writer_timeout_count.load(Ordering::Relaxed),
            writer_lock_timeout_count: self.writer_lock_timeout_count.load(Ordering::Relaxed),
            writer_reader_timeout_count: self.writer_reader_timeout_count.load(Ordering::Relaxed),
            checksum_failures: self.checksum_failures.load(Ordering::Relaxed),
            reader_race_detected: self.reader_race_detected.load(Ordering::Relaxed),
            recovery_actions_count,
        }
    }

    pub fn reset(&self) {
        self.total_slots_written.store(0, Ordering::Relaxed);
        self.total_slots_read.store(0, Ordering::Relaxed);
        self.writer_timeout_count.store(0, Ordering::Relaxed);
        self.writer_lock_timeout_count.store(0, Ordering::Relaxed);
        self.writer_reader_timeout_count.store(0, Ordering::Relaxed);
        self.checksum_failures.store(0, Ordering::Relaxed);
        self.reader_race_detected.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> RingMetrics {
        RingMetrics {
            total_slots_written: AtomicU64::new(0),
            total_slots_read: AtomicU64::new(0),
            writer_timeout_count: AtomicU64::new(0),
            writer_lock_timeout_count: AtomicU64::new(0),
            writer_reader_timeout_count: AtomicU64::new(0),
            checksum_failures: AtomicU64::new(0),
            reader_race_detected: AtomicU64::new(0),
        }
    }

    #[test]
    fn counters_increment_and_reset() {
        let metrics = fresh();
        metrics.inc_total_slots_written();
        metrics.inc_checksum_failures();
        metrics.inc_checksum_failures();
        let snap = metrics.snapshot(3);
        assert_eq!(snap.total_slots_written, 1);
        assert_eq!(snap.checksum_failures, 2);
        assert_eq!(snap.recovery_actions_count, 3);

        metrics.reset();
        let snap = metrics.snapshot(3);
        assert_eq!(snap.total_slots_written, 0);
        assert_eq!(snap.checksum_failures, 0);
    }
}
