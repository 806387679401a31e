// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Heartbeat table (§4.E): liveness tracking for the producer and for every
//! attached consumer, used by recovery to tell a live participant from a
//! zombie one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Fixed capacity of the consumer heartbeat table (§3.1 "size compile-time
/// constant, e.g. 64").
pub const HEARTBEAT_TABLE_CAPACITY: usize = 64;

/// §9 open question resolved: 5 seconds is the default liveness window,
/// matching the order of magnitude of a typical DDS liveliness lease while
/// staying tight enough for an intra-host heartbeat loop. Configurable per
/// handle via [`crate::handles`] options.
pub const DEFAULT_LIVENESS_WINDOW: Duration = Duration::from_secs(5);

/// Current wall-clock time in nanoseconds since the Unix epoch, used as the
/// heartbeat clock so freshness comparisons are meaningful across
/// processes, not just within one.
pub fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

/// One entry in the fixed-size consumer heartbeat table:
/// `(consumer_id, consumer_pid, last_heartbeat_ns, next_read_position)`
/// (§3.1), each field its own atomic so reads never tear.
#[repr(C)]
pub struct ConsumerHeartbeat {
    consumer_id: AtomicU64,
    consumer_pid: AtomicU64,
    last_heartbeat_ns: AtomicU64,
    next_read_position: AtomicU64,
}

impl ConsumerHeartbeat {
    pub fn is_free(&self) -> bool {
        self.consumer_id.load(Ordering::Acquire) == 0
    }

    pub fn consumer_id(&self) -> u64 {
        self.consumer_id.load(Ordering::Acquire)
    }

    pub fn pid(&self) -> u64 {
        self.consumer_pid.load(Ordering::Acquire)
    }

    pub fn last_heartbeat_ns(&self) -> u64 {
        self.last_heartbeat_ns.load(Ordering::Acquire)
    }

    pub fn next_read_position(&self) -> u64 {
        self.next_read_position.load(Ordering::Acquire)
    }

    pub fn advance_next_read_position(&self, value: u64) {
        self.next_read_position.store(value, Ordering::Release);
    }

    /// CAS the entry from free into owned by `consumer_id`/`pid`.
    #[must_use]
    pub fn try_register(&self, consumer_id: u64, pid: u64) -> bool {
        if self
            .consumer_id
            .compare_exchange(0, consumer_id, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.consumer_pid.store(pid, Ordering::Release);
        self.next_read_position.store(0, Ordering::Release);
        self.last_heartbeat_ns.store(now_ns(), Ordering::Release);
        true
    }

    pub fn pulse(&self) {
        self.last_heartbeat_ns.store(now_ns(), Ordering::Release);
    }

    pub fn is_fresh(&self, window: Duration) -> bool {
        let now = now_ns();
        let last = self.last_heartbeat_ns();
        now.saturating_sub(last) < window.as_nanos() as u64
    }

    /// Zero the entry, releasing it back to the free pool (§4.E "on handle
    /// destruction the entry is zeroed").
    pub fn clear(&self) {
        self.next_read_position.store(0, Ordering::Release);
        self.last_heartbeat_ns.store(0, Ordering::Release);
        self.consumer_pid.store(0, Ordering::Release);
        self.consumer_id.store(0, Ordering::Release);
    }
}

/// View over the header's fixed-size heartbeat array, plus the producer's
/// single heartbeat word.
pub struct HeartbeatTable<'a> {
    entries: &'a [ConsumerHeartbeat],
}

impl<'a> HeartbeatTable<'a> {
    pub fn new(entries: &'a [ConsumerHeartbeat]) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> &'a ConsumerHeartbeat {
        &self.entries[index]
    }

    pub fn find_by_consumer_id(&self, consumer_id: u64) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.consumer_id() == consumer_id)
    }

    /// Register into the first free entry, returning its index.
    pub fn register(&self, consumer_id: u64, pid: u64) -> Option<usize> {
        for (index, entry) in self.entries.iter().enumerate() {
            if entry.is_free() && entry.try_register(consumer_id, pid) {
                return Some(index);
            }
        }
        None
    }

    pub fn release(&self, index: usize) {
        self.entries[index].clear();
    }

    /// Minimum `next_read_position` across all registered entries, used by
    /// the `Sync_reader` ring-full check; `None` if no consumer is
    /// registered.
    pub fn min_next_read_position(&self) -> Option<u64> {
        self.entries
            .iter()
            .filter(|e| !e.is_free())
            .map(ConsumerHeartbeat::next_read_position)
            .min()
    }

    /// Scan for entries whose PID is no longer alive; zero them and return
    /// how many were reclaimed (§4.H `cleanup_dead_consumers`).
    pub fn cleanup_dead(&self, is_alive: impl Fn(u64) -> bool) -> usize {
        let mut reclaimed = 0;
        for entry in self.entries.iter() {
            if entry.is_free() {
                continue;
            }
            if !is_alive(entry.pid()) {
                entry.clear();
                reclaimed += 1;
            }
        }
        reclaimed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_storage() -> Vec<ConsumerHeartbeat> {
        (0..4)
            .map(|_| ConsumerHeartbeat {
                consumer_id: AtomicU64::new(0),
                consumer_pid: AtomicU64::new(0),
                last_heartbeat_ns: AtomicU64::new(0),
                next_read_position: AtomicU64::new(0),
            })
            .collect()
    }

    #[test]
    fn register_and_release_round_trip() {
        let storage = table_storage();
        let table = HeartbeatTable::new(&storage);

        let idx = table.register(42, 1000).expect("free slot available");
        assert_eq!(table.get(idx).consumer_id(), 42);
        assert_eq!(table.find_by_consumer_id(42), Some(idx));

        table.release(idx);
        assert!(table.get(idx).is_free());
        assert_eq!(table.find_by_consumer_id(42), None);
    }

    #[test]
    fn table_exhausts_capacity() {
        let storage = table_storage();
        let table = HeartbeatTable::new(&storage);
        for i in 0..storage.len() as u64 {
            assert!(table.register(i + 1, 1).is_some());
        }
        assert!(table.register(999, 1).is_none());
    }

    #[test]
    fn freshness_reflects_pulse() {
        let storage = table_storage();
        let table = HeartbeatTable::new(&storage);
        let idx = table.register(1, 1).expect("free slot");
        assert!(table.get(idx).is_fresh(Duration::from_secs(60)));
        assert!(!table.get(idx).is_fresh(Duration::from_nanos(0)));
    }

    #[test]
    fn cleanup_dead_reclaims_unreachable_pids() {
        let storage = table_storage();
        let table = HeartbeatTable::new(&storage);
        table.register(1, 424_242).expect("free slot");
        let reclaimed = table.cleanup_dead(|_pid| false);
        assert_eq!(reclaimed, 1);
        assert_eq!(table.find_by_consumer_id(1), None);
    }

    #[test]
    fn min_next_read_position_tracks_slowest_consumer() {
        let storage = table_storage();
        let table = HeartbeatTable::new(&storage);
        let a = table.register(1, 1).unwrap();
        let b = table.register(2, 1).unwrap();
        table.get(a).advance_next_read_position(5);
        table.get(b).advance_next_read_position(2);
        assert_eq!(table.min_next_read_position(), Some(2));
    }
}
