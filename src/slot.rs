// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The Slot State Machine (SSM, §4.B): per-slot metadata and the atomic
//! compare-exchange transitions that coordinate one producer with any
//! number of concurrent consumers, without a lock on the fast path.
//!
//! Per-slot metadata (`SlotMeta`) is kept separate from the slot's payload
//! bytes, which live in the payload slab (§3.4) at a deterministic offset;
//! `SlotMeta` only ever touches its own cache line plus, while `COMMITTED`,
//! the digest it stores.
//!
//! State set: `FREE, WRITING, COMMITTED, DRAINING` (§4.B). Every legal
//! transition below corresponds to exactly one row of the transition table
//! in the spec; there is no path that reaches `COMMITTED` without passing
//! through `WRITING` first (quantified invariant §8.2).

use crate::checksum::DIGEST_LEN;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free = 0,
    Writing = 1,
    Committed = 2,
    Draining = 3,
}

impl SlotState {
    fn from_u32(v: u32) -> Self {
        match v {
            0 => SlotState::Free,
            1 => SlotState::Writing,
            2 => SlotState::Committed,
            3 => SlotState::Draining,
            other => unreachable!("slot state word corrupted: {other}"),
        }
    }
}

/// Per-slot metadata, cache-line aligned to avoid false sharing between
/// adjacent slots under concurrent producer/consumer access.
#[repr(C, align(64))]
pub struct SlotMeta {
    /// `write_index` at the most recent acquire of this slot; identifies a
    /// commit uniquely within the channel's lifetime.
    sequence: AtomicU64,
    /// PID currently permitted to write this slot, or `0`.
    write_lock: AtomicU64,
    /// `SlotState` as a raw word, accessed with explicit Acquire/Release.
    state: AtomicU32,
    /// Concurrent consume handles referencing this slot.
    reader_count: AtomicU32,
    /// Bytes the writer declared useful inside the slot.
    committed_length: AtomicU32,
    /// Valid iff checksum policy is not `None` and `state == Committed`.
    payload_checksum: UnsafeCell<[u8; DIGEST_LEN]>,
    _pad: [u8; 4],
}

// SAFETY: every field is either an atomic or a digest written exclusively
// by the writer before the Release store to `state` and read only after an
// Acquire load observes `Committed`; readers never mutate `payload_checksum`.
unsafe impl Send for SlotMeta {}
unsafe impl Sync for SlotMeta {}

impl SlotMeta {
    pub fn state(&self) -> SlotState {
        SlotState::from_u32(self.state.load(Ordering::Acquire))
    }

    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::Acquire)
    }

    pub fn committed_length(&self) -> u32 {
        self.committed_length.load(Ordering::Acquire)
    }

    pub fn reader_count(&self) -> u32 {
        self.reader_count.load(Ordering::Acquire)
    }

    pub fn write_lock_holder(&self) -> u64 {
        self.write_lock.load(Ordering::Acquire)
    }

    /// `payload_checksum` is only meaningful once a reader has observed
    /// `Committed`; callers are responsible for that ordering.
    pub fn payload_checksum(&self) -> [u8; DIGEST_LEN] {
        // SAFETY: readers only call this after `try_reader_acquire`
        // observed `Committed` with Acquire, which happens-after the
        // writer's Release store in `commit`, so the digest write below is
        // visible.
        unsafe { *self.payload_checksum.get() }
    }

    /// FREE -> WRITING, guarded by a successful `write_lock` CAS.
    #[must_use]
    pub fn try_acquire_write_lock(&self, pid: u64) -> bool {
        self.write_lock
            .compare_exchange(0, pid, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn clear_write_lock(&self) {
        self.write_lock.store(0, Ordering::Release);
    }

    /// Transition into `WRITING` for a slot that was `FREE` (no overlapping
    /// reader ever existed for this sequence).
    pub fn begin_writing(&self, sequence: u64) {
        self.sequence.store(sequence, Ordering::Relaxed);
        self.state.store(SlotState::Writing as u32, Ordering::Release);
    }

    /// COMMITTED -> DRAINING: the producer is reusing this index on
    /// wraparound and found a live reader (§4.B "Draining policy").
    #[must_use]
    pub fn enter_draining(&self) -> bool {
        self.state
            .compare_exchange(
                SlotState::Committed as u32,
                SlotState::Draining as u32,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// DRAINING -> WRITING once `reader_count` reaches zero.
    #[must_use]
    pub fn resolve_draining_to_writing(&self, sequence: u64) -> bool {
        if self.reader_count.load(Ordering::Acquire) != 0 {
            return false;
        }
        self.sequence.store(sequence, Ordering::Relaxed);
        self.state.store(SlotState::Writing as u32, Ordering::Release);
        true
    }

    /// DRAINING -> COMMITTED: the drain spin timed out, so the producer
    /// reverses its wraparound attempt and surfaces `WriterReaderTimeout`.
    pub fn reverse_draining_to_committed(&self) {
        self.state.store(SlotState::Committed as u32, Ordering::Release);
    }

    /// WRITING -> COMMITTED. Stores `committed_length` and, if a digest was
    /// computed, the payload checksum, strictly before the Release store to
    /// `state` so an Acquire-observing reader sees both (§4.B, §8.4).
    pub fn commit(&self, committed_length: u32, checksum: Option<[u8; DIGEST_LEN]>) {
        self.committed_length.store(committed_length, Ordering::Relaxed);
        if let Some(digest) = checksum {
            // SAFETY: exclusive access while state is still `Writing`; no
            // reader can observe `payload_checksum` until the Release
            // store below flips `state` to `Committed`.
            unsafe {
                *self.payload_checksum.get() = digest;
            }
        }
        self.state.store(SlotState::Committed as u32, Ordering::Release);
    }

    /// WRITING -> FREE: abort path, used on drop-without-commit.
    pub fn abort(&self) {
        self.state.store(SlotState::Free as u32, Ordering::Release);
    }

    /// COMMITTED -> FREE: direct overwrite permitted once the ring-full
    /// check has already established there is no live reader to protect.
    #[must_use]
    pub fn direct_overwrite_to_free(&self) -> bool {
        self.state
            .compare_exchange(
                SlotState::Committed as u32,
                SlotState::Free as u32,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Reader acquire (§4.B): bump `reader_count` only while `Committed`,
    /// then recheck to close the window where the producer concurrently
    /// entered `DRAINING`.
    #[must_use]
    pub fn try_reader_acquire(&self) -> bool {
        if self.state.load(Ordering::Acquire) != SlotState::Committed as u32 {
            return false;
        }
        self.reader_count.fetch_add(1, Ordering::AcqRel);
        if self.state.load(Ordering::Acquire) != SlotState::Committed as u32 {
            self.reader_count.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        true
    }

    pub fn reader_release(&self) {
        self.reader_count.fetch_sub(1, Ordering::Release);
    }

    /// Recovery-only: force the slot to `FREE` regardless of its current
    /// state, clearing ownership metadata but preserving payload bytes
    /// (§4.H `force_reset_slot`).
    pub fn force_reset(&self) {
        self.reader_count.store(0, Ordering::Release);
        self.write_lock.store(0, Ordering::Release);
        self.state.store(SlotState::Free as u32, Ordering::Release);
    }

    /// Recovery-only: clear ownership metadata like [`Self::force_reset`],
    /// but land on `COMMITTED` instead of `FREE` (§4.H `release_zombie_writer`
    /// restoring a verified preceding commit instead of discarding it).
    /// `committed_length`/`payload_checksum` are left untouched, the same way
    /// `force_reset` leaves the payload bytes untouched.
    pub fn restore_to_committed(&self) {
        self.reader_count.store(0, Ordering::Release);
        self.write_lock.store(0, Ordering::Release);
        self.state.store(SlotState::Committed as u32, Ordering::Release);
    }
}
