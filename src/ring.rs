// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Ring Coordinator (§4.C): global write/commit/read indices, ring-full
//! policy per `consumer_sync_policy`, timeouts, and the slot-layer
//! producer/consumer guards.
//!
//! Grounded on the teacher's `ShmRingWriter`/`ShmRingReader`
//! (`transport/shm/ring.rs`), generalized from "one writer, N independent
//! single-reader cursors" to the full four-state SSM with draining and
//! three distinct consumer sync policies.

use crate::backoff::{Backoff, Deadline};
use crate::checksum::DigestKey;
use crate::config::{ChecksumPolicy, ConsumerSyncPolicy};
use crate::error::{DataHubError, Result};
use crate::layout::SegmentLayout;
use crate::metrics::MetricsSnapshot;
use crate::slot::SlotState;
use std::sync::Arc;

/// Everything a producer handle and every consumer handle over the same
/// channel need to share. One instance per mapped segment per process.
pub struct ChannelShared {
    pub layout: SegmentLayout,
    pub checksum_key: DigestKey,
    pub checksum_policy: ChecksumPolicy,
    pub consumer_sync_policy: ConsumerSyncPolicy,
}

impl ChannelShared {
    pub fn from_layout(layout: SegmentLayout) -> Result<Arc<Self>> {
        let checksum_policy = layout.header().checksum_policy()?;
        let consumer_sync_policy = layout.header().consumer_sync_policy()?;
        let checksum_key = DigestKey::derive(layout.header().shared_secret());
        Ok(Arc::new(Self {
            layout,
            checksum_key,
            checksum_policy,
            consumer_sync_policy,
        }))
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.layout.header().metrics_snapshot()
    }

    pub fn reset_metrics(&self) {
        self.layout.header().reset_metrics();
    }
}

/// Where a consumer's read cursor lives: the shared header field for
/// `Latest_only`/`Single_reader`, or this consumer's own heartbeat-table
/// entry for `Sync_reader`.
#[derive(Clone, Copy)]
pub enum ConsumerCursor {
    Shared,
    PerConsumer(usize),
}

impl ConsumerCursor {
    fn next_read_position(&self, shared: &ChannelShared) -> u64 {
        match self {
            ConsumerCursor::Shared => shared.layout.header().read_index(),
            ConsumerCursor::PerConsumer(index) => {
                shared.layout.header().heartbeat_table().get(*index).next_read_position()
            }
        }
    }

    fn advance_to(&self, shared: &ChannelShared, new_value: u64) {
        match self {
            ConsumerCursor::Shared => shared.layout.header().advance_read_index_to(new_value),
            ConsumerCursor::PerConsumer(index) => shared
                .layout
                .header()
                .heartbeat_table()
                .get(*index)
                .advance_next_read_position(new_value),
        }
    }
}

/// The minimum read position the ring-full check must respect: `read_index`
/// for `Latest_only`/`Single_reader`, or the slowest `Sync_reader` consumer.
/// Absent any registered `Sync_reader`, there is nobody to back-pressure
/// against, so the writer is not blocked.
///
/// Each cursor advances the moment a slot is handed out by
/// [`acquire_consume_slot`], not once the reader finishes with it, so this
/// watermark only guards against overtaking a position no reader has even
/// seen yet. A writer that wraps onto a position a reader is still holding
/// sees `COMMITTED` with `reader_count > 0` and enters `DRAINING` (§4.B);
/// that handshake, not this gate, is what protects an in-flight read.
fn ring_full_watermark(shared: &ChannelShared) -> u64 {
    match shared.consumer_sync_policy {
        ConsumerSyncPolicy::LatestOnly | ConsumerSyncPolicy::SingleReader => {
            shared.layout.header().read_index()
        }
        ConsumerSyncPolicy::SyncReader => shared
            .layout
            .header()
            .heartbeat_table()
            .min_next_read_position()
            .unwrap_or_else(|| shared.layout.header().write_index()),
    }
}

/// An exclusive, writable reference to one slot's payload buffer, acquired
/// through [`acquire_write_slot`]. Abort-on-drop: dropping without calling
/// [`WriteSlot::commit`] releases the slot back to `FREE` (§4.G).
pub struct WriteSlot {
    shared: Arc<ChannelShared>,
    index: usize,
    sequence: u64,
    pid: u64,
    pending_checksum: Option<[u8; crate::checksum::DIGEST_LEN]>,
    committed: bool,
    released: bool,
}

impl WriteSlot {
    /// Mutable view of this slot's payload bytes.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        // SAFETY: this handle holds `write_lock` for `index` and the slot
        // is in `WRITING` state for the whole lifetime of `WriteSlot`.
        unsafe { self.shared.layout.payload_mut(self.index) }
    }

    pub fn logical_unit_size(&self) -> usize {
        self.shared.layout.header().logical_unit_size()
    }

    /// `Manual` checksum policy: compute and stash the digest over the
    /// first `len` payload bytes, to be written by the next `commit`.
    pub fn update_checksum_slot(&mut self, len: u32) {
        let digest = {
            let shared = Arc::clone(&self.shared);
            let payload = &self.payload_mut()[..len as usize];
            shared.checksum_key.digest(payload)
        };
        self.pending_checksum = Some(digest);
    }

    /// WRITING -> COMMITTED (§4.B, §4.C). Validates `len`, optionally
    /// updates the payload checksum, stores with Release, and advances
    /// `commit_index`.
    pub fn commit(&mut self, len: u32) -> Result<()> {
        if self.committed {
            return Err(DataHubError::Invalid("slot already committed".into()));
        }
        let capacity = self.logical_unit_size() as u32;
        if len == 0 || len > capacity {
            return Err(DataHubError::Invalid(format!(
                "commit length {len} out of bounds (0, {capacity}]"
            )));
        }

        let checksum = match self.shared.checksum_policy {
            ChecksumPolicy::None => None,
            ChecksumPolicy::Enforced => {
                let shared = Arc::clone(&self.shared);
                let payload = &self.payload_mut()[..len as usize];
                Some(shared.checksum_key.digest(payload))
            }
            ChecksumPolicy::Manual => self.pending_checksum,
        };

        self.shared.layout.slot(self.index).commit(len, checksum);
        self.shared
            .layout
            .header()
            .advance_commit_index_to(self.sequence + 1);
        self.committed = true;
        Ok(())
    }

    /// Idempotent: a second release returns `true` with no other side
    /// effects (§8 "round-trip and idempotence laws").
    pub fn release(&mut self) -> bool {
        if self.released {
            return true;
        }
        self.released = true;
        if !self.committed {
            self.shared.layout.slot(self.index).abort();
        } else {
            self.shared.layout.header().metrics().inc_total_slots_written();
        }
        self.shared.layout.slot(self.index).clear_write_lock();
        true
    }
}

impl Drop for WriteSlot {
    fn drop(&mut self) {
        self.release();
    }
}

/// A read-only reference to one slot's payload bytes, acquired through
/// [`acquire_consume_slot`]. Releases on drop if not already released.
pub struct ConsumeSlot {
    shared: Arc<ChannelShared>,
    index: usize,
    sequence: u64,
    released: bool,
}

impl ConsumeSlot {
    pub fn payload(&self) -> &[u8] {
        let len = self.shared.layout.slot(self.index).committed_length() as usize;
        &self.shared.layout.payload(self.index)[..len]
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// `Manual` checksum policy: verify the stored digest against the
    /// current payload bytes without releasing the slot.
    pub fn verify_checksum_slot(&self) -> bool {
        let slot = self.shared.layout.slot(self.index);
        self.shared
            .checksum_key
            .verify(self.payload(), &slot.payload_checksum())
    }

    /// Decrement `reader_count` and, for `Enforced` segments, verify the
    /// payload checksum. Idempotent. The consumer's cursor is not touched
    /// here: [`acquire_consume_slot`] already advanced it the moment this
    /// slot was handed out, so a writer can wrap onto it (and enter
    /// `DRAINING`) without waiting for this release.
    pub fn release(&mut self) -> bool {
        if self.released {
            return true;
        }
        self.released = true;

        let slot = self.shared.layout.slot(self.index);
        let mut ok = true;
        if self.shared.checksum_policy == ChecksumPolicy::Enforced {
            ok = self.shared.checksum_key.verify(self.payload(), &slot.payload_checksum());
            if !ok {
                log::warn!("[ring] checksum mismatch on slot {} (sequence {})", self.index, self.sequence);
                self.shared.layout.header().metrics().inc_checksum_failures();
            }
        }
        slot.reader_release();
        self.shared.layout.header().metrics().inc_total_slots_read();
        ok
    }
}

impl Drop for ConsumeSlot {
    fn drop(&mut self) {
        self.release();
    }
}

/// Reclaim a slot whose `write_lock` holder is no longer alive, the way
/// [`crate::diagnostic::DiagnosticHandle::release_zombie_writer`] does, but
/// inline so the fast acquire path does not need a second round trip.
fn reclaim_dead_writer(shared: &ChannelShared, index: usize, is_alive: impl Fn(u64) -> bool) -> bool {
    let slot = shared.layout.slot(index);
    let holder = slot.write_lock_holder();
    if holder == 0 || is_alive(holder) {
        return false;
    }
    log::warn!("[ring] reclaiming slot {index} from dead writer pid={holder}");
    slot.force_reset();
    shared.layout.header().inc_recovery_actions_count();
    true
}

/// `acquire_write_slot(timeout_ms)` (§4.C). `timeout_ms == 0` means wait
/// indefinitely.
pub fn acquire_write_slot(
    shared: &Arc<ChannelShared>,
    pid: u64,
    timeout_ms: u64,
) -> Result<Option<WriteSlot>> {
    let deadline = Deadline::from_timeout_ms(timeout_ms);
    let capacity = shared.layout.capacity() as u64;
    let mut backoff = Backoff::new();

    // Ring-full check.
    loop {
        let write_index = shared.layout.header().write_index();
        let watermark = ring_full_watermark(shared);
        if write_index.saturating_sub(watermark) < capacity {
            break;
        }
        if deadline.expired() {
            log::debug!("[ring] writer timed out waiting for a free slot (watermark={watermark})");
            shared.layout.header().metrics().inc_writer_timeout();
            return Ok(None);
        }
        backoff.snooze();
    }

    // Slot reserve.
    let sequence = shared.layout.header().fetch_add_write_index();
    let index = (sequence % capacity) as usize;

    backoff.reset();
    loop {
        if shared.layout.slot(index).try_acquire_write_lock(pid) {
            break;
        }
        if reclaim_dead_writer(shared, index, crate::diagnostic::is_process_alive) {
            continue;
        }
        if deadline.expired() {
            shared.layout.header().metrics().inc_writer_lock_timeout();
            return Ok(None);
        }
        backoff.snooze();
    }

    // SSM transition.
    let slot = shared.layout.slot(index);
    match slot.state() {
        SlotState::Free => slot.begin_writing(sequence),
        SlotState::Committed => {
            if slot.reader_count() == 0 {
                let _ = slot.direct_overwrite_to_free();
                slot.begin_writing(sequence);
            } else if slot.enter_draining() {
                backoff.reset();
                loop {
                    if slot.resolve_draining_to_writing(sequence) {
                        break;
                    }
                    if deadline.expired() {
                        slot.reverse_draining_to_committed();
                        slot.clear_write_lock();
                        shared.layout.header().metrics().inc_writer_reader_timeout();
                        return Ok(None);
                    }
                    backoff.snooze();
                }
            } else {
                // Lost a race to enter draining; another producer path is
                // not possible (single writer), so retry the transition.
                slot.begin_writing(sequence);
            }
        }
        SlotState::Writing | SlotState::Draining => {
            // Unreachable under the single-producer contract; defensively
            // reclaim rather than corrupt state.
            slot.force_reset();
            slot.begin_writing(sequence);
        }
    }

    Ok(Some(WriteSlot {
        shared: Arc::clone(shared),
        index,
        sequence,
        pid,
        pending_checksum: None,
        committed: false,
        released: false,
    }))
}

/// `acquire_consume_slot(timeout_ms)` (§4.C), policy-specific slot
/// selection plus the SSM reader-acquire guard.
pub fn acquire_consume_slot(
    shared: &Arc<ChannelShared>,
    cursor: ConsumerCursor,
    timeout_ms: u64,
) -> Result<Option<ConsumeSlot>> {
    let deadline = Deadline::from_timeout_ms(timeout_ms);
    let capacity = shared.layout.capacity() as u64;
    let mut backoff = Backoff::new();

    loop {
        let commit_index = shared.layout.header().commit_index();
        let target = match shared.consumer_sync_policy {
            ConsumerSyncPolicy::LatestOnly => {
                if commit_index == 0 {
                    None
                } else {
                    let latest = commit_index - 1;
                    let last_delivered = cursor.next_read_position(shared);
                    if latest + 1 > last_delivered {
                        Some(latest)
                    } else {
                        None
                    }
                }
            }
            ConsumerSyncPolicy::SingleReader | ConsumerSyncPolicy::SyncReader => {
                let next = cursor.next_read_position(shared);
                if next < commit_index {
                    Some(next)
                } else {
                    None
                }
            }
        };

        if let Some(target) = target {
            let index = (target % capacity) as usize;
            let slot = shared.layout.slot(index);
            if slot.try_reader_acquire() {
                if slot.sequence() != target {
                    // The producer wrapped this index again between our
                    // selection and the acquire; defensive recheck (§8.7).
                    slot.reader_release();
                    shared.layout.header().metrics().inc_reader_race_detected();
                } else {
                    // Claim the position as soon as it is handed out, not
                    // once the reader finishes with it (§4.C "Ring-full
                    // check" + §4.B "Draining policy"): the ring-full gate
                    // only needs to know a position has been *seen* by a
                    // reader to let the writer wrap onto it, and the SSM's
                    // DRAINING state is what protects a read still in
                    // flight. Advancing here (rather than in `release`)
                    // means a writer that wraps onto a slot a reader is
                    // still holding actually observes `COMMITTED` with
                    // `reader_count > 0` and enters `DRAINING`, instead of
                    // being held indefinitely by this same cursor in the
                    // ring-full spin loop above.
                    cursor.advance_to(shared, target + 1);
                    return Ok(Some(ConsumeSlot {
                        shared: Arc::clone(shared),
                        index,
                        sequence: target,
                        released: false,
                    }));
                }
            }
        }

        if deadline.expired() {
            return Ok(None);
        }
        backoff.snooze();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PhysicalPageSize, Policy, SegmentConfigBuilder};
    use crate::layout::SegmentLayout;

    fn unique_name(tag: &str) -> String {
        use std::time::{SystemTime, UNIX_EPOCH};
        let ts = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
        format!("/datahub_ring_test_{tag}_{ts}")
    }

    fn make_channel(
        name: &str,
        capacity: u32,
        sync_policy: ConsumerSyncPolicy,
        checksum_policy: ChecksumPolicy,
    ) -> Arc<ChannelShared> {
        let config = SegmentConfigBuilder::new()
            .policy(Policy::RingBuffer)
            .consumer_sync_policy(sync_policy)
            .physical_page_size(PhysicalPageSize::Size4K)
            .ring_buffer_capacity(capacity)
            .checksum_policy(checksum_policy)
            .build()
            .expect("valid config");
        let key = DigestKey::derive(config.shared_secret);
        let layout = SegmentLayout::create(name, &config, &key).expect("create layout");
        ChannelShared::from_layout(layout).expect("channel shared")
    }

    #[test]
    fn roundtrip_latest_only_none_checksum() {
        let name = unique_name("roundtrip");
        let shared = make_channel(&name, 2, ConsumerSyncPolicy::LatestOnly, ChecksumPolicy::None);

        let mut w = acquire_write_slot(&shared, 1, 1000)
            .expect("acquire ok")
            .expect("slot available");
        let value: u64 = 0xDEAD_BEEF_1234_5678;
        w.payload_mut()[..8].copy_from_slice(&value.to_le_bytes());
        w.commit(8).expect("commit ok");
        w.release();

        let mut r = acquire_consume_slot(&shared, ConsumerCursor::Shared, 1000)
            .expect("acquire ok")
            .expect("slot available");
        let got = u64::from_le_bytes(r.payload()[..8].try_into().unwrap());
        assert_eq!(got, value);
        assert!(r.release());

        assert_eq!(shared.metrics().total_slots_written, 1);
        SegmentLayout::unlink(&name).ok();
    }

    #[test]
    fn abort_on_drop_leaves_nothing_for_consumer() {
        let name = unique_name("abort");
        let shared = make_channel(&name, 2, ConsumerSyncPolicy::LatestOnly, ChecksumPolicy::None);

        {
            let mut w = acquire_write_slot(&shared, 1, 500).unwrap().unwrap();
            w.payload_mut()[0] = 0xBA;
            // scope ends without commit: abort-on-drop
        }

        let result = acquire_consume_slot(&shared, ConsumerCursor::Shared, 50).unwrap();
        assert!(result.is_none());
        assert_eq!(shared.metrics().total_slots_written, 0);
        SegmentLayout::unlink(&name).ok();
    }

    #[test]
    fn latest_only_skips_to_newest_commit() {
        let name = unique_name("skip");
        let shared = make_channel(&name, 4, ConsumerSyncPolicy::LatestOnly, ChecksumPolicy::None);

        for value in [1u8, 2, 3] {
            let mut w = acquire_write_slot(&shared, 1, 1000).unwrap().unwrap();
            w.payload_mut()[0] = value;
            w.commit(1).unwrap();
        }

        let mut r = acquire_consume_slot(&shared, ConsumerCursor::Shared, 1000)
            .unwrap()
            .unwrap();
        assert_eq!(r.payload()[0], 3);
        r.release();

        let again = acquire_consume_slot(&shared, ConsumerCursor::Shared, 50).unwrap();
        assert!(again.is_none());
        SegmentLayout::unlink(&name).ok();
    }

    #[test]
    fn ring_full_times_out_without_a_consumer() {
        let name = unique_name("ringfull");
        let shared = make_channel(&name, 2, ConsumerSyncPolicy::SingleReader, ChecksumPolicy::None);

        for _ in 0..2 {
            let mut w = acquire_write_slot(&shared, 1, 1000).unwrap().unwrap();
            w.payload_mut()[0] = 1;
            w.commit(1).unwrap();
        }

        let third = acquire_write_slot(&shared, 1, 50).unwrap();
        assert!(third.is_none());
        let snap = shared.metrics();
        assert!(snap.writer_timeout_count >= 1);
        assert_eq!(snap.writer_reader_timeout_count, 0);
        SegmentLayout::unlink(&name).ok();
    }

    #[test]
    fn checksum_tamper_is_detected_on_release() {
        let name = unique_name("checksum");
        let shared = make_channel(&name, 2, ConsumerSyncPolicy::LatestOnly, ChecksumPolicy::Enforced);

        let mut w = acquire_write_slot(&shared, 1, 1000).unwrap().unwrap();
        w.payload_mut()[0] = 0x11;
        w.commit(1).unwrap();

        // SAFETY: test has exclusive access; simulates external corruption
        // caught by a diagnostic tool flipping a byte.
        unsafe {
            shared.layout.payload_mut(0)[0] ^= 0xFF;
        }

        let mut r = acquire_consume_slot(&shared, ConsumerCursor::Shared, 1000)
            .unwrap()
            .unwrap();
        assert!(!r.release());
        assert!(shared.metrics().checksum_failures >= 1);
        SegmentLayout::unlink(&name).ok();
    }
}
