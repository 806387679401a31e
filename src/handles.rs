// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Producer/Consumer Handles (§4.G): the public slot-layer API
//! (`acquire -> write|read -> commit/verify -> release`) plus a
//! transaction-layer wrapper giving callers a bounded, lazy sequence of
//! acquisition attempts with implicit publish-on-normal-exit,
//! abort-on-panic semantics.
//!
//! Grounded on the teacher's `Publisher`/`Subscriber` handle pair
//! (`dds/publisher.rs`, `dds/subscriber.rs`): move transfers ownership, a
//! moved-from handle is inert, and every handle owns an `Arc` back to
//! shared per-channel state so it can outlive the builder that created it.

use crate::checksum::DigestKey;
use crate::config::{ChecksumPolicy, ConsumerSyncPolicy};
use crate::diagnostic::is_process_alive;
use crate::error::{DataHubError, Result};
use crate::heartbeat::DEFAULT_LIVENESS_WINDOW;
use crate::ring::{
    acquire_consume_slot, acquire_write_slot, ChannelShared, ConsumeSlot, ConsumerCursor, WriteSlot,
};
use std::sync::Arc;
use std::time::Duration;

/// A write slot reference handed to the caller's callable inside
/// [`WriteTransaction::slots`]. Owns the underlying [`WriteSlot`] outright,
/// so it carries no borrow back into the transaction.
///
/// Drop semantics implement §4.G directly: if the caller never called
/// [`Self::publish`] and the stack is not unwinding from a panic, the slot
/// is implicitly published at its full logical unit size (normal exit); if
/// the stack *is* unwinding, [`WriteSlot`]'s own abort-on-drop takes over
/// and the slot is discarded instead.
pub struct WriteSlotRef {
    slot: Option<WriteSlot>,
    published: bool,
}

impl WriteSlotRef {
    pub fn payload_mut(&mut self) -> &mut [u8] {
        self.slot.as_mut().expect("slot present until drop").payload_mut()
    }

    pub fn logical_unit_size(&self) -> usize {
        self.slot.as_ref().expect("slot present until drop").logical_unit_size()
    }

    pub fn update_checksum_slot(&mut self, len: u32) {
        self.slot.as_mut().expect("slot present until drop").update_checksum_slot(len);
    }

    /// Explicit publish. Idempotent: calling twice is a no-op the second
    /// time around.
    pub fn publish(&mut self, len: u32) -> Result<()> {
        if self.published {
            return Ok(());
        }
        self.slot.as_mut().expect("slot present until drop").commit(len)?;
        self.published = true;
        Ok(())
    }
}

impl Drop for WriteSlotRef {
    fn drop(&mut self) {
        if let Some(mut slot) = self.slot.take() {
            if !self.published && !std::thread::panicking() {
                let len = slot.logical_unit_size() as u32;
                // Implicit publish: if the caller wrote nothing, this
                // commits whatever garbage/zero bytes are present, matching
                // §4.G's "implicit publish" rather than a silent abort.
                let _ = slot.commit(len);
            }
            // slot's own Drop clears write_lock and, if still uncommitted
            // (the panicking path), aborts back to FREE.
        }
    }
}

/// An acquire attempt that did not yield a slot before its per-attempt or
/// outer deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquireError {
    pub timed_out: bool,
}

/// Context passed to the callable given to `with_write_transaction`:
/// exposes the flex zone and a bounded, lazy sequence of write attempts.
pub struct WriteTransaction<'a> {
    shared: &'a Arc<ChannelShared>,
    pid: u64,
    outer_deadline: crate::backoff::Deadline,
    flex_zone_touched: bool,
}

impl<'a> WriteTransaction<'a> {
    pub fn flex_zone(&mut self) -> &mut [u8] {
        self.flex_zone_touched = true;
        // SAFETY: flex-zone sub-range exclusivity is an application-level
        // contract (§3.3); the transaction wrapper only guarantees it does
        // not race its own slot operations, which never touch the flex zone.
        unsafe { self.shared.layout.flex_zone_mut() }
    }

    /// A finite lazy sequence of acquisition attempts, one per iteration,
    /// each bounded by `per_attempt_timeout` and by the transaction's outer
    /// deadline, whichever is shorter. A transient failure (ring full, lock
    /// contention) yields `Err` and keeps the sequence alive for the next
    /// `next()` call; only the outer deadline expiring ends it for good.
    pub fn slots(&self, per_attempt_timeout: u64) -> WriteSlotIter<'a> {
        WriteSlotIter {
            shared: self.shared,
            pid: self.pid,
            per_attempt_timeout,
            outer_deadline: self.outer_deadline,
        }
    }
}

pub struct WriteSlotIter<'a> {
    shared: &'a Arc<ChannelShared>,
    pid: u64,
    per_attempt_timeout: u64,
    outer_deadline: crate::backoff::Deadline,
}

fn effective_timeout(outer: crate::backoff::Deadline, per_attempt: u64) -> u64 {
    match outer {
        crate::backoff::Deadline::Forever => per_attempt,
        crate::backoff::Deadline::At(at) => {
            let remaining_ms = at
                .saturating_duration_since(std::time::Instant::now())
                .as_millis() as u64;
            if per_attempt == 0 {
                remaining_ms
            } else {
                remaining_ms.min(per_attempt)
            }
        }
    }
}

impl Iterator for WriteSlotIter<'_> {
    type Item = std::result::Result<WriteSlotRef, AcquireError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.outer_deadline.expired() {
            return None;
        }
        let timeout = effective_timeout(self.outer_deadline, self.per_attempt_timeout);
        match acquire_write_slot(self.shared, self.pid, timeout) {
            Ok(Some(slot)) => Some(Ok(WriteSlotRef {
                slot: Some(slot),
                published: false,
            })),
            _ => Some(Err(AcquireError { timed_out: true })),
        }
    }
}

/// An exclusive producer over one channel. Construction registers the
/// producer's PID and pulses its heartbeat (§4.E); the PID is cleared on
/// drop.
pub struct ProducerHandle {
    shared: Arc<ChannelShared>,
    pid: u64,
    moved_from: bool,
}

impl ProducerHandle {
    pub fn attach(shared: Arc<ChannelShared>) -> Self {
        let pid = std::process::id() as u64;
        shared.layout.header().set_producer_pid(pid);
        shared.layout.header().pulse_producer();
        Self {
            shared,
            pid,
            moved_from: false,
        }
    }

    pub fn pulse(&self) {
        self.shared.layout.header().pulse_producer();
    }

    /// Slot layer: `acquire_write_slot` directly. A moved-from handle
    /// always returns `Ok(None)` rather than touching shared state (§4.G).
    pub fn acquire_write_slot(&self, timeout_ms: u64) -> Result<Option<WriteSlot>> {
        if self.moved_from {
            return Ok(None);
        }
        acquire_write_slot(&self.shared, self.pid, timeout_ms)
    }

    /// Transaction layer (§4.G): bounded, lazy write attempts over
    /// `timeout_ms`. On normal return of `f`, an `Enforced`-policy flex
    /// zone the caller touched gets its checksum recomputed implicitly; on
    /// panic, that update is suppressed and the panic propagates after any
    /// held [`WriteSlotRef`] aborts via its own unwind-aware `Drop`.
    pub fn with_write_transaction<F, R>(&self, timeout_ms: u64, f: F) -> Result<R>
    where
        F: FnOnce(&mut WriteTransaction<'_>) -> R,
    {
        if self.moved_from {
            return Err(DataHubError::Invalid("handle was moved from".into()));
        }
        let mut tx = WriteTransaction {
            shared: &self.shared,
            pid: self.pid,
            outer_deadline: crate::backoff::Deadline::from_timeout_ms(timeout_ms),
            flex_zone_touched: false,
        };

        let value = f(&mut tx);

        if tx.flex_zone_touched && self.shared.checksum_policy == ChecksumPolicy::Enforced {
            // The flex zone has no dedicated header slot to persist its
            // digest into (§3.3 leaves sub-zone checksums to the
            // application); `flex_zone_checksum` recomputes it the same way
            // on demand for callers that want to persist it themselves.
            let _ = self.flex_zone_checksum();
        }
        Ok(value)
    }

    /// On-demand flex-zone checksum, computed the same way
    /// `with_write_transaction`'s implicit update would (§4.D).
    pub fn flex_zone_checksum(&self) -> [u8; crate::checksum::DIGEST_LEN] {
        self.shared.checksum_key.digest(self.shared.layout.flex_zone())
    }

    pub fn get_metrics(&self) -> crate::metrics::MetricsSnapshot {
        self.shared.metrics()
    }

    pub fn reset_metrics(&self) {
        self.shared.reset_metrics();
    }
}

impl Drop for ProducerHandle {
    fn drop(&mut self) {
        if !self.moved_from {
            self.shared.layout.header().set_producer_pid(0);
        }
    }
}

/// One registered consumer. Owns a heartbeat-table entry for
/// `Sync_reader`, or rides the shared cursor for `Latest_only`/
/// `Single_reader`.
pub struct ConsumerHandle {
    shared: Arc<ChannelShared>,
    heartbeat_index: Option<usize>,
    liveness_window: Duration,
    moved_from: bool,
}

impl ConsumerHandle {
    pub fn attach(shared: Arc<ChannelShared>, consumer_id: u64) -> Result<Self> {
        let pid = std::process::id() as u64;
        let heartbeat_index = if shared.consumer_sync_policy == ConsumerSyncPolicy::SyncReader {
            let index = shared
                .layout
                .header()
                .heartbeat_table()
                .register(consumer_id, pid)
                .ok_or_else(|| DataHubError::Invalid("heartbeat table exhausted".into()))?;
            Some(index)
        } else {
            None
        };
        shared.layout.header().inc_active_consumer_count();
        Ok(Self {
            shared,
            heartbeat_index,
            liveness_window: DEFAULT_LIVENESS_WINDOW,
            moved_from: false,
        })
    }

    fn cursor(&self) -> ConsumerCursor {
        match self.heartbeat_index {
            Some(index) => ConsumerCursor::PerConsumer(index),
            None => ConsumerCursor::Shared,
        }
    }

    pub fn pulse(&self) {
        if let Some(index) = self.heartbeat_index {
            self.shared.layout.header().heartbeat_table().get(index).pulse();
        }
    }

    pub fn with_liveness_window(mut self, window: Duration) -> Self {
        self.liveness_window = window;
        self
    }

    pub fn is_fresh(&self) -> bool {
        match self.heartbeat_index {
            Some(index) => self
                .shared
                .layout
                .header()
                .heartbeat_table()
                .get(index)
                .is_fresh(self.liveness_window),
            None => true,
        }
    }

    /// Slot layer: `acquire_consume_slot` directly. Pulses the heartbeat on
    /// every call (§4.E "every normal acquire call updates
    /// last_heartbeat_ns").
    pub fn acquire_consume_slot(&self, timeout_ms: u64) -> Result<Option<ConsumeSlot>> {
        if self.moved_from {
            return Ok(None);
        }
        self.pulse();
        acquire_consume_slot(&self.shared, self.cursor(), timeout_ms)
    }

    /// Transaction layer (§4.G): bounded, lazy read attempts over
    /// `timeout_ms`. Each iteration step pulses the heartbeat.
    pub fn with_read_transaction<F, R>(&self, timeout_ms: u64, f: F) -> Result<R>
    where
        F: FnOnce(&mut ReadTransaction<'_>) -> R,
    {
        if self.moved_from {
            return Err(DataHubError::Invalid("handle was moved from".into()));
        }
        let mut tx = ReadTransaction {
            handle: self,
            outer_deadline: crate::backoff::Deadline::from_timeout_ms(timeout_ms),
        };
        Ok(f(&mut tx))
    }

    pub fn flex_zone(&self) -> &[u8] {
        self.shared.layout.flex_zone()
    }

    pub fn get_metrics(&self) -> crate::metrics::MetricsSnapshot {
        self.shared.metrics()
    }
}

impl Drop for ConsumerHandle {
    fn drop(&mut self) {
        if !self.moved_from {
            if let Some(index) = self.heartbeat_index {
                self.shared.layout.header().heartbeat_table().release(index);
            }
            self.shared.layout.header().dec_active_consumer_count();
        }
    }
}

pub struct ReadTransaction<'a> {
    handle: &'a ConsumerHandle,
    outer_deadline: crate::backoff::Deadline,
}

impl<'a> ReadTransaction<'a> {
    pub fn slots(&self, per_attempt_timeout: u64) -> ReadSlotIter<'a> {
        ReadSlotIter {
            handle: self.handle,
            per_attempt_timeout,
            outer_deadline: self.outer_deadline,
        }
    }

    pub fn flex_zone(&self) -> &[u8] {
        self.handle.flex_zone()
    }
}

pub struct ReadSlotIter<'a> {
    handle: &'a ConsumerHandle,
    per_attempt_timeout: u64,
    outer_deadline: crate::backoff::Deadline,
}

impl Iterator for ReadSlotIter<'_> {
    type Item = std::result::Result<ConsumeSlot, AcquireError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.outer_deadline.expired() {
            return None;
        }
        let timeout = effective_timeout(self.outer_deadline, self.per_attempt_timeout);
        match self.handle.acquire_consume_slot(timeout) {
            Ok(Some(slot)) => Some(Ok(slot)),
            Ok(None) => None,
            Err(_) => Some(Err(AcquireError { timed_out: false })),
        }
    }
}

pub fn producer_is_alive(shared: &ChannelShared) -> bool {
    is_process_alive(shared.layout.header().producer_pid())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PhysicalPageSize, Policy, SegmentConfigBuilder};
    use crate::layout::SegmentLayout;

    fn unique_name(tag: &str) -> String {
        use std::time::{SystemTime, UNIX_EPOCH};
        let ts = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
        format!("/datahub_handles_test_{tag}_{ts}")
    }

    fn make_channel(name: &str, capacity: u32) -> Arc<ChannelShared> {
        let config = SegmentConfigBuilder::new()
            .policy(Policy::RingBuffer)
            .consumer_sync_policy(ConsumerSyncPolicy::SyncReader)
            .physical_page_size(PhysicalPageSize::Size4K)
            .ring_buffer_capacity(capacity)
            .flex_zone_size(64)
            .checksum_policy(ChecksumPolicy::None)
            .build()
            .expect("valid config");
        let key = DigestKey::derive(config.shared_secret);
        let layout = SegmentLayout::create(name, &config, &key).expect("create layout");
        ChannelShared::from_layout(layout).expect("channel shared")
    }

    #[test]
    fn producer_and_consumer_transaction_roundtrip() {
        let name = unique_name("tx");
        let shared = make_channel(&name, 4);
        let producer = ProducerHandle::attach(Arc::clone(&shared));
        let consumer = ConsumerHandle::attach(Arc::clone(&shared), 1).unwrap();

        producer
            .with_write_transaction(1000, |tx| {
                for slot_result in tx.slots(1000) {
                    let mut slot = slot_result.expect("slot available");
                    slot.payload_mut()[0] = 0x55;
                    slot.publish(1).unwrap();
                    break;
                }
            })
            .unwrap();

        let mut seen = 0u8;
        consumer
            .with_read_transaction(1000, |tx| {
                for slot_result in tx.slots(1000) {
                    let slot = slot_result.expect("slot available");
                    seen = slot.payload()[0];
                }
            })
            .unwrap();

        assert_eq!(seen, 0x55);
        SegmentLayout::unlink(&name).ok();
    }

    #[test]
    fn unpublished_slot_is_implicitly_published_on_normal_exit() {
        let name = unique_name("implicit");
        let shared = make_channel(&name, 2);
        let producer = ProducerHandle::attach(Arc::clone(&shared));

        producer
            .with_write_transaction(1000, |tx| {
                for slot_result in tx.slots(1000) {
                    let mut slot = slot_result.expect("slot available");
                    slot.payload_mut()[0] = 0xAB;
                    // no explicit publish() call
                    break;
                }
            })
            .unwrap();

        let consumer = ConsumerHandle::attach(Arc::clone(&shared), 9).unwrap();
        let slot = consumer.acquire_consume_slot(500).unwrap();
        assert!(slot.is_some(), "implicit publish must make the slot visible");
        SegmentLayout::unlink(&name).ok();
    }

    #[test]
    fn consumer_attach_registers_heartbeat_entry() {
        let name = unique_name("heartbeat");
        let shared = make_channel(&name, 2);
        let consumer = ConsumerHandle::attach(Arc::clone(&shared), 7).unwrap();
        assert!(consumer.is_fresh());
        assert_eq!(shared.layout.header().active_consumer_count(), 1);
        drop(consumer);
        assert_eq!(shared.layout.header().active_consumer_count(), 0);
        SegmentLayout::unlink(&name).ok();
    }

    #[test]
    fn write_transaction_aborts_slot_on_panic() {
        let name = unique_name("panic");
        let shared = make_channel(&name, 2);
        let producer = ProducerHandle::attach(Arc::clone(&shared));

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            producer
                .with_write_transaction(1000, |tx| {
                    for slot_result in tx.slots(1000) {
                        let mut slot = slot_result.expect("slot available");
                        slot.payload_mut()[0] = 1;
                        panic!("simulated producer failure mid-write");
                    }
                })
                .unwrap();
        }));
        assert!(result.is_err());

        let consumer = ConsumerHandle::attach(Arc::clone(&shared), 2).unwrap();
        let next = consumer.acquire_consume_slot(50).unwrap();
        assert!(next.is_none(), "aborted slot must not be visible to consumers");
        SegmentLayout::unlink(&name).ok();
    }
}
