// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! End-to-end scenarios, one test per entry in the seed suite.

use datahub_core::checksum::DigestKey;
use datahub_core::config::{ChecksumPolicy, ConsumerSyncPolicy, PhysicalPageSize, Policy, SegmentConfigBuilder};
use datahub_core::diagnostic::DiagnosticHandle;
use datahub_core::handles::{ConsumerHandle, ProducerHandle};
use datahub_core::layout::SegmentLayout;
use datahub_core::ring::ChannelShared;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

fn unique_name(tag: &str) -> String {
    let ts = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
    format!("/datahub_e2e_{tag}_{ts}")
}

fn channel(
    name: &str,
    capacity: u32,
    sync: ConsumerSyncPolicy,
    checksum: ChecksumPolicy,
) -> Arc<ChannelShared> {
    let config = SegmentConfigBuilder::new()
        .policy(Policy::RingBuffer)
        .consumer_sync_policy(sync)
        .physical_page_size(PhysicalPageSize::Size4K)
        .ring_buffer_capacity(capacity)
        .checksum_policy(checksum)
        .build()
        .expect("valid config");
    let key = DigestKey::derive(config.shared_secret);
    let layout = SegmentLayout::create(name, &config, &key).expect("create layout");
    ChannelShared::from_layout(layout).expect("channel shared")
}

/// Scenario 1: roundtrip.
#[test]
fn roundtrip_delivers_the_written_value() {
    let name = unique_name("roundtrip");
    let shared = channel(&name, 2, ConsumerSyncPolicy::LatestOnly, ChecksumPolicy::None);
    let producer = ProducerHandle::attach(Arc::clone(&shared));
    let consumer = ConsumerHandle::attach(Arc::clone(&shared), 1).unwrap();

    let mut slot = producer.acquire_write_slot(1000).unwrap().expect("slot available");
    slot.payload_mut()[..8].copy_from_slice(&0xDEADBEEF12345678u64.to_le_bytes());
    slot.commit(8).unwrap();
    slot.release();

    let consumed = consumer.acquire_consume_slot(1000).unwrap().expect("value available");
    let value = u64::from_le_bytes(consumed.payload()[..8].try_into().unwrap());
    assert_eq!(value, 0xDEADBEEF12345678);
    drop(consumed);

    assert_eq!(shared.metrics().total_slots_written, 1);
    SegmentLayout::unlink(&name).ok();
}

/// Scenario 2: abort-on-drop.
#[test]
fn uncommitted_slot_is_invisible_and_does_not_count_as_written() {
    let name = unique_name("abort");
    let shared = channel(&name, 2, ConsumerSyncPolicy::LatestOnly, ChecksumPolicy::None);
    let producer = ProducerHandle::attach(Arc::clone(&shared));
    let consumer = ConsumerHandle::attach(Arc::clone(&shared), 1).unwrap();

    {
        let mut slot = producer.acquire_write_slot(500).unwrap().expect("slot available");
        slot.payload_mut()[0] = 0xAD;
        // scope exits without commit(); WriteSlot's Drop aborts it.
    }

    let consumed = consumer.acquire_consume_slot(50).unwrap();
    assert!(consumed.is_none());
    assert_eq!(shared.metrics().total_slots_written, 0);
    SegmentLayout::unlink(&name).ok();
}

/// Scenario 3: latest-only skipping.
#[test]
fn latest_only_consumer_skips_to_the_newest_commit() {
    let name = unique_name("latest");
    let shared = channel(&name, 4, ConsumerSyncPolicy::LatestOnly, ChecksumPolicy::None);
    let producer = ProducerHandle::attach(Arc::clone(&shared));
    let consumer = ConsumerHandle::attach(Arc::clone(&shared), 1).unwrap();

    for value in [1u8, 2, 3] {
        let mut slot = producer.acquire_write_slot(1000).unwrap().expect("slot available");
        slot.payload_mut()[0] = value;
        slot.commit(1).unwrap();
    }

    let consumed = consumer.acquire_consume_slot(1000).unwrap().expect("latest value");
    assert_eq!(consumed.payload()[0], 3);
    drop(consumed);

    let second = consumer.acquire_consume_slot(50).unwrap();
    assert!(second.is_none());
    SegmentLayout::unlink(&name).ok();
}

/// Scenario 4: ring-full timeout with no consumer draining the ring.
#[test]
fn ring_full_without_a_consumer_times_out_the_writer() {
    let name = unique_name("ringfull");
    let shared = channel(&name, 2, ConsumerSyncPolicy::SingleReader, ChecksumPolicy::None);
    let producer = ProducerHandle::attach(Arc::clone(&shared));

    for value in [1u8, 2] {
        let mut slot = producer.acquire_write_slot(1000).unwrap().expect("slot available");
        slot.payload_mut()[0] = value;
        slot.commit(1).unwrap();
    }

    let third = producer.acquire_write_slot(50).unwrap();
    assert!(third.is_none());

    let metrics = shared.metrics();
    assert!(metrics.writer_timeout_count >= 1);
    assert_eq!(metrics.writer_reader_timeout_count, 0);
    SegmentLayout::unlink(&name).ok();
}

/// Scenario 5: a second writer that wraps onto a COMMITTED slot a consumer
/// is still holding enters DRAINING through the real `acquire_write_slot`
/// path, a concurrent consumer acquire during the drain sees nothing, and
/// once the first consumer releases the writer resolves to WRITING and
/// publishes.
#[test]
fn draining_resolves_to_writing_once_the_reader_releases() {
    let name = unique_name("draining");
    let shared = channel(&name, 1, ConsumerSyncPolicy::LatestOnly, ChecksumPolicy::None);
    let producer = ProducerHandle::attach(Arc::clone(&shared));
    let consumer = ConsumerHandle::attach(Arc::clone(&shared), 1).unwrap();

    let mut slot = producer.acquire_write_slot(1000).unwrap().expect("slot available");
    slot.payload_mut()[0] = 111;
    slot.commit(1).unwrap();
    slot.release();

    // Holds the only slot open; the writer below must wrap onto it.
    let mut held = consumer.acquire_consume_slot(1000).unwrap().expect("value available");

    // A concurrent consumer acquire during the drain window sees nothing:
    // the slot is DRAINING, not COMMITTED, and there is nothing else to read.
    let during_drain = std::thread::scope(|scope| {
        let writer = scope.spawn(|| producer.acquire_write_slot(2000).unwrap().expect("writer wins the drain"));

        // Give the writer a moment to win write_lock and enter DRAINING
        // before probing for a concurrent read.
        std::thread::sleep(std::time::Duration::from_millis(100));
        let probe = consumer.acquire_consume_slot(50).unwrap();

        std::thread::sleep(std::time::Duration::from_millis(50));
        held.release();

        (probe, writer.join().unwrap())
    });
    let (probe, mut second_writer) = during_drain;
    assert!(probe.is_none(), "consumer must not observe a slot mid-drain");

    second_writer.payload_mut()[0] = 222;
    second_writer.commit(1).unwrap();
    second_writer.release();

    let consumed = consumer.acquire_consume_slot(1000).unwrap().expect("second value available");
    assert_eq!(consumed.payload()[0], 222);
    assert!(shared.metrics().writer_reader_timeout_count == 0);
    SegmentLayout::unlink(&name).ok();
}

/// Scenario 6: if the reader never releases before the second writer's
/// deadline, the drain reverses back to COMMITTED with the write lock
/// cleared, not WRITING, and `acquire_write_slot` returns `None`.
#[test]
fn draining_timeout_restores_committed_state() {
    let name = unique_name("drain_timeout");
    let shared = channel(&name, 1, ConsumerSyncPolicy::LatestOnly, ChecksumPolicy::None);
    let producer = ProducerHandle::attach(Arc::clone(&shared));
    let consumer = ConsumerHandle::attach(Arc::clone(&shared), 1).unwrap();

    let mut slot = producer.acquire_write_slot(1000).unwrap().expect("slot available");
    slot.payload_mut()[0] = 111;
    slot.commit(1).unwrap();
    slot.release();

    // Held for the rest of the test: the second writer's drain never resolves.
    let mut held = consumer.acquire_consume_slot(1000).unwrap().expect("value available");

    let second = producer.acquire_write_slot(50).unwrap();
    assert!(second.is_none(), "drain must time out while the reader still holds the slot");

    let slot_meta = shared.layout.slot(0);
    assert_eq!(slot_meta.state(), datahub_core::slot::SlotState::Committed);
    assert_eq!(slot_meta.write_lock_holder(), 0);
    assert!(shared.metrics().writer_reader_timeout_count >= 1);

    held.release();
    SegmentLayout::unlink(&name).ok();
}

/// Scenario 7: checksum detection on tampered payload bytes.
#[test]
fn tampered_payload_fails_checksum_verification_on_release() {
    let name = unique_name("tamper");
    let shared = channel(&name, 2, ConsumerSyncPolicy::SingleReader, ChecksumPolicy::Enforced);
    let producer = ProducerHandle::attach(Arc::clone(&shared));
    let consumer = ConsumerHandle::attach(Arc::clone(&shared), 1).unwrap();

    let mut slot = producer.acquire_write_slot(1000).unwrap().expect("slot available");
    slot.payload_mut()[0] = 0x01;
    slot.commit(1).unwrap();
    drop(slot);

    // SAFETY: test has exclusive access; no writer holds this slot right now.
    unsafe {
        shared.layout.payload_mut(0)[0] ^= 0xFF;
    }

    let mut consumed = consumer.acquire_consume_slot(1000).unwrap().expect("committed slot available");
    assert!(!consumed.release());
    assert!(shared.metrics().checksum_failures >= 1);
    SegmentLayout::unlink(&name).ok();
}

/// Scenario 8: dead-consumer cleanup.
#[test]
fn cleanup_dead_consumers_reclaims_a_nonexistent_pid() {
    let name = unique_name("dead_consumer");
    let shared = channel(&name, 2, ConsumerSyncPolicy::SyncReader, ChecksumPolicy::None);
    shared.layout.header().heartbeat_table().register(1, u64::MAX - 1);
    shared.layout.header().inc_active_consumer_count();

    let diag = DiagnosticHandle::new(&shared.layout);
    let before = shared.layout.header().recovery_actions_count();
    let reclaimed = diag.cleanup_dead_consumers();

    assert_eq!(reclaimed, 1);
    assert_eq!(shared.layout.header().active_consumer_count(), 0);
    assert!(shared.layout.header().recovery_actions_count() > before);
    SegmentLayout::unlink(&name).ok();
}
