// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared Segment Layout (§4.A): the canonical byte layout of the mapped
//! region (header, per-slot state array, flex zone, payload slab) and the
//! deterministic offset arithmetic between them.
//!
//! Creation allocates the whole region up front, zero-fills it, writes the
//! header, computes `layout_checksum` over the immutable descriptor, then
//! flips `magic_number` to the valid constant as the last store — the same
//! "zero-fill, populate, publish" sequence the teacher's SHM transport uses
//! for its (much smaller) control block.

use crate::checksum::{compute_layout_checksum, validate_layout_checksum, DigestKey, LayoutDescriptor, DIGEST_LEN};
use crate::config::{ChecksumPolicy, ConsumerSyncPolicy, Policy, SegmentConfig, IDENTITY_STRING_CAPACITY};
use crate::error::{DataHubError, Result};
use crate::heartbeat::{ConsumerHeartbeat, HeartbeatTable, HEARTBEAT_TABLE_CAPACITY};
use crate::metrics::{MetricsSnapshot, RingMetrics};
use crate::segment::MappedSegment;
use crate::slot::SlotMeta;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// `"DATB"` as a little-endian u32.
pub const MAGIC_NUMBER: u32 = 0x4441_5442;
pub const LAYOUT_VERSION: u32 = 1;

const RESERVED_BYTES: usize = 64;

fn round_up(value: usize, multiple: usize) -> usize {
    if multiple == 0 {
        return value;
    }
    value.div_ceil(multiple) * multiple
}

/// The single header instance at offset 0 (§3.1).
#[repr(C)]
pub struct Header {
    magic_number: AtomicU32,
    layout_version: u32,
    physical_page_size: u32,
    logical_unit_size: u32,
    ring_buffer_capacity: u32,
    flex_zone_size: u32,
    policy: u8,
    consumer_sync_policy: u8,
    checksum_policy: u8,
    _reserved_flag: u8,
    shared_secret: u64,
    flex_zone_schema_hash: [u8; 32],
    slot_schema_hash: [u8; 32],
    write_index: AtomicU64,
    commit_index: AtomicU64,
    read_index: AtomicU64,
    producer_pid: AtomicU64,
    producer_last_heartbeat_ns: AtomicU64,
    active_consumer_count: AtomicU32,
    _pad_active_consumer: u32,
    recovery_actions_count: AtomicU64,
    hub_uid: [u8; IDENTITY_STRING_CAPACITY],
    hub_name: [u8; IDENTITY_STRING_CAPACITY],
    producer_uid: [u8; IDENTITY_STRING_CAPACITY],
    producer_name: [u8; IDENTITY_STRING_CAPACITY],
    consumer_heartbeats: [ConsumerHeartbeat; HEARTBEAT_TABLE_CAPACITY],
    metrics: RingMetrics,
    _reserved: [u8; RESERVED_BYTES],
    /// Keyed digest over every field above (except itself); last field in
    /// the struct by design (SPEC_FULL §3.7).
    layout_checksum: [u8; DIGEST_LEN],
}

fn trim_identity(bytes: &[u8; IDENTITY_STRING_CAPACITY]) -> &str {
    let len = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    std::str::from_utf8(&bytes[..len]).unwrap_or("")
}

impl Header {
    pub fn validate_magic(&self) -> bool {
        self.magic_number.load(Ordering::Acquire) == MAGIC_NUMBER
    }

    pub fn layout_version(&self) -> u32 {
        self.layout_version
    }

    pub fn ring_buffer_capacity(&self) -> u32 {
        self.ring_buffer_capacity
    }

    pub fn logical_unit_size(&self) -> usize {
        self.logical_unit_size as usize
    }

    pub fn flex_zone_size(&self) -> usize {
        self.flex_zone_size as usize
    }

    pub fn policy(&self) -> Result<Policy> {
        Policy::from_code(self.policy)
    }

    pub fn consumer_sync_policy(&self) -> Result<ConsumerSyncPolicy> {
        ConsumerSyncPolicy::from_code(self.consumer_sync_policy)
    }

    pub fn checksum_policy(&self) -> Result<ChecksumPolicy> {
        ChecksumPolicy::from_code(self.checksum_policy)
    }

    pub fn shared_secret(&self) -> u64 {
        self.shared_secret
    }

    pub fn flex_zone_schema_hash(&self) -> &[u8; 32] {
        &self.flex_zone_schema_hash
    }

    pub fn slot_schema_hash(&self) -> &[u8; 32] {
        &self.slot_schema_hash
    }

    pub fn hub_uid(&self) -> &str {
        trim_identity(&self.hub_uid)
    }

    pub fn hub_name(&self) -> &str {
        trim_identity(&self.hub_name)
    }

    pub fn producer_uid(&self) -> &str {
        trim_identity(&self.producer_uid)
    }

    pub fn producer_name(&self) -> &str {
        trim_identity(&self.producer_name)
    }

    pub fn layout_checksum(&self) -> &[u8; DIGEST_LEN] {
        &self.layout_checksum
    }

    pub fn descriptor(&self) -> LayoutDescriptor<'_> {
        LayoutDescriptor {
            physical_page_size: self.physical_page_size,
            logical_unit_size: self.logical_unit_size,
            ring_buffer_capacity: self.ring_buffer_capacity,
            flex_zone_size: self.flex_zone_size,
            policy: self.policy,
            consumer_sync_policy: self.consumer_sync_policy,
            checksum_policy: self.checksum_policy,
            flex_zone_schema_hash: &self.flex_zone_schema_hash,
            slot_schema_hash: &self.slot_schema_hash,
            hub_uid: &self.hub_uid,
            hub_name: &self.hub_name,
            producer_uid: &self.producer_uid,
            producer_name: &self.producer_name,
        }
    }

    pub fn validate_layout_checksum(&self, key: &DigestKey) -> bool {
        validate_layout_checksum(key, &self.descriptor(), &self.layout_checksum)
    }

    // --- Ring indices (§3.1 invariants: commit_index <= write_index,
    // read_index <= commit_index) ---

    pub fn write_index(&self) -> u64 {
        self.write_index.load(Ordering::Acquire)
    }

    pub fn fetch_add_write_index(&self) -> u64 {
        self.write_index.fetch_add(1, Ordering::AcqRel)
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index.load(Ordering::Acquire)
    }

    /// Monotonic advance: only ever moves forward, via CAS loop, so two
    /// producers racing on recovery can never regress it.
    pub fn advance_commit_index_to(&self, new_value: u64) {
        let mut current = self.commit_index.load(Ordering::Acquire);
        while current < new_value {
            match self.commit_index.compare_exchange_weak(
                current,
                new_value,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn read_index(&self) -> u64 {
        self.read_index.load(Ordering::Acquire)
    }

    pub fn advance_read_index_to(&self, new_value: u64) {
        let mut current = self.read_index.load(Ordering::Acquire);
        while current < new_value {
            match self.read_index.compare_exchange_weak(
                current,
                new_value,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }

    // --- Producer heartbeat (§4.E) ---

    pub fn producer_pid(&self) -> u64 {
        self.producer_pid.load(Ordering::Acquire)
    }

    pub fn set_producer_pid(&self, pid: u64) {
        self.producer_pid.store(pid, Ordering::Release);
    }

    pub fn producer_last_heartbeat_ns(&self) -> u64 {
        self.producer_last_heartbeat_ns.load(Ordering::Acquire)
    }

    pub fn pulse_producer(&self) {
        self.producer_last_heartbeat_ns
            .store(crate::heartbeat::now_ns(), Ordering::Release);
    }

    // --- Consumer bookkeeping ---

    pub fn active_consumer_count(&self) -> u32 {
        self.active_consumer_count.load(Ordering::Acquire)
    }

    pub fn inc_active_consumer_count(&self) {
        self.active_consumer_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn dec_active_consumer_count(&self) {
        self.active_consumer_count.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn heartbeat_table(&self) -> HeartbeatTable<'_> {
        HeartbeatTable::new(&self.consumer_heartbeats)
    }

    pub fn recovery_actions_count(&self) -> u64 {
        self.recovery_actions_count.load(Ordering::Acquire)
    }

    pub fn inc_recovery_actions_count(&self) {
        self.recovery_actions_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn metrics(&self) -> &RingMetrics {
        &self.metrics
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot(self.recovery_actions_count())
    }

    pub fn reset_metrics(&self) {
        self.metrics.reset();
    }
}

/// The fully-typed view over a mapped region: header, slot array, flex
/// zone, and payload slab at their deterministic offsets.
pub struct SegmentLayout {
    segment: MappedSegment,
    slot_array_offset: usize,
    flex_zone_offset: usize,
    payload_offset: usize,
    capacity: usize,
    logical_unit_size: usize,
    flex_zone_size: usize,
}

impl SegmentLayout {
    fn offsets(config: &SegmentConfig) -> (usize, usize, usize, usize) {
        let header_bytes = round_up(std::mem::size_of::<Header>(), 64);
        let slot_array_offset = header_bytes;
        let slot_array_bytes = config.ring_buffer_capacity as usize * std::mem::size_of::<SlotMeta>();
        let flex_zone_offset = slot_array_offset + slot_array_bytes;
        let page_bytes = config.physical_page_size.bytes();
        let payload_offset = round_up(flex_zone_offset + config.flex_zone_size, page_bytes);
        let total = round_up(
            payload_offset + config.ring_buffer_capacity as usize * config.logical_unit_size,
            page_bytes,
        );
        (slot_array_offset, flex_zone_offset, payload_offset, total)
    }

    /// Total byte size of the region this config requires.
    pub fn region_size(config: &SegmentConfig) -> usize {
        Self::offsets(config).3
    }

    pub fn create(name: &str, config: &SegmentConfig, key: &DigestKey) -> Result<Self> {
        let (slot_array_offset, flex_zone_offset, payload_offset, total_size) = Self::offsets(config);
        let segment = MappedSegment::create(name, total_size)?;

        let layout = Self {
            segment,
            slot_array_offset,
            flex_zone_offset,
            payload_offset,
            capacity: config.ring_buffer_capacity as usize,
            logical_unit_size: config.logical_unit_size,
            flex_zone_size: config.flex_zone_size,
        };

        // SAFETY: the segment was just created and zero-filled by
        // MappedSegment::create, and is not yet reachable by any other
        // process (the name was unlinked-then-recreated exclusively), so a
        // plain pointer write here races with nothing.
        let header_ptr = layout.segment.as_ptr() as *mut Header;
        unsafe {
            (*header_ptr).layout_version = LAYOUT_VERSION;
            (*header_ptr).physical_page_size = config.physical_page_size.bytes() as u32;
            (*header_ptr).logical_unit_size = config.logical_unit_size as u32;
            (*header_ptr).ring_buffer_capacity = config.ring_buffer_capacity;
            (*header_ptr).flex_zone_size = config.flex_zone_size as u32;
            (*header_ptr).policy = config.policy.to_code();
            (*header_ptr).consumer_sync_policy = config.consumer_sync_policy.to_code();
            (*header_ptr).checksum_policy = config.checksum_policy.to_code();
            (*header_ptr).shared_secret = config.shared_secret;
            (*header_ptr).flex_zone_schema_hash = config.flex_zone_schema_hash;
            (*header_ptr).slot_schema_hash = config.slot_schema_hash;
            (*header_ptr).hub_uid = config.hub_uid;
            (*header_ptr).hub_name = config.hub_name;
            (*header_ptr).producer_uid = config.producer_uid;
            (*header_ptr).producer_name = config.producer_name;
        }

        let checksum = compute_layout_checksum(key, &layout.header().descriptor());
        // SAFETY: still exclusive access, same reasoning as above.
        unsafe {
            (*header_ptr).layout_checksum = checksum;
        }

        // Last store: flips the segment from "being built" to "valid".
        layout.header().magic_number.store(MAGIC_NUMBER, Ordering::Release);

        Ok(layout)
    }

    /// Attach to an existing segment.
    ///
    /// The control plane only hands consumers a `(shm_name, shared_secret,
    /// schema_hashes)` rendezvous result (§6.2), not the producer's layout
    /// descriptor, so `open` discovers capacity/logical-unit-size/flex-zone
    /// size itself: it maps a header-sized prefix first, validates `magic`
    /// and `layout_version`, reads the now-trustworthy descriptor fields,
    /// then drops that mapping and remaps the whole region at its true
    /// size. Callers (normally [`crate::identity`]) still run the full
    /// attach gate (secret, schema hashes, layout checksum) afterward.
    pub fn open(name: &str) -> Result<Self> {
        let probe_size = round_up(std::mem::size_of::<Header>(), 64);
        let (capacity, logical_unit_size, flex_zone_size, physical_page_size) = {
            let probe = MappedSegment::open(name, probe_size)?;
            // SAFETY: probe_size >= size_of::<Header>(), offset 0, 8-byte
            // alignment satisfied by the page-aligned mmap base.
            let header = unsafe { &*(probe.as_ptr() as *const Header) };
            if !header.validate_magic() {
                return Err(DataHubError::MagicCorrupt);
            }
            if header.layout_version() != LAYOUT_VERSION {
                return Err(DataHubError::Invalid(format!(
                    "layout_version {} unsupported (expected {LAYOUT_VERSION})",
                    header.layout_version()
                )));
            }
            (
                header.ring_buffer_capacity(),
                header.logical_unit_size(),
                header.flex_zone_size(),
                header.physical_page_size,
            )
        };

        let full_config = crate::config::SegmentConfigBuilder::new()
            .policy(Policy::RingBuffer)
            .consumer_sync_policy(ConsumerSyncPolicy::SyncReader)
            .physical_page_size(if physical_page_size as usize == crate::config::PhysicalPageSize::Size4M.bytes() {
                crate::config::PhysicalPageSize::Size4M
            } else {
                crate::config::PhysicalPageSize::Size4K
            })
            .ring_buffer_capacity(capacity)
            .logical_unit_size(logical_unit_size)
            .flex_zone_size(flex_zone_size)
            .build()?;
        let (slot_array_offset, flex_zone_offset, payload_offset, total_size) = Self::offsets(&full_config);

        let segment = MappedSegment::open(name, total_size)?;
        let layout = Self {
            segment,
            slot_array_offset,
            flex_zone_offset,
            payload_offset,
            capacity: capacity as usize,
            logical_unit_size,
            flex_zone_size,
        };

        if !layout.header().validate_magic() {
            return Err(DataHubError::MagicCorrupt);
        }
        Ok(layout)
    }

    pub fn unlink(name: &str) -> Result<()> {
        MappedSegment::unlink(name)
    }

    pub fn segment_name(&self) -> &str {
        self.segment.name()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn header(&self) -> &Header {
        // SAFETY: offset 0, segment sized at creation to include the
        // header, Header's alignment (8 from its AtomicU64 fields) is
        // satisfied by the page-aligned mmap base.
        unsafe { &*(self.segment.as_ptr() as *const Header) }
    }

    pub fn slot(&self, index: usize) -> &SlotMeta {
        debug_assert!(index < self.capacity);
        let offset = self.slot_array_offset + index * std::mem::size_of::<SlotMeta>();
        // SAFETY: offset is within the segment (capacity checked by the
        // debug_assert and, in release builds, by every caller indexing
        // with `write_index % capacity`), and SlotMeta's 64-byte alignment
        // divides the slot array's base offset (itself 64-byte aligned).
        unsafe { &*(self.segment.as_ptr().add(offset) as *const SlotMeta) }
    }

    /// Read-only view of slot `index`'s payload bytes.
    pub fn payload(&self, index: usize) -> &[u8] {
        debug_assert!(index < self.capacity);
        let offset = self.payload_offset + index * self.logical_unit_size;
        // SAFETY: offset + logical_unit_size is within the mapped region
        // by construction (payload_offset + capacity*logical_unit_size <=
        // total_size, see `offsets`).
        unsafe { std::slice::from_raw_parts(self.segment.as_ptr().add(offset), self.logical_unit_size) }
    }

    /// Mutable view of slot `index`'s payload bytes.
    ///
    /// # Safety
    ///
    /// Caller must hold `write_lock` for this slot and the slot must be in
    /// `WRITING` state; payload bytes are otherwise jointly owned by
    /// concurrent readers once `COMMITTED`.
    pub unsafe fn payload_mut(&self, index: usize) -> &mut [u8] {
        debug_assert!(index < self.capacity);
        let offset = self.payload_offset + index * self.logical_unit_size;
        std::slice::from_raw_parts_mut(self.segment.as_ptr().add(offset), self.logical_unit_size)
    }

    pub fn flex_zone(&self) -> &[u8] {
        // SAFETY: flex_zone_offset + flex_zone_size <= payload_offset <= total_size.
        unsafe { std::slice::from_raw_parts(self.segment.as_ptr().add(self.flex_zone_offset), self.flex_zone_size) }
    }

    /// # Safety
    ///
    /// Caller must hold whatever flex-zone spinlock guards the sub-range
    /// being written; the core only guarantees sub-zone ranges don't
    /// overlap (§3.3).
    pub unsafe fn flex_zone_mut(&self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.segment.as_ptr().add(self.flex_zone_offset), self.flex_zone_size)
    }
}
