// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Creation-time configuration (§3.5): the layout descriptor is fixed at
//! creation and persisted verbatim into the header, so every field here is
//! validated once, up front, by [`SegmentConfig::build`].

use crate::error::{DataHubError, Result};

pub const IDENTITY_STRING_CAPACITY: usize = 64;

/// Buffering discipline. Closed set, matched exhaustively wherever it
/// influences ring behavior (§9 "three policies known at creation").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    Single,
    DoubleBuffer,
    RingBuffer,
}

/// How consumers advance through committed slots and how the producer is
/// back-pressured (§4.C).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerSyncPolicy {
    /// Always read the newest commit; may skip, never regresses.
    LatestOnly,
    /// Exactly one logical reader, strictly in commit order.
    SingleReader,
    /// Any number of independent readers, each with its own cursor; the
    /// producer is back-pressured by the slowest one.
    SyncReader,
}

/// When and how the keyed digest is maintained (§4.D).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumPolicy {
    /// No digest is stored or verified.
    None,
    /// Digest is written during `commit()` and verified during
    /// `release_consume_slot()` automatically.
    Enforced,
    /// Caller must explicitly call `update_checksum_slot`/`verify_checksum_slot`.
    Manual,
}

impl Default for ChecksumPolicy {
    fn default() -> Self {
        ChecksumPolicy::None
    }
}

/// `physical_page_size`, constrained to the two values the spec recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhysicalPageSize {
    Size4K,
    Size4M,
}

impl PhysicalPageSize {
    pub fn bytes(self) -> usize {
        match self {
            PhysicalPageSize::Size4K => 4 * 1024,
            PhysicalPageSize::Size4M => 4 * 1024 * 1024,
        }
    }
}

fn round_up(value: usize, multiple: usize) -> usize {
    if multiple == 0 {
        return value;
    }
    value.div_ceil(multiple) * multiple
}

fn bounded_identity(s: &str, field: &'static str) -> Result<[u8; IDENTITY_STRING_CAPACITY]> {
    let bytes = s.as_bytes();
    if bytes.len() >= IDENTITY_STRING_CAPACITY {
        return Err(DataHubError::Invalid(format!(
            "{field} exceeds {IDENTITY_STRING_CAPACITY}-byte identity capacity"
        )));
    }
    let mut buf = [0u8; IDENTITY_STRING_CAPACITY];
    buf[..bytes.len()].copy_from_slice(bytes);
    Ok(buf)
}

/// Validated, immutable creation-time configuration. Construct through
/// [`SegmentConfigBuilder`]; this struct itself is only ever produced by a
/// successful `build()`, so every other module can treat its fields as
/// already-checked.
#[derive(Debug, Clone)]
pub struct SegmentConfig {
    pub policy: Policy,
    pub consumer_sync_policy: ConsumerSyncPolicy,
    pub physical_page_size: PhysicalPageSize,
    pub logical_unit_size: usize,
    pub ring_buffer_capacity: u32,
    pub flex_zone_size: usize,
    pub checksum_policy: ChecksumPolicy,
    pub shared_secret: u64,
    pub hub_uid: [u8; IDENTITY_STRING_CAPACITY],
    pub hub_name: [u8; IDENTITY_STRING_CAPACITY],
    pub producer_uid: [u8; IDENTITY_STRING_CAPACITY],
    pub producer_name: [u8; IDENTITY_STRING_CAPACITY],
    pub flex_zone_schema_hash: [u8; 32],
    pub slot_schema_hash: [u8; 32],
}

/// Fluent builder mirroring the teacher's `ParticipantBuilder` idiom: every
/// option is a `pub(crate)`-free setter returning `Self`, with `build()` as
/// the single validation choke point (§3.5 "invalid combinations ... must
/// be rejected at creation").
#[derive(Debug, Clone)]
pub struct SegmentConfigBuilder {
    policy: Option<Policy>,
    consumer_sync_policy: Option<ConsumerSyncPolicy>,
    physical_page_size: Option<PhysicalPageSize>,
    logical_unit_size: usize,
    ring_buffer_capacity: u32,
    flex_zone_size: usize,
    checksum_policy: ChecksumPolicy,
    shared_secret: u64,
    hub_uid: String,
    hub_name: String,
    producer_uid: String,
    producer_name: String,
    flex_zone_schema_hash: [u8; 32],
    slot_schema_hash: [u8; 32],
}

impl SegmentConfigBuilder {
    pub fn new() -> Self {
        Self {
            policy: None,
            consumer_sync_policy: None,
            physical_page_size: None,
            logical_unit_size: 0,
            ring_buffer_capacity: 0,
            flex_zone_size: 0,
            checksum_policy: ChecksumPolicy::None,
            shared_secret: 0,
            hub_uid: String::new(),
            hub_name: String::new(),
            producer_uid: String::new(),
            producer_name: String::new(),
            flex_zone_schema_hash: [0u8; 32],
            slot_schema_hash: [0u8; 32],
        }
    }

    pub fn policy(mut self, policy: Policy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn consumer_sync_policy(mut self, policy: ConsumerSyncPolicy) -> Self {
        self.consumer_sync_policy = Some(policy);
        self
    }

    pub fn physical_page_size(mut self, size: PhysicalPageSize) -> Self {
        self.physical_page_size = Some(size);
        self
    }

    /// `0` means "same as `physical_page_size`" (§3.5).
    pub fn logical_unit_size(mut self, bytes: usize) -> Self {
        self.logical_unit_size = bytes;
        self
    }

    pub fn ring_buffer_capacity(mut self, capacity: u32) -> Self {
        self.ring_buffer_capacity = capacity;
        self
    }

    pub fn flex_zone_size(mut self, bytes: usize) -> Self {
        self.flex_zone_size = bytes;
        self
    }

    pub fn checksum_policy(mut self, policy: ChecksumPolicy) -> Self {
        self.checksum_policy = policy;
        self
    }

    pub fn shared_secret(mut self, secret: u64) -> Self {
        self.shared_secret = secret;
        self
    }

    pub fn hub_uid(mut self, uid: impl Into<String>) -> Self {
        self.hub_uid = uid.into();
        self
    }

    pub fn hub_name(mut self, name: impl Into<String>) -> Self {
        self.hub_name = name.into();
        self
    }

    pub fn producer_uid(mut self, uid: impl Into<String>) -> Self {
        self.producer_uid = uid.into();
        self
    }

    pub fn producer_name(mut self, name: impl Into<String>) -> Self {
        self.producer_name = name.into();
        self
    }

    pub fn flex_zone_schema_hash(mut self, hash: [u8; 32]) -> Self {
        self.flex_zone_schema_hash = hash;
        self
    }

    pub fn slot_schema_hash(mut self, hash: [u8; 32]) -> Self {
        self.slot_schema_hash = hash;
        self
    }

    pub fn build(self) -> Result<SegmentConfig> {
        let policy = self
            .policy
            .ok_or_else(|| DataHubError::Invalid("policy must be set".into()))?;
        let consumer_sync_policy = self
            .consumer_sync_policy
            .ok_or_else(|| DataHubError::Invalid("consumer_sync_policy must be set".into()))?;
        let physical_page_size = self
            .physical_page_size
            .ok_or_else(|| DataHubError::Invalid("physical_page_size must be set".into()))?;

        if self.ring_buffer_capacity == 0 {
            return Err(DataHubError::Invalid(
                "ring_buffer_capacity must be >= 1".into(),
            ));
        }

        let page_bytes = physical_page_size.bytes();
        let logical_unit_size = if self.logical_unit_size == 0 {
            page_bytes
        } else {
            if self.logical_unit_size % page_bytes != 0 {
                return Err(DataHubError::Invalid(format!(
                    "logical_unit_size {} is not a multiple of physical_page_size {}",
                    self.logical_unit_size, page_bytes
                )));
            }
            self.logical_unit_size
        };

        // §9 open question: flex_zone_size == 0 is treated uniformly as
        // "no zone" rather than rejected.
        let flex_zone_size = if self.flex_zone_size == 0 {
            0
        } else {
            round_up(self.flex_zone_size, page_bytes)
        };

        Ok(SegmentConfig {
            policy,
            consumer_sync_policy,
            physical_page_size,
            logical_unit_size,
            ring_buffer_capacity: self.ring_buffer_capacity,
            flex_zone_size,
            checksum_policy: self.checksum_policy,
            shared_secret: self.shared_secret,
            hub_uid: bounded_identity(&self.hub_uid, "hub_uid")?,
            hub_name: bounded_identity(&self.hub_name, "hub_name")?,
            producer_uid: bounded_identity(&self.producer_uid, "producer_uid")?,
            producer_name: bounded_identity(&self.producer_name, "producer_name")?,
            flex_zone_schema_hash: self.flex_zone_schema_hash,
            slot_schema_hash: self.slot_schema_hash,
        })
    }
}

impl Default for SegmentConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl Policy {
    pub fn to_code(self) -> u8 {
        match self {
            Policy::Single => 0,
            Policy::DoubleBuffer => 1,
            Policy::RingBuffer => 2,
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(Policy::Single),
            1 => Ok(Policy::DoubleBuffer),
            2 => Ok(Policy::RingBuffer),
            other => Err(DataHubError::Invalid(format!("unknown policy code {other}"))),
        }
    }
}

impl ConsumerSyncPolicy {
    pub fn to_code(self) -> u8 {
        match self {
            ConsumerSyncPolicy::LatestOnly => 0,
            ConsumerSyncPolicy::SingleReader => 1,
            ConsumerSyncPolicy::SyncReader => 2,
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(ConsumerSyncPolicy::LatestOnly),
            1 => Ok(ConsumerSyncPolicy::SingleReader),
            2 => Ok(ConsumerSyncPolicy::SyncReader),
            other => Err(DataHubError::Invalid(format!(
                "unknown consumer_sync_policy code {other}"
            ))),
        }
    }
}

impl ChecksumPolicy {
    pub fn to_code(self) -> u8 {
        match self {
            ChecksumPolicy::None => 0,
            ChecksumPolicy::Enforced => 1,
            ChecksumPolicy::Manual => 2,
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(ChecksumPolicy::None),
            1 => Ok(ChecksumPolicy::Enforced),
            2 => Ok(ChecksumPolicy::Manual),
            other => Err(DataHubError::Invalid(format!(
                "unknown checksum_policy code {other}"
            ))),
        }
    }
}
