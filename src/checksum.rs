// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Keyed digest computation for payload, flex-zone, and layout checksums
//! (§4.D).
//!
//! The spec leaves the exact digest function as an open question ("keyed
//! BLAKE2b is referenced but not required"). This crate already depends on
//! `ring` for the same reason the DDS Security session-key derivation code
//! does (`ring::hkdf`), so the checksum engine reuses it: `ring::hmac` with
//! SHA-256 gives a 256-bit keyed digest, well past the 128-bit collision
//! floor the spec requires, without adding an ungrounded dependency.

use crate::config::IDENTITY_STRING_CAPACITY;
use ring::hmac;

/// Length in bytes of every digest this module produces.
pub const DIGEST_LEN: usize = 32;

/// A derived HMAC key, one per segment. Cheap to keep around: `ring::hmac`
/// keys are immutable and `Sync`.
pub struct DigestKey(hmac::Key);

impl DigestKey {
    /// Derive the HMAC key from the channel's `shared_secret`.
    ///
    /// Channels with `shared_secret == 0` ("non-secret channel", §3.5)
    /// still get a well-defined, non-zero key: the digest continues to
    /// guard against torn reads and accidental corruption even when it
    /// provides no confidentiality guarantee.
    pub fn derive(shared_secret: u64) -> Self {
        const DOMAIN: &[u8] = b"datahub-core/v1";
        let mut material = [0u8; 8 + DOMAIN.len()];
        material[..8].copy_from_slice(&shared_secret.to_le_bytes());
        material[8..].copy_from_slice(DOMAIN);
        let derived = ring::digest::digest(&ring::digest::SHA256, &material);
        DigestKey(hmac::Key::new(hmac::HMAC_SHA256, derived.as_ref()))
    }

    /// Digest `data`, returning exactly [`DIGEST_LEN`] bytes.
    pub fn digest(&self, data: &[u8]) -> [u8; DIGEST_LEN] {
        let tag = hmac::sign(&self.0, data);
        let mut out = [0u8; DIGEST_LEN];
        out.copy_from_slice(tag.as_ref());
        out
    }

    /// Constant-time verification against a stored digest.
    pub fn verify(&self, data: &[u8], expected: &[u8; DIGEST_LEN]) -> bool {
        hmac::verify(&self.0, data, expected).is_ok()
    }
}

/// The immutable descriptor fields `layout_checksum` is computed over
/// (§4.A, §4.D): everything persisted once at creation, including both
/// schema hashes and both identity strings.
#[derive(Clone, Copy)]
pub struct LayoutDescriptor<'a> {
    pub physical_page_size: u32,
    pub logical_unit_size: u32,
    pub ring_buffer_capacity: u32,
    pub flex_zone_size: u32,
    pub policy: u8,
    pub consumer_sync_policy: u8,
    pub checksum_policy: u8,
    pub flex_zone_schema_hash: &'a [u8; 32],
    pub slot_schema_hash: &'a [u8; 32],
    pub hub_uid: &'a [u8; IDENTITY_STRING_CAPACITY],
    pub hub_name: &'a [u8; IDENTITY_STRING_CAPACITY],
    pub producer_uid: &'a [u8; IDENTITY_STRING_CAPACITY],
    pub producer_name: &'a [u8; IDENTITY_STRING_CAPACITY],
}

impl LayoutDescriptor<'_> {
    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(256);
        buf.extend_from_slice(&self.physical_page_size.to_le_bytes());
        buf.extend_from_slice(&self.logical_unit_size.to_le_bytes());
        buf.extend_from_slice(&self.ring_buffer_capacity.to_le_bytes());
        buf.extend_from_slice(&self.flex_zone_size.to_le_bytes());
        buf.push(self.policy);
        buf.push(self.consumer_sync_policy);
        buf.push(self.checksum_policy);
        buf.extend_from_slice(self.flex_zone_schema_hash);
        buf.extend_from_slice(self.slot_schema_hash);
        buf.extend_from_slice(self.hub_uid);
        buf.extend_from_slice(self.hub_name);
        buf.extend_from_slice(self.producer_uid);
        buf.extend_from_slice(self.producer_name);
        buf
    }
}

/// Compute `layout_checksum` over the immutable descriptor (§4.A).
pub fn compute_layout_checksum(key: &DigestKey, descriptor: &LayoutDescriptor<'_>) -> [u8; DIGEST_LEN] {
    key.digest(&descriptor.to_bytes())
}

/// Recompute and compare; `layout_checksum` mismatch is fatal and
/// non-repairable (§4.D).
pub fn validate_layout_checksum(
    key: &DigestKey,
    descriptor: &LayoutDescriptor<'_>,
    stored: &[u8; DIGEST_LEN],
) -> bool {
    key.verify(&descriptor.to_bytes(), stored)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_round_trips() {
        let key = DigestKey::derive(0xDEAD_BEEF);
        let data = b"payload bytes";
        let digest = key.digest(data);
        assert!(key.verify(data, &digest));
    }

    #[test]
    fn digest_detects_tampering() {
        let key = DigestKey::derive(42);
        let digest = key.digest(b"original");
        assert!(!key.verify(b"tampered!", &digest));
    }

    #[test]
    fn zero_secret_still_yields_nonzero_key() {
        let key = DigestKey::derive(0);
        let digest = key.digest(b"x");
        assert!(digest.iter().any(|&b| b != 0));
    }

    #[test]
    fn layout_checksum_detects_descriptor_change() {
        let key = DigestKey::derive(1);
        let hash_a = [1u8; 32];
        let hash_b = [2u8; 32];
        let hub = [0u8; IDENTITY_STRING_CAPACITY];
        let descriptor = LayoutDescriptor {
            physical_page_size: 4096,
            logical_unit_size: 4096,
            ring_buffer_capacity: 8,
            flex_zone_size: 0,
            policy: 0,
            consumer_sync_policy: 0,
            checksum_policy: 0,
            flex_zone_schema_hash: &hash_a,
            slot_schema_hash: &hash_b,
            hub_uid: &hub,
            hub_name: &hub,
            producer_uid: &hub,
            producer_name: &hub,
        };
        let checksum = compute_layout_checksum(&key, &descriptor);
        assert!(validate_layout_checksum(&key, &descriptor, &checksum));

        let mut tampered = descriptor;
        tampered.ring_buffer_capacity = 9;
        assert!(!validate_layout_checksum(&key, &tampered, &checksum));
    }
}
