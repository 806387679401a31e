// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Identity & Attach Gate (§4.I): the ordered sequence of checks a consumer
//! (or a second producer handle) must pass before it is allowed to touch a
//! mapped segment's slot array or payload slab.
//!
//! Order matters (§4.I "checks run in this order, short-circuiting on the
//! first failure"): magic before anything else, since every other field is
//! meaningless if the header itself is not trustworthy; the layout checksum
//! next, since it is the integrity gate over all other immutable fields;
//! only once structure is trusted do we check the caller-supplied secret and
//! schema hashes, which are about authorization and compatibility rather
//! than integrity.

use crate::checksum::DigestKey;
use crate::error::{DataHubError, Result};
use crate::layout::SegmentLayout;

/// Everything a caller must present to attach: the control-plane rendezvous
/// result from `discover_producer` (§6.2), never the full layout descriptor.
#[derive(Debug, Clone)]
pub struct AttachCredentials {
    pub shared_secret: u64,
    pub flex_zone_schema_hash: [u8; 32],
    pub slot_schema_hash: [u8; 32],
}

/// Run the full attach gate against an already-mapped segment. On success,
/// returns the [`DigestKey`] derived from the now-trusted shared secret, so
/// the caller does not have to re-derive it.
pub fn attach(layout: &SegmentLayout, credentials: &AttachCredentials) -> Result<DigestKey> {
    let header = layout.header();

    if !header.validate_magic() {
        return Err(DataHubError::MagicCorrupt);
    }

    let key = DigestKey::derive(header.shared_secret());
    if !header.validate_layout_checksum(&key) {
        return Err(DataHubError::LayoutCorrupt);
    }

    if header.shared_secret() != credentials.shared_secret {
        return Err(DataHubError::SecretMismatch);
    }

    if header.flex_zone_schema_hash() != &credentials.flex_zone_schema_hash
        || header.slot_schema_hash() != &credentials.slot_schema_hash
    {
        return Err(DataHubError::SchemaMismatch);
    }

    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChecksumPolicy, ConsumerSyncPolicy, PhysicalPageSize, Policy, SegmentConfigBuilder};

    fn unique_name(tag: &str) -> String {
        use std::time::{SystemTime, UNIX_EPOCH};
        let ts = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
        format!("/datahub_identity_test_{tag}_{ts}")
    }

    fn make_layout(name: &str, secret: u64, flex_hash: [u8; 32], slot_hash: [u8; 32]) -> SegmentLayout {
        let config = SegmentConfigBuilder::new()
            .policy(Policy::RingBuffer)
            .consumer_sync_policy(ConsumerSyncPolicy::SyncReader)
            .physical_page_size(PhysicalPageSize::Size4K)
            .ring_buffer_capacity(2)
            .checksum_policy(ChecksumPolicy::None)
            .shared_secret(secret)
            .flex_zone_schema_hash(flex_hash)
            .slot_schema_hash(slot_hash)
            .build()
            .unwrap();
        let key = DigestKey::derive(secret);
        SegmentLayout::create(name, &config, &key).unwrap()
    }

    #[test]
    fn matching_credentials_attach_successfully() {
        let name = unique_name("ok");
        let flex = [1u8; 32];
        let slot = [2u8; 32];
        let layout = make_layout(&name, 999, flex, slot);

        let result = attach(
            &layout,
            &AttachCredentials {
                shared_secret: 999,
                flex_zone_schema_hash: flex,
                slot_schema_hash: slot,
            },
        );
        assert!(result.is_ok());
        SegmentLayout::unlink(&name).ok();
    }

    #[test]
    fn secret_mismatch_is_rejected() {
        let name = unique_name("secret");
        let flex = [1u8; 32];
        let slot = [2u8; 32];
        let layout = make_layout(&name, 999, flex, slot);

        let result = attach(
            &layout,
            &AttachCredentials {
                shared_secret: 111,
                flex_zone_schema_hash: flex,
                slot_schema_hash: slot,
            },
        );
        assert!(matches!(result, Err(DataHubError::SecretMismatch)));
        SegmentLayout::unlink(&name).ok();
    }

    #[test]
    fn schema_mismatch_is_rejected() {
        let name = unique_name("schema");
        let flex = [1u8; 32];
        let slot = [2u8; 32];
        let layout = make_layout(&name, 999, flex, slot);

        let result = attach(
            &layout,
            &AttachCredentials {
                shared_secret: 999,
                flex_zone_schema_hash: flex,
                slot_schema_hash: [9u8; 32],
            },
        );
        assert!(matches!(result, Err(DataHubError::SchemaMismatch)));
        SegmentLayout::unlink(&name).ok();
    }
}
