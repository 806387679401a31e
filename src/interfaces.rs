// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Control-plane boundary payloads (§6.2).
//!
//! The core only ever consumes the result of these calls; it never performs
//! them. A collaborator crate implementing `register_producer`,
//! `discover_producer`, and friends against a real broker can depend on this
//! module purely for the field layout, the same way callers of the teacher's
//! DDS participant discovery consume its `ParticipantBuiltinTopicData`
//! without the core knowing anything about the RTPS wire format that carries
//! it.

use crate::config::IDENTITY_STRING_CAPACITY;

/// Request body for `register_producer(channel, ...)`.
#[derive(Debug, Clone)]
pub struct RegisterProducerRequest {
    pub channel: String,
    pub shm_name: String,
    pub pid: u64,
    pub flex_zone_schema_hash: [u8; 32],
    pub slot_schema_hash: [u8; 32],
    pub schema_version: u32,
    pub identity: String,
}

/// Request body for `register_consumer(channel, ...)`.
#[derive(Debug, Clone)]
pub struct RegisterConsumerRequest {
    pub channel: String,
    pub pid: u64,
    pub hostname: String,
    pub identity: String,
}

/// Result of `discover_producer(channel, timeout)`: everything a consumer
/// needs to call [`crate::identity::attach`] and [`crate::layout::SegmentLayout::open`].
#[derive(Debug, Clone)]
pub struct DiscoverProducerResult {
    pub shm_name: String,
    pub shared_secret: u64,
    pub flex_zone_schema_hash: [u8; 32],
    pub slot_schema_hash: [u8; 32],
    pub consumer_count: u32,
}

impl DiscoverProducerResult {
    /// Narrows this result down to the [`crate::identity::AttachCredentials`]
    /// the attach gate actually checks.
    pub fn to_attach_credentials(&self) -> crate::identity::AttachCredentials {
        crate::identity::AttachCredentials {
            shared_secret: self.shared_secret,
            flex_zone_schema_hash: self.flex_zone_schema_hash,
            slot_schema_hash: self.slot_schema_hash,
        }
    }
}

/// Control-plane error codes (§6.2), distinct from [`crate::error::DataHubError`]:
/// these describe broker-side outcomes the core never raises itself, only
/// receives and maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlPlaneError {
    ChannelNotFound,
    SchemaMismatch,
    NotRegistered,
    AlreadyRegistered,
    NotReady,
    NotFound,
}

impl std::fmt::Display for ControlPlaneError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ControlPlaneError::ChannelNotFound => "CHANNEL_NOT_FOUND",
            ControlPlaneError::SchemaMismatch => "SCHEMA_MISMATCH",
            ControlPlaneError::NotRegistered => "NOT_REGISTERED",
            ControlPlaneError::AlreadyRegistered => "ALREADY_REGISTERED",
            ControlPlaneError::NotReady => "NOT_READY",
            ControlPlaneError::NotFound => "NOT_FOUND",
        };
        f.write_str(s)
    }
}

impl std::error::Error for ControlPlaneError {}

/// Bound-check an identity string against the header's fixed-capacity field,
/// the same rule [`crate::config::SegmentConfigBuilder::build`] enforces for
/// `hub_uid`/`hub_name`/`producer_uid`/`producer_name`.
pub fn identity_fits(identity: &str) -> bool {
    identity.len() < IDENTITY_STRING_CAPACITY
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discover_result_narrows_to_attach_credentials() {
        let result = DiscoverProducerResult {
            shm_name: "/datahub_example".into(),
            shared_secret: 7,
            flex_zone_schema_hash: [1u8; 32],
            slot_schema_hash: [2u8; 32],
            consumer_count: 3,
        };
        let credentials = result.to_attach_credentials();
        assert_eq!(credentials.shared_secret, 7);
        assert_eq!(credentials.flex_zone_schema_hash, [1u8; 32]);
    }

    #[test]
    fn identity_length_bound_matches_header_capacity() {
        assert!(identity_fits(&"x".repeat(IDENTITY_STRING_CAPACITY - 1)));
        assert!(!identity_fits(&"x".repeat(IDENTITY_STRING_CAPACITY)));
    }

    #[test]
    fn control_plane_error_display_matches_spec_codes() {
        assert_eq!(ControlPlaneError::ChannelNotFound.to_string(), "CHANNEL_NOT_FOUND");
        assert_eq!(ControlPlaneError::SchemaMismatch.to_string(), "SCHEMA_MISMATCH");
    }
}
