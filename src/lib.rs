// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! DataHub's Slot Protocol Engine: a shared-memory, lock-free, single-writer
//! ring buffer for inter-process data exchange, with a four-state slot
//! machine, three consumer synchronization policies, keyed checksums, a
//! heartbeat-based liveness table, and an explicit diagnostic/recovery
//! surface.
//!
//! This crate implements only the core: segment layout, the slot state
//! machine, the ring coordinator, checksums, heartbeats, the robust mutex
//! primitive, producer/consumer handles, and diagnostics. The control plane
//! (a broker registering channels and handing out rendezvous data), wire
//! transport, schema derivation, and CLI tooling are external collaborators;
//! see [`interfaces`] for the inert payload types at that boundary.
//!
//! # Typical usage
//!
//! ```no_run
//! use datahub_core::checksum::DigestKey;
//! use datahub_core::config::{ChecksumPolicy, ConsumerSyncPolicy, PhysicalPageSize, Policy, SegmentConfigBuilder};
//! use datahub_core::handles::ProducerHandle;
//! use datahub_core::layout::SegmentLayout;
//! use datahub_core::ring::ChannelShared;
//!
//! let config = SegmentConfigBuilder::new()
//!     .policy(Policy::RingBuffer)
//!     .consumer_sync_policy(ConsumerSyncPolicy::SyncReader)
//!     .physical_page_size(PhysicalPageSize::Size4K)
//!     .ring_buffer_capacity(16)
//!     .checksum_policy(ChecksumPolicy::Enforced)
//!     .build()?;
//! let key = DigestKey::derive(config.shared_secret);
//! let layout = SegmentLayout::create("/my_channel", &config, &key)?;
//! let shared = ChannelShared::from_layout(layout)?;
//! let producer = ProducerHandle::attach(shared);
//! producer.with_write_transaction(1000, |tx| {
//!     for slot in tx.slots(1000) {
//!         let mut slot = slot.expect("slot available");
//!         slot.payload_mut()[0] = 1;
//!         slot.publish(1)?;
//!         break; // one value is all this transaction needs to write
//!     }
//!     Ok::<_, datahub_core::error::DataHubError>(())
//! })??;
//! # Ok::<(), datahub_core::error::DataHubError>(())
//! ```

pub mod backoff;
pub mod checksum;
pub mod config;
pub mod diagnostic;
pub mod error;
pub mod futex;
pub mod handles;
pub mod heartbeat;
pub mod identity;
pub mod interfaces;
pub mod layout;
pub mod logging;
pub mod metrics;
pub mod mutex;
pub mod ring;
pub mod segment;
pub mod slot;

pub use checksum::DigestKey;
pub use config::{ChecksumPolicy, ConsumerSyncPolicy, PhysicalPageSize, Policy, SegmentConfig, SegmentConfigBuilder};
pub use error::{DataHubError, Result};
pub use handles::{ConsumerHandle, ProducerHandle};
pub use identity::{attach, AttachCredentials};
pub use layout::{SegmentLayout, LAYOUT_VERSION, MAGIC_NUMBER};
pub use ring::ChannelShared;

/// Crate version, exposed so collaborators can log or assert which engine
/// build produced a given segment without parsing `Cargo.toml`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
