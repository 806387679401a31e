// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types for the slot protocol engine.
//!
//! Hand-rolled rather than derive-based: every variant is a distinct
//! outcome a caller is expected to branch on, and the set is small and
//! stable enough that a derive macro buys nothing.

use std::fmt;
use std::io;

/// Which blocking operation timed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// Could not acquire `write_lock` before the deadline.
    WriterLock,
    /// Entered `DRAINING` but readers never reached zero before the deadline.
    WriterReaderDrain,
    /// No free slot: the ring is full against the relevant read position.
    RingFull,
    /// No new commit available for a consumer to acquire.
    ReaderEmpty,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TimeoutKind::WriterLock => "writer lock",
            TimeoutKind::WriterReaderDrain => "writer/reader drain",
            TimeoutKind::RingFull => "ring full",
            TimeoutKind::ReaderEmpty => "reader empty",
        };
        f.write_str(s)
    }
}

/// Errors produced by the slot protocol engine.
///
/// Recoverable kinds (`Timeout`, `Invalid`, `ChecksumFailure`) are meant to
/// be handled locally by the caller. Fatal kinds (`SchemaMismatch`,
/// `SecretMismatch`, `LayoutCorrupt`, `MagicCorrupt`) mean the segment must
/// not be mapped in; they never leave partial state behind.
#[derive(Debug)]
pub enum DataHubError {
    /// A blocking operation exceeded its caller-supplied deadline.
    Timeout(TimeoutKind),
    /// Malformed argument: zero-length write, oversized write, bad offset,
    /// a default-constructed or moved-from handle used after release.
    Invalid(String),
    /// The consumer's schema hash(es) do not match the producer's.
    SchemaMismatch,
    /// `shared_secret` mismatch on attach.
    SecretMismatch,
    /// `layout_checksum` does not match the recomputed value. Not
    /// repairable; the segment must be destroyed.
    LayoutCorrupt,
    /// `magic_number` is not the valid constant.
    MagicCorrupt,
    /// Payload or flex-zone digest did not verify. The slot is still
    /// released cleanly; only trust in the bytes is lost.
    ChecksumFailure,
    /// Recovery refused: a live process still owns the resource and
    /// `force` was not set.
    Unsafe,
    /// Underlying OS failure (`shm_open`, `mmap`, `ftruncate`, futex, ...).
    Os(io::Error),
}

impl fmt::Display for DataHubError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataHubError::Timeout(kind) => write!(f, "timeout waiting on {kind}"),
            DataHubError::Invalid(msg) => write!(f, "invalid argument: {msg}"),
            DataHubError::SchemaMismatch => write!(f, "schema hash mismatch"),
            DataHubError::SecretMismatch => write!(f, "shared secret mismatch"),
            DataHubError::LayoutCorrupt => write!(f, "layout checksum mismatch"),
            DataHubError::MagicCorrupt => write!(f, "magic number invalid"),
            DataHubError::ChecksumFailure => write!(f, "payload checksum verification failed"),
            DataHubError::Unsafe => write!(f, "recovery refused: resource owner is alive"),
            DataHubError::Os(e) => write!(f, "os error: {e}"),
        }
    }
}

impl std::error::Error for DataHubError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DataHubError::Os(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for DataHubError {
    fn from(e: io::Error) -> Self {
        DataHubError::Os(e)
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, DataHubError>;

/// Internal-only kind surfaced by the recovery module to distinguish "there
/// was nothing to recover" from "recovery actually ran". Never returned to
/// normal producer/consumer callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ZombieDetected {
    Writer,
    Readers,
}
