// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Diagnostic & Recovery (§4.H): liveness checks and the explicit,
//! operator-invoked recovery actions that clear zombie state left behind by
//! a crashed producer or consumer.
//!
//! Grounded on the teacher's stale-segment detection in
//! `transport/shm/segment.rs` (`is_segment_stale`, `cleanup_stale_segments`),
//! generalized from "whole segment is abandoned" to "this one writer/reader
//! slot is abandoned" since DataHub's unit of recovery is a slot, not a
//! segment.

use crate::checksum::DigestKey;
use crate::error::{DataHubError, Result};
use crate::heartbeat::DEFAULT_LIVENESS_WINDOW;
use crate::layout::SegmentLayout;
use crate::slot::SlotState;
use std::time::Duration;

/// `kill(pid, 0)`: the standard "is this PID still schedulable" probe, the
/// same check the teacher's segment cleanup uses before unlinking a segment
/// whose owning PID is gone.
#[cfg(target_os = "linux")]
pub fn is_process_alive(pid: u64) -> bool {
    if pid == 0 {
        return false;
    }
    // SAFETY: `kill` with signal 0 sends no signal; it only reports whether
    // the PID exists and is visible to us.
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    rc == 0 || (rc == -1 && std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH))
}

#[cfg(not(target_os = "linux"))]
pub fn is_process_alive(pid: u64) -> bool {
    pid != 0
}

/// Outcome of [`DiagnosticHandle::validate_integrity`] (§4.H). Layout and
/// magic corruption are fatal and non-repairable; a bad payload checksum on
/// the most recently committed slot is the one class `repair=true` can fix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityOutcome {
    Ok,
    RepairedChecksumSlot { index: usize },
    Failed { reason: &'static str },
}

/// Operator-facing recovery surface over an attached segment (§4.H). Every
/// method here is explicit and audited via `recovery_actions_count`; nothing
/// in the hot read/write path calls into this module on its own.
pub struct DiagnosticHandle<'a> {
    layout: &'a SegmentLayout,
    liveness_window: Duration,
}

impl<'a> DiagnosticHandle<'a> {
    pub fn new(layout: &'a SegmentLayout) -> Self {
        Self {
            layout,
            liveness_window: DEFAULT_LIVENESS_WINDOW,
        }
    }

    pub fn with_liveness_window(mut self, window: Duration) -> Self {
        self.liveness_window = window;
        self
    }

    /// Producer liveness: PID alive and heartbeat fresh.
    pub fn producer_is_alive(&self) -> bool {
        let header = self.layout.header();
        let pid = header.producer_pid();
        pid != 0
            && is_process_alive(pid)
            && crate::heartbeat::now_ns().saturating_sub(header.producer_last_heartbeat_ns())
                < self.liveness_window.as_nanos() as u64
    }

    /// §4.H: a slot whose `write_lock` holder is dead is a "stuck writer".
    /// Clears `write_lock` and resets state to `FREE` — or, if the slot's
    /// stored payload checksum still verifies against its current bytes (a
    /// commit made by a now-dead writer that was in the middle of a *later*,
    /// overlapping write), restores it to `COMMITTED` instead, the same
    /// checksum check [`Self::validate_integrity`] uses.
    pub fn release_zombie_writer(&self, index: usize, force: bool, key: &DigestKey) -> Result<bool> {
        let slot = self.layout.slot(index);
        let holder = slot.write_lock_holder();
        if holder == 0 {
            return Ok(false);
        }
        if is_process_alive(holder) && !force {
            return Err(DataHubError::Unsafe);
        }
        let full_payload = self.layout.payload(index);
        let len = (slot.committed_length() as usize).min(full_payload.len());
        if key.verify(&full_payload[..len], &slot.payload_checksum()) {
            slot.restore_to_committed();
        } else {
            slot.force_reset();
        }
        self.layout.header().inc_recovery_actions_count();
        Ok(true)
    }

    /// §4.H: clears a slot's phantom `reader_count`, left behind by a
    /// consumer that died mid-read. Safe whenever the producer that would
    /// otherwise rely on that count (via the draining handshake) is itself
    /// absent or dead, or when `force` is set.
    pub fn release_zombie_readers(&self, index: usize, force: bool) -> Result<bool> {
        let slot = self.layout.slot(index);
        if slot.reader_count() == 0 {
            return Ok(false);
        }
        let holder = slot.write_lock_holder();
        let producer_inert = holder == 0 || !is_process_alive(holder);
        if !producer_inert && !force {
            return Err(DataHubError::Unsafe);
        }
        if slot.state() == SlotState::Draining {
            slot.reverse_draining_to_committed();
        }
        slot.force_reset();
        self.layout.header().inc_recovery_actions_count();
        Ok(true)
    }

    /// §4.H `force_reset_slot(slot, force)`: drives the slot to `FREE`,
    /// preserving payload bytes. Refuses when `write_lock` is held by a
    /// live process unless `force` is set.
    pub fn force_reset_slot(&self, index: usize, force: bool) -> Result<()> {
        let slot = self.layout.slot(index);
        let holder = slot.write_lock_holder();
        if holder != 0 && is_process_alive(holder) && !force {
            return Err(DataHubError::Unsafe);
        }
        slot.force_reset();
        self.layout.header().inc_recovery_actions_count();
        Ok(())
    }

    /// Supplemental sweep beyond §4.H's literal API: scans every slot for a
    /// dead write-lock holder or an orphaned reader count, reporting (and
    /// optionally repairing) what [`Self::validate_integrity`] alone would
    /// not surface, since that method only inspects the most recent commit.
    pub fn scan_for_zombie_slots(&self, key: &DigestKey, repair: bool) -> (Vec<usize>, Vec<usize>) {
        let mut stuck_writers = Vec::new();
        let mut orphaned_readers = Vec::new();
        for index in 0..self.layout.capacity() {
            let slot = self.layout.slot(index);
            let holder = slot.write_lock_holder();
            if holder != 0 && !is_process_alive(holder) {
                stuck_writers.push(index);
                if repair {
                    let _ = self.release_zombie_writer(index, true, key);
                }
            }
            if slot.reader_count() > 0 {
                let holder = slot.write_lock_holder();
                if holder == 0 || !is_process_alive(holder) {
                    orphaned_readers.push(index);
                    if repair {
                        let _ = self.release_zombie_readers(index, true);
                    }
                }
            }
        }
        (stuck_writers, orphaned_readers)
    }

    /// §4.H `cleanup_dead_consumers`: scan the heartbeat table and zero
    /// every entry whose PID is no longer alive. Returns the count reclaimed.
    pub fn cleanup_dead_consumers(&self) -> usize {
        let reclaimed = self
            .layout
            .header()
            .heartbeat_table()
            .cleanup_dead(is_process_alive);
        if reclaimed > 0 {
            for _ in 0..reclaimed {
                self.layout.header().dec_active_consumer_count();
            }
            self.layout.header().inc_recovery_actions_count();
        }
        reclaimed
    }

    /// §4.H `validate_integrity(repair)`: checks `magic_number`, then
    /// `layout_checksum`, then — for `Enforced` segments that have
    /// committed at least once — the payload checksum of slot index
    /// `(commit_index - 1) mod capacity`. Magic and layout-checksum failures
    /// are non-repairable and always return `Failed`; a bad payload
    /// checksum is repaired by wholly reinitializing that one slot when
    /// `repair` is set.
    pub fn validate_integrity(&self, key: &DigestKey, repair: bool) -> IntegrityOutcome {
        let header = self.layout.header();
        if !header.validate_magic() {
            return IntegrityOutcome::Failed { reason: "magic_number invalid" };
        }
        if !header.validate_layout_checksum(key) {
            return IntegrityOutcome::Failed { reason: "layout_checksum mismatch" };
        }

        let checksum_policy = match header.checksum_policy() {
            Ok(policy) => policy,
            Err(_) => return IntegrityOutcome::Failed { reason: "checksum_policy code invalid" },
        };
        if checksum_policy != crate::config::ChecksumPolicy::Enforced {
            return IntegrityOutcome::Ok;
        }

        let commit_index = header.commit_index();
        if commit_index == 0 {
            return IntegrityOutcome::Ok;
        }
        let index = ((commit_index - 1) % self.layout.capacity() as u64) as usize;
        let slot = self.layout.slot(index);
        if slot.state() != SlotState::Committed {
            return IntegrityOutcome::Ok;
        }

        let len = slot.committed_length() as usize;
        let payload = &self.layout.payload(index)[..len];
        if key.verify(payload, &slot.payload_checksum()) {
            return IntegrityOutcome::Ok;
        }

        if !repair {
            return IntegrityOutcome::Failed { reason: "payload checksum mismatch" };
        }
        slot.force_reset();
        self.layout.header().inc_recovery_actions_count();
        IntegrityOutcome::RepairedChecksumSlot { index }
    }
}
