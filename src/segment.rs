// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! POSIX shared memory segment management.
//!
//! Safe wrappers around `shm_open`, `ftruncate`, and `mmap` for creating and
//! mapping the single region backing a channel.
//!
//! # Segment lifecycle
//!
//! 1. The producer creates the segment with [`MappedSegment::create`].
//! 2. Consumers and diagnostic tools attach with [`MappedSegment::open`].
//! 3. The mapping is unmapped automatically on drop.
//! 4. An explicit [`MappedSegment::unlink`] call removes the OS object
//!    (§6.1 "Cleanup"); mapped handles continue until their last unmap.
//!
//! # Naming
//!
//! `shm_name` must start with `/` and contain no other `/`.

use crate::error::{DataHubError, Result};
use std::ffi::CString;
use std::io;
use std::ptr;

/// A mapped POSIX shared memory region.
///
/// Unmaps on drop. Never unlinks on drop: unlinking is an explicit,
/// separate operation (§6.1), since other processes may still have the
/// segment mapped.
pub struct MappedSegment {
    ptr: *mut u8,
    size: usize,
    name: String,
}

// SAFETY: the pointer addresses shared memory guarded entirely by the
// atomics the layout on top of this type defines; no non-atomic field of
// `MappedSegment` itself is shared.
unsafe impl Send for MappedSegment {}
unsafe impl Sync for MappedSegment {}

impl MappedSegment {
    /// Create a new segment, replacing any segment of the same name.
    pub fn create(name: &str, size: usize) -> Result<Self> {
        Self::validate_name(name)?;
        let c_name =
            CString::new(name).map_err(|_| DataHubError::Invalid(format!("nul byte in name: {name}")))?;

        // SAFETY: c_name is a valid NUL-terminated string; shm_unlink is
        // safe to call unconditionally and its result is discarded;
        // O_CREAT|O_RDWR|O_EXCL either creates a fresh segment or fails.
        let fd = unsafe {
            libc::shm_unlink(c_name.as_ptr());
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_RDWR | libc::O_EXCL,
                0o600,
            )
        };
        if fd < 0 {
            return Err(DataHubError::Os(io::Error::last_os_error()));
        }

        // SAFETY: fd is a valid descriptor from the shm_open above; size
        // is caller-provided and bounded by practical memory limits.
        let ret = unsafe { libc::ftruncate(fd, size as libc::off_t) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // SAFETY: fd is still valid and not reused elsewhere in this error path.
            unsafe { libc::close(fd) };
            return Err(DataHubError::Os(err));
        }

        // SAFETY: null addr lets the kernel choose; size/fd come from the
        // successful shm_open+ftruncate above; PROT_READ|PROT_WRITE and
        // MAP_SHARED are valid for a cross-process read-write mapping.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        // SAFETY: fd is valid and the mapping (success or failure) does not
        // require fd to remain open afterward.
        unsafe { libc::close(fd) };

        if ptr == libc::MAP_FAILED {
            return Err(DataHubError::Os(io::Error::last_os_error()));
        }

        // SAFETY: ptr is valid for `size` writable bytes from the mmap
        // above; nothing else references this mapping yet.
        unsafe {
            ptr::write_bytes(ptr as *mut u8, 0, size);
        }

        Ok(Self {
            ptr: ptr as *mut u8,
            size,
            name: name.to_string(),
        })
    }

    /// Attach to an existing segment.
    pub fn open(name: &str, size: usize) -> Result<Self> {
        Self::validate_name(name)?;
        let c_name =
            CString::new(name).map_err(|_| DataHubError::Invalid(format!("nul byte in name: {name}")))?;

        // SAFETY: c_name is valid; O_RDWR opens an existing object only.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            return Err(DataHubError::Os(io::Error::last_os_error()));
        }

        // SAFETY: identical reasoning to create(); size is the caller's
        // expectation of the existing segment's size.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        // SAFETY: fd no longer needed once the mapping holds its own reference.
        unsafe { libc::close(fd) };

        if ptr == libc::MAP_FAILED {
            return Err(DataHubError::Os(io::Error::last_os_error()));
        }

        Ok(Self {
            ptr: ptr as *mut u8,
            size,
            name: name.to_string(),
        })
    }

    fn validate_name(name: &str) -> Result<()> {
        if !name.starts_with('/') {
            return Err(DataHubError::Invalid(format!(
                "segment name must start with '/': {name}"
            )));
        }
        if name.len() > 1 && name[1..].contains('/') {
            return Err(DataHubError::Invalid(format!(
                "segment name cannot contain '/' after the prefix: {name}"
            )));
        }
        if name.len() > 255 {
            return Err(DataHubError::Invalid(format!(
                "segment name too long (max 255): {name}"
            )));
        }
        Ok(())
    }

    /// Remove the OS shared-memory object. Idempotent: a missing object is
    /// not an error (§6.1).
    pub fn unlink(name: &str) -> Result<()> {
        let c_name =
            CString::new(name).map_err(|_| DataHubError::Invalid(format!("nul byte in name: {name}")))?;

        // SAFETY: c_name valid; shm_unlink only touches the shm filesystem
        // namespace, never the mapping itself.
        let ret = unsafe { libc::shm_unlink(c_name.as_ptr()) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::NotFound {
                return Err(DataHubError::Os(err));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn exists(name: &str) -> bool {
        let Ok(c_name) = CString::new(name) else {
            return false;
        };
        // SAFETY: read-only existence probe; fd is closed immediately.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDONLY, 0) };
        if fd >= 0 {
            unsafe { libc::close(fd) };
            true
        } else {
            false
        }
    }

    #[inline]
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for MappedSegment {
    fn drop(&mut self) {
        // SAFETY: self.ptr/self.size come from a successful mmap in
        // create()/open() and Drop runs at most once per value.
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name() -> String {
        use std::time::{SystemTime, UNIX_EPOCH};
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before epoch")
            .as_nanos();
        format!("/datahub_test_{ts}")
    }

    #[test]
    fn validate_name_rules() {
        assert!(MappedSegment::validate_name("/foo").is_ok());
        assert!(MappedSegment::validate_name("foo").is_err());
        assert!(MappedSegment::validate_name("/foo/bar").is_err());
    }

    #[test]
    fn create_and_open_roundtrip() {
        let name = unique_name();
        let size = 4096;

        let seg1 = MappedSegment::create(&name, size).expect("create");
        assert_eq!(seg1.size(), size);

        // SAFETY: seg1 just created with size >= 2; offsets 0/1 in bounds.
        unsafe {
            *seg1.as_ptr() = 0x42;
            *seg1.as_ptr().add(1) = 0x43;
        }

        let seg2 = MappedSegment::open(&name, size).expect("open");
        // SAFETY: seg2 maps the same region seg1 wrote into above.
        unsafe {
            assert_eq!(*seg2.as_ptr(), 0x42);
            assert_eq!(*seg2.as_ptr().add(1), 0x43);
        }

        drop(seg1);
        drop(seg2);
        MappedSegment::unlink(&name).ok();
    }

    #[test]
    fn open_nonexistent_fails() {
        let result = MappedSegment::open("/datahub_test_nonexistent_12345", 4096);
        assert!(result.is_err());
    }

    #[test]
    fn exists_tracks_lifecycle() {
        let name = unique_name();
        assert!(!MappedSegment::exists(&name));
        let _seg = MappedSegment::create(&name, 4096).expect("create");
        assert!(MappedSegment::exists(&name));
        MappedSegment::unlink(&name).ok();
    }

    #[test]
    fn unlink_is_idempotent() {
        let name = unique_name();
        let _seg = MappedSegment::create(&name, 4096).expect("create");
        assert!(MappedSegment::unlink(&name).is_ok());
        assert!(MappedSegment::unlink(&name).is_ok());
    }
}
