// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Robust Mutex Primitive (§4.F): a process-shared mutex with owner-death
//! detection, used only to serialize segment creation/attach and recovery
//! actions — never on the hot read/write path, which is lock-free.
//!
//! On Linux this is a real `pthread_mutex_t` configured
//! `PTHREAD_PROCESS_SHARED` + `PTHREAD_MUTEX_ROBUST`, the same FFI surface
//! the teacher's `futex.rs` uses for the `SYS_futex` cross-process calls:
//! raw `libc` bindings, explicit `#[cfg(target_os = "linux")]`, and an
//! emulation fallback elsewhere. Where the host lacks robust mutexes, the
//! fallback is PID-liveness plus spin/yield backoff, exactly as §4.F allows.

use crate::backoff::{Backoff, Deadline};
use crate::error::{DataHubError, Result};
use std::cell::UnsafeCell;

/// What the caller should do after a successful acquire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    /// Acquired cleanly; no recovery needed.
    Acquired,
    /// The previous owner died while holding the lock. The caller must
    /// restore invariants before trusting the protected state.
    Recovered,
}

#[cfg(target_os = "linux")]
mod imp {
    use super::*;
    use std::mem::MaybeUninit;
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    /// `#[repr(C)]` so it can be placed directly inside shared memory.
    #[repr(C)]
    pub struct RobustMutex {
        raw: UnsafeCell<libc::pthread_mutex_t>,
    }

    // SAFETY: a `PTHREAD_PROCESS_SHARED` mutex is designed to be shared
    // across threads and processes; all access goes through the methods
    // below, which call into pthread's own synchronization.
    unsafe impl Send for RobustMutex {}
    unsafe impl Sync for RobustMutex {}

    impl RobustMutex {
        /// Initialize a mutex in place at `ptr`, which must point at
        /// `size_of::<RobustMutex>()` zero-initialized, page-resident bytes
        /// inside a shared mapping (§4.A "zero-fill, populate, publish").
        ///
        /// # Safety
        ///
        /// `ptr` must be valid for writes of `size_of::<RobustMutex>()`
        /// bytes and must not already hold an initialized mutex.
        pub unsafe fn init_in_place(ptr: *mut Self) -> Result<()> {
            let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
            if libc::pthread_mutexattr_init(attr.as_mut_ptr()) != 0 {
                return Err(DataHubError::Os(std::io::Error::last_os_error()));
            }
            let mut attr = attr.assume_init();
            libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
            libc::pthread_mutexattr_setrobust(&mut attr, libc::PTHREAD_MUTEX_ROBUST);

            let raw_ptr = (*ptr).raw.get();
            let rc = libc::pthread_mutex_init(raw_ptr, &attr);
            libc::pthread_mutexattr_destroy(&mut attr);
            if rc != 0 {
                return Err(DataHubError::Os(std::io::Error::from_raw_os_error(rc)));
            }
            Ok(())
        }

        /// `try_lock_for(timeout_ms)` (§4.F). `timeout_ms == 0` waits
        /// indefinitely.
        pub fn try_lock_for(&self, timeout_ms: u64) -> Result<LockOutcome> {
            let deadline = Deadline::from_timeout_ms(timeout_ms);
            let rc = match deadline {
                Deadline::Forever => unsafe { libc::pthread_mutex_lock(self.raw.get()) },
                Deadline::At(at) => {
                    let remaining = at.saturating_duration_since(std::time::Instant::now());
                    let abs = system_deadline(remaining);
                    unsafe { libc::pthread_mutex_timedlock(self.raw.get(), &abs) }
                }
            };

            match rc {
                0 => Ok(LockOutcome::Acquired),
                libc::EOWNERDEAD => {
                    // SAFETY: we hold the lock (pthread grants it on
                    // EOWNERDEAD); marking it consistent is required before
                    // any other thread can lock it again.
                    unsafe {
                        libc::pthread_mutex_consistent(self.raw.get());
                    }
                    Ok(LockOutcome::Recovered)
                }
                libc::ETIMEDOUT => Err(DataHubError::Timeout(crate::error::TimeoutKind::WriterLock)),
                other => Err(DataHubError::Os(std::io::Error::from_raw_os_error(other))),
            }
        }

        pub fn unlock(&self) {
            // SAFETY: caller must only unlock a mutex it currently holds;
            // enforced by `RobustMutexGuard`'s ownership.
            unsafe {
                libc::pthread_mutex_unlock(self.raw.get());
            }
        }
    }

    fn system_deadline(remaining: Duration) -> libc::timespec {
        let target = SystemTime::now() + remaining;
        let since_epoch = target.duration_since(UNIX_EPOCH).unwrap_or_default();
        libc::timespec {
            tv_sec: since_epoch.as_secs() as libc::time_t,
            tv_nsec: since_epoch.subsec_nanos() as libc::c_long,
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Emulation for hosts without robust pthread mutexes: a PID-tagged
    /// atomic holder plus liveness checks, exactly as §4.F permits.
    #[repr(C)]
    pub struct RobustMutex {
        holder_pid: AtomicU64,
    }

    unsafe impl Send for RobustMutex {}
    unsafe impl Sync for RobustMutex {}

    impl RobustMutex {
        /// # Safety
        ///
        /// `ptr` must be valid for writes of `size_of::<RobustMutex>()`
        /// bytes and must not already hold an initialized mutex.
        pub unsafe fn init_in_place(ptr: *mut Self) -> Result<()> {
            (*ptr).holder_pid.store(0, Ordering::Release);
            Ok(())
        }

        pub fn try_lock_for(&self, timeout_ms: u64) -> Result<LockOutcome> {
            let deadline = Deadline::from_timeout_ms(timeout_ms);
            let my_pid = std::process::id() as u64;
            let mut backoff = Backoff::new();

            loop {
                if self
                    .holder_pid
                    .compare_exchange(0, my_pid, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return Ok(LockOutcome::Acquired);
                }

                let holder = self.holder_pid.load(Ordering::Acquire);
                if holder != 0 && !crate::diagnostic::is_process_alive(holder)
                    && self
                        .holder_pid
                        .compare_exchange(holder, my_pid, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                {
                    return Ok(LockOutcome::Recovered);
                }

                if deadline.expired() {
                    return Err(DataHubError::Timeout(crate::error::TimeoutKind::WriterLock));
                }
                backoff.snooze();
            }
        }

        pub fn unlock(&self) {
            self.holder_pid.store(0, Ordering::Release);
        }
    }
}

pub use imp::RobustMutex;

/// RAII guard released on drop, mirroring the slot handles' abort/release
/// pattern (§4.G) rather than pthread's bare lock/unlock pair.
pub struct RobustMutexGuard<'a> {
    mutex: &'a RobustMutex,
    pub outcome: LockOutcome,
}

impl RobustMutex {
    pub fn lock_guarded(&self, timeout_ms: u64) -> Result<RobustMutexGuard<'_>> {
        let outcome = self.try_lock_for(timeout_ms)?;
        Ok(RobustMutexGuard { mutex: self, outcome })
    }
}

impl Drop for RobustMutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::MaybeUninit;

    fn fresh_mutex() -> Box<MaybeUninit<RobustMutex>> {
        let mut storage: Box<MaybeUninit<RobustMutex>> = Box::new(MaybeUninit::zeroed());
        // SAFETY: freshly allocated, zeroed, exclusively owned storage.
        unsafe {
            RobustMutex::init_in_place(storage.as_mut_ptr()).expect("init");
        }
        storage
    }

    #[test]
    fn lock_and_unlock_round_trip() {
        let storage = fresh_mutex();
        // SAFETY: initialized above.
        let mutex = unsafe { storage.assume_init_ref() };
        let guard = mutex.lock_guarded(1000).expect("lock");
        assert_eq!(guard.outcome, LockOutcome::Acquired);
        drop(guard);

        let guard2 = mutex.lock_guarded(1000).expect("relock");
        assert_eq!(guard2.outcome, LockOutcome::Acquired);
    }

    #[test]
    fn second_exclusive_attempt_times_out() {
        let storage = fresh_mutex();
        // SAFETY: initialized above.
        let mutex = unsafe { storage.assume_init_ref() };
        let _guard = mutex.lock_guarded(1000).expect("lock");

        let result = mutex.try_lock_for(50);
        assert!(matches!(result, Err(DataHubError::Timeout(_))));
    }
}
