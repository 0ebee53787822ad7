//! Process-shared pthread primitives.
//!
//! These live inside a shared-memory segment header and are initialised
//! exactly once, by the segment creator. The condvar runs on the monotonic
//! clock so a peer restart cannot warp its deadlines.

use std::{cell::UnsafeCell, io, mem, time::Duration};

#[repr(C)]
pub struct SharedMutex {
    inner: UnsafeCell<libc::pthread_mutex_t>,
}

unsafe impl Send for SharedMutex {}
unsafe impl Sync for SharedMutex {}

impl SharedMutex {
    /// Initialise the mutex in place.
    ///
    /// # Safety
    ///
    /// `this` must point to uninitialised (or zeroed) memory inside a
    /// mapping shared by all participating processes, and must be called
    /// exactly once per mapping lifetime.
    pub unsafe fn init(this: *mut Self) -> io::Result<()> {
        unsafe {
            let mut attr: libc::pthread_mutexattr_t = mem::zeroed();
            check(libc::pthread_mutexattr_init(&mut attr))?;
            check(libc::pthread_mutexattr_setpshared(
                &mut attr,
                libc::PTHREAD_PROCESS_SHARED,
            ))?;

            let rc = libc::pthread_mutex_init((*this).inner.get(), &attr);
            libc::pthread_mutexattr_destroy(&mut attr);
            check(rc)
        }
    }

    pub fn lock(&self) {
        unsafe {
            libc::pthread_mutex_lock(self.inner.get());
        }
    }

    pub fn unlock(&self) {
        unsafe {
            libc::pthread_mutex_unlock(self.inner.get());
        }
    }

    /// Run `f` with the mutex held.
    pub fn with<R>(&self, f: impl FnOnce() -> R) -> R {
        self.lock();
        let result = f();
        self.unlock();

        result
    }
}

#[repr(C)]
pub struct SharedCondvar {
    inner: UnsafeCell<libc::pthread_cond_t>,
}

unsafe impl Send for SharedCondvar {}
unsafe impl Sync for SharedCondvar {}

impl SharedCondvar {
    /// Initialise the condvar in place; see [`SharedMutex::init`] for the
    /// safety contract.
    pub unsafe fn init(this: *mut Self) -> io::Result<()> {
        unsafe {
            let mut attr: libc::pthread_condattr_t = mem::zeroed();
            check(libc::pthread_condattr_init(&mut attr))?;
            check(libc::pthread_condattr_setpshared(
                &mut attr,
                libc::PTHREAD_PROCESS_SHARED,
            ))?;
            check(libc::pthread_condattr_setclock(
                &mut attr,
                libc::CLOCK_MONOTONIC,
            ))?;

            let rc = libc::pthread_cond_init((*this).inner.get(), &attr);
            libc::pthread_condattr_destroy(&mut attr);
            check(rc)
        }
    }

    pub fn signal(&self) {
        unsafe {
            libc::pthread_cond_signal(self.inner.get());
        }
    }

    /// Wait on `mutex` (which must be held) for at most `timeout`.
    /// Returns false on timeout. Spurious wakeups return true; callers
    /// re-check their predicate in a loop.
    pub fn wait_timeout(&self, mutex: &SharedMutex, timeout: Duration) -> bool {
        let mut now: libc::timespec = unsafe { mem::zeroed() };
        unsafe {
            libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut now);
        }

        let nanos = now.tv_nsec as u64 + timeout.subsec_nanos() as u64;
        let deadline = libc::timespec {
            tv_sec: now.tv_sec + timeout.as_secs() as libc::time_t + (nanos / 1_000_000_000) as libc::time_t,
            tv_nsec: (nanos % 1_000_000_000) as libc::c_long,
        };

        let rc = unsafe {
            libc::pthread_cond_timedwait(self.inner.get(), mutex.inner.get(), &deadline)
        };

        rc != libc::ETIMEDOUT
    }
}

fn check(rc: libc::c_int) -> io::Result<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(rc))
    }
}
