//! POSIX shared-memory segments.

use crate::Error;

use std::{ffi::CString, io, ptr};

/// A mapped `shm_open` segment. Only the creator unlinks the name on drop;
/// an opener merely unmaps.
pub struct Segment {
    name: CString,
    ptr: *mut u8,
    size: usize,
    owner: bool,
}

unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    /// Create and map a fresh segment of `size` bytes. Fails if the name
    /// already exists; a stale segment from a crashed peer must be
    /// unlinked by the operator, not silently reused.
    pub fn create(name: &str, size: usize) -> Result<Self, Error> {
        let cname = CString::new(name).map_err(|_| Error::BadSegment)?;

        let fd = unsafe {
            libc::shm_open(
                cname.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o600,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }

        if unsafe { libc::ftruncate(fd, size as libc::off_t) } != 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(fd);
                libc::shm_unlink(cname.as_ptr());
            }
            return Err(err.into());
        }

        let ptr = Self::map(fd, size);
        unsafe { libc::close(fd) };

        match ptr {
            Ok(ptr) => Ok(Self {
                name: cname,
                ptr,
                size,
                owner: true,
            }),
            Err(err) => {
                unsafe { libc::shm_unlink(cname.as_ptr()) };
                Err(err.into())
            }
        }
    }

    /// Map an existing segment, taking its size from the file.
    pub fn open(name: &str) -> Result<Self, Error> {
        let cname = CString::new(name).map_err(|_| Error::BadSegment)?;

        let fd = unsafe { libc::shm_open(cname.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }

        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd, &mut stat) } != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err.into());
        }

        let size = stat.st_size as usize;
        let ptr = Self::map(fd, size);
        unsafe { libc::close(fd) };

        Ok(Self {
            name: cname,
            ptr: ptr?,
            size,
            owner: false,
        })
    }

    fn map(fd: libc::c_int, size: usize) -> io::Result<*mut u8> {
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

        if ptr == libc::MAP_FAILED {
            Err(io::Error::last_os_error())
        } else {
            Ok(ptr as *mut u8)
        }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn name(&self) -> &str {
        self.name.to_str().unwrap_or_default()
    }

    pub fn is_owner(&self) -> bool {
        self.owner
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.size);
            if self.owner {
                libc::shm_unlink(self.name.as_ptr());
            }
        }
    }
}
