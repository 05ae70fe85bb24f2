//! POSIX shared memory segments keyed by integer

use crate::error::{IpcError, Resource, Result};
use crate::flags::IpcFlags;
use rustix::fd::OwnedFd;
use rustix::fs::ftruncate;
use rustix::io::Errno;
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use rustix::shm::{shm_open, shm_unlink, Mode, ShmOFlags};
use std::ffi::CString;
use std::ptr::NonNull;
use tracing::{debug, trace, warn};

const SEMSHM_PREFIX: &str = "/semshm_";

/// Handle to a shared memory segment
#[derive(Debug)]
pub struct SharedMemory {
    key: i32,
    size: usize,
    /// Base of the mapping, `None` once closed. The descriptor is closed
    /// as soon as the mapping exists.
    addr: Option<NonNull<u8>>,
    is_owner: bool,
}

// SAFETY: the mapping is only reached through bounds-checked copies and
// callers serialize access to the bytes with a semaphore
unsafe impl Send for SharedMemory {}
unsafe impl Sync for SharedMemory {}

fn segment_name(key: i32) -> CString {
    // Hex digits and the prefix never contain a NUL byte
    CString::new(format!("{}{:08x}", SEMSHM_PREFIX, key as u32)).unwrap_or_default()
}

fn os_error(op: &'static str, key: i32, err: Errno) -> IpcError {
    IpcError::from_os(op, Resource::SharedMemory, key, err.into())
}

impl SharedMemory {
    /// Create a segment of `size` bytes for `key`
    ///
    /// # Arguments
    /// * `key` - Segment key, mapped to a name in the POSIX shm namespace
    /// * `size` - Size in bytes, fixed for the life of the segment
    /// * `flags` - With [`IpcFlags::EXCLUSIVE`] an existing key fails with
    ///   `ResourceExists`, without it the existing segment is opened.
    ///   Without [`IpcFlags::CREATE`] this is the same as [`SharedMemory::open`].
    pub fn create(key: i32, size: usize, flags: IpcFlags) -> Result<Self> {
        if !flags.is_create() {
            return Self::open(key);
        }
        if size == 0 {
            return Err(IpcError::InvalidSize(size));
        }

        let name = segment_name(key);

        // Try to create exclusively first, fall back to open if allowed
        let fd = match shm_open(name.as_c_str(), flags.shm_oflags(), flags.mode()) {
            Ok(fd) => fd,
            Err(Errno::EXIST) if !flags.is_exclusive() => return Self::open(key),
            Err(e) => return Err(os_error("shm_open", key, e)),
        };

        if let Err(e) = ftruncate(&fd, size as u64) {
            let _ = shm_unlink(name.as_c_str());
            return Err(os_error("ftruncate", key, e));
        }

        let addr = match map(&fd, size) {
            Ok(addr) => addr,
            Err(e) => {
                let _ = shm_unlink(name.as_c_str());
                return Err(os_error("mmap", key, e));
            }
        };

        drop(fd);

        debug!(key, size, "created shared memory");
        Ok(Self {
            key,
            size,
            addr: Some(addr),
            is_owner: true,
        })
    }

    /// Open an existing segment
    pub fn open(key: i32) -> Result<Self> {
        let name = segment_name(key);

        let fd = shm_open(name.as_c_str(), ShmOFlags::RDWR, Mode::empty())
            .map_err(|e| os_error("shm_open", key, e))?;

        // Get size from file
        let stat = rustix::fs::fstat(&fd).map_err(|e| os_error("fstat", key, e))?;
        let size = stat.st_size as usize;
        if size == 0 {
            // Creator has not sized it yet
            return Err(IpcError::InvalidSize(size));
        }

        let addr = map(&fd, size).map_err(|e| os_error("mmap", key, e))?;
        drop(fd);

        debug!(key, size, "opened shared memory");
        Ok(Self {
            key,
            size,
            addr: Some(addr),
            is_owner: false,
        })
    }

    /// Base address of the mapping, valid until `close`
    pub fn as_ptr(&self) -> Result<NonNull<u8>> {
        self.addr.ok_or_else(|| self.closed())
    }

    /// Copy `bytes` into the segment at `offset`
    pub fn write_at(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        let addr = self.as_ptr()?;
        self.check_bounds(offset, bytes.len())?;

        // SAFETY: [offset, offset + len) lies inside the live mapping
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), addr.as_ptr().add(offset), bytes.len());
        }
        trace!(key = self.key, offset, len = bytes.len(), "wrote shared memory");
        Ok(())
    }

    /// Copy `len` bytes out of the segment starting at `offset`
    pub fn read_at(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        let addr = self.as_ptr()?;
        self.check_bounds(offset, len)?;

        let mut buf = vec![0u8; len];
        // SAFETY: [offset, offset + len) lies inside the live mapping
        unsafe {
            std::ptr::copy_nonoverlapping(addr.as_ptr().add(offset), buf.as_mut_ptr(), len);
        }
        trace!(key = self.key, offset, len, "read shared memory");
        Ok(buf)
    }

    #[inline]
    pub fn write_bytes(&self, bytes: &[u8]) -> Result<()> {
        self.write_at(0, bytes)
    }

    #[inline]
    pub fn read_bytes(&self, len: usize) -> Result<Vec<u8>> {
        self.read_at(0, len)
    }

    /// Unmap the segment. The owner also unlinks it, so later opens fail
    /// while existing mappings in other processes stay valid.
    ///
    /// The owner unlinks even when unmapping fails; the unmap error is
    /// reported first.
    pub fn close(&mut self) -> Result<()> {
        let Some(addr) = self.addr.take() else {
            return Ok(());
        };

        // SAFETY: addr/size describe the mapping created in `map`
        let unmapped = unsafe { munmap(addr.as_ptr().cast(), self.size) }
            .map_err(|e| os_error("munmap", self.key, e));

        let unlinked = if self.is_owner {
            shm_unlink(segment_name(self.key).as_c_str())
                .map_err(|e| os_error("shm_unlink", self.key, e))
        } else {
            Ok(())
        };

        debug!(key = self.key, removed = self.is_owner, "closed shared memory");
        unmapped.and(unlinked)
    }

    #[inline]
    pub fn key(&self) -> i32 {
        self.key
    }

    /// Size of the segment in bytes
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Check if this handle owns the segment
    #[inline]
    pub fn is_owner(&self) -> bool {
        self.is_owner
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.addr.is_none()
    }

    fn check_bounds(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(IpcError::SizeExceeded {
                max: self.size,
                got: offset.saturating_add(len),
            }),
        }
    }

    fn closed(&self) -> IpcError {
        IpcError::ResourceClosed {
            resource: Resource::SharedMemory,
            key: self.key,
        }
    }
}

fn map(fd: &OwnedFd, size: usize) -> std::result::Result<NonNull<u8>, Errno> {
    let addr = unsafe {
        mmap(
            std::ptr::null_mut(),
            size,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED,
            fd,
            0,
        )?
    };
    NonNull::new(addr.cast::<u8>()).ok_or(Errno::NOMEM)
}

impl Drop for SharedMemory {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(key = self.key, error = %e, "failed to close shared memory");
        }
    }
}
