//! POSIX shared-memory region management.
//!
//! A [`Region`] is a mapped byte range backed by a named shared-memory
//! object. Creation is exclusive (`O_CREAT | O_EXCL`) so exactly one
//! process initialises the control block; attachers map what already
//! exists and discover the geometry from it. Dropping a `Region` unmaps;
//! it never unlinks — the name outlives every handle until someone calls
//! [`Region::unlink`].

use std::ffi::CString;
use std::io;
use std::mem::size_of;
use std::ptr::NonNull;

use log::debug;

use crate::layout::ControlBlock;
use crate::{QueueError, Result};

/// Mode bits for freshly created shared-memory objects.
const REGION_MODE: libc::mode_t = 0o666;

/// A mapped shared-memory region.
///
/// Invariant: `len >= size_of::<ControlBlock>()`, so the typed control
/// view is always in bounds.
pub(crate) struct Region {
    ptr: NonNull<u8>,
    len: usize,
}

// Safety: the mapping is shared between processes by design; all
// cross-process mutation goes through the atomic fields of the layout
// structs, and payload bytes are ordered by the head/tail protocol.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Exclusively creates a region of `len` bytes.
    ///
    /// The new object is zero-filled by the kernel (`ftruncate` on a
    /// fresh object), so the control block starts from all-zeroes.
    pub(crate) fn create(name: &str, len: usize) -> Result<Region> {
        let c_name = region_name(name)?;
        debug_assert!(len >= size_of::<ControlBlock>());

        let fd = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                REGION_MODE,
            )
        };
        if fd < 0 {
            return Err(QueueError::from_os(io::Error::last_os_error()));
        }

        if unsafe { libc::ftruncate(fd, len as libc::off_t) } != 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(fd);
                libc::shm_unlink(c_name.as_ptr());
            }
            return Err(QueueError::from_os(err));
        }

        let region = map_fd(fd, len, false);
        unsafe { libc::close(fd) };
        if region.is_err() {
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
        } else {
            debug!("created region {name} ({len} bytes)");
        }
        region
    }

    /// Maps an existing region in full, using the backing object's size.
    pub(crate) fn open(name: &str, readonly: bool) -> Result<Region> {
        let (fd, size) = open_and_stat(name, readonly)?;
        if size < size_of::<ControlBlock>() {
            unsafe { libc::close(fd) };
            return Err(QueueError::Corrupted);
        }
        let region = map_fd(fd, size, readonly);
        unsafe { libc::close(fd) };
        if region.is_ok() {
            debug!("attached region {name} ({size} bytes, readonly={readonly})");
        }
        region
    }

    /// Maps only the control block of an existing region.
    ///
    /// First step of the attach handshake: the caller validates the magic
    /// and reads the geometry from this small map before committing to
    /// the full-size one.
    pub(crate) fn open_control(name: &str, readonly: bool) -> Result<Region> {
        let (fd, size) = open_and_stat(name, readonly)?;
        if size < size_of::<ControlBlock>() {
            unsafe { libc::close(fd) };
            return Err(QueueError::Corrupted);
        }
        let region = map_fd(fd, size_of::<ControlBlock>(), readonly);
        unsafe { libc::close(fd) };
        region
    }

    /// Size of the backing object without mapping it.
    pub(crate) fn stat_size(name: &str) -> Result<usize> {
        let (fd, size) = open_and_stat(name, true)?;
        unsafe { libc::close(fd) };
        Ok(size)
    }

    /// Removes `name` from the shared-memory namespace.
    ///
    /// Existing mappings stay valid; the object is destroyed once the
    /// last of them drops.
    pub(crate) fn unlink(name: &str) -> Result<()> {
        let c_name = region_name(name)?;
        if unsafe { libc::shm_unlink(c_name.as_ptr()) } != 0 {
            return Err(QueueError::from_os(io::Error::last_os_error()));
        }
        debug!("unlinked region {name}");
        Ok(())
    }

    #[inline]
    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Typed view of the control block at the start of the mapping.
    #[inline]
    pub(crate) fn control(&self) -> &ControlBlock {
        // SAFETY: every constructor guarantees len >= sizeof(ControlBlock)
        // and the mapping base is page-aligned, which satisfies the
        // 64-byte alignment of ControlBlock.
        unsafe { &*self.ptr.as_ptr().cast::<ControlBlock>() }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr().cast::<libc::c_void>(), self.len);
        }
    }
}

/// Validates a region name and converts it for the C API.
fn region_name(name: &str) -> Result<CString> {
    if !name.starts_with('/') || name.len() < 2 {
        return Err(QueueError::Invalid {
            reason: "region name must be non-empty and start with '/'",
        });
    }
    CString::new(name).map_err(|_| QueueError::Invalid {
        reason: "region name contains a NUL byte",
    })
}

fn open_and_stat(name: &str, readonly: bool) -> Result<(libc::c_int, usize)> {
    let c_name = region_name(name)?;
    let oflag = if readonly { libc::O_RDONLY } else { libc::O_RDWR };

    let fd = unsafe { libc::shm_open(c_name.as_ptr(), oflag, 0) };
    if fd < 0 {
        return Err(QueueError::from_os(io::Error::last_os_error()));
    }

    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut st) } != 0 {
        let err = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(QueueError::from_os(err));
    }

    Ok((fd, st.st_size as usize))
}

fn map_fd(fd: libc::c_int, len: usize, readonly: bool) -> Result<Region> {
    let prot = if readonly {
        libc::PROT_READ
    } else {
        libc::PROT_READ | libc::PROT_WRITE
    };

    let ptr = unsafe { libc::mmap(std::ptr::null_mut(), len, prot, libc::MAP_SHARED, fd, 0) };
    if ptr == libc::MAP_FAILED {
        return Err(QueueError::from_os(io::Error::last_os_error()));
    }

    Ok(Region {
        // SAFETY: mmap returned something other than MAP_FAILED, which is
        // a valid non-null mapping base.
        ptr: unsafe { NonNull::new_unchecked(ptr.cast::<u8>()) },
        len,
    })
}
