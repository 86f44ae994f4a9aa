use std::fmt;
use std::ptr::NonNull;

#[derive(Debug)]
pub enum VmError {
    MapFailed(std::io::Error),
    UnmapFailed(std::io::Error),
    InitializationFailed(String),
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::MapFailed(e) => write!(f, "VM map failed: {e}"),
            VmError::UnmapFailed(e) => write!(f, "VM unmap failed: {e}"),
            VmError::InitializationFailed(msg) => write!(f, "VM initialization failed: {msg}"),
        }
    }
}

impl std::error::Error for VmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            VmError::MapFailed(e) | VmError::UnmapFailed(e) => Some(e),
            VmError::InitializationFailed(_) => None,
        }
    }
}

/// Abstract interface for the virtual memory primitives the heap consumes.
///
/// Pools are mapped committed and read-write in one step: every page of a
/// pool is reachable through the page table and bitmaps from the moment the
/// pool exists, so there is no reserve/commit split.
pub(crate) trait VmOps {
    /// Map `size` bytes of zero-filled, read-write memory.
    /// The returned address is aligned to at least 4096 bytes.
    unsafe fn map(size: usize) -> Result<NonNull<u8>, VmError>;

    /// Unmap a region previously returned by [`map`](VmOps::map)
    /// (after which pointers into it are invalid).
    unsafe fn unmap(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;
}

pub(crate) struct PlatformVmOps;

#[cfg(all(unix, not(miri)))]
mod unix {
    use super::{NonNull, PlatformVmOps, VmError, VmOps};
    use std::io;

    impl VmOps for PlatformVmOps {
        unsafe fn map(size: usize) -> Result<NonNull<u8>, VmError> {
            if size == 0 {
                return Err(VmError::MapFailed(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "zero-size mapping",
                )));
            }
            // Safety: FFI call to mmap.
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANON,
                    -1,
                    0,
                )
            };

            if ptr == libc::MAP_FAILED {
                return Err(VmError::MapFailed(io::Error::last_os_error()));
            }

            match NonNull::new(ptr.cast::<u8>()) {
                Some(p) => Ok(p),
                None => Err(VmError::MapFailed(io::Error::other("mmap returned null"))),
            }
        }

        unsafe fn unmap(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to munmap.
            if unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), size) } != 0 {
                return Err(VmError::UnmapFailed(io::Error::last_os_error()));
            }
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Fallback: heap-backed VmOps (no real mmap)
//
// Under Miri (and on targets without the Unix mapping path) every "mapping"
// is backed by a plain 4096-aligned heap allocation. Sufficient for testing
// the pool bookkeeping and for detecting undefined behaviour in unsafe
// pointer code; actual page-granular mapping behaviour is exercised by the
// Unix implementation in normal builds.
// ---------------------------------------------------------------------------
#[cfg(any(not(unix), miri))]
impl VmOps for PlatformVmOps {
    unsafe fn map(size: usize) -> Result<NonNull<u8>, VmError> {
        if size == 0 {
            return Err(VmError::MapFailed(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "zero-size mapping",
            )));
        }
        let layout = std::alloc::Layout::from_size_align(size, 4096)
            .map_err(|e| VmError::MapFailed(std::io::Error::other(e)))?;
        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or_else(|| {
            VmError::MapFailed(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                "alloc returned null",
            ))
        })
    }

    unsafe fn unmap(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
        let layout = std::alloc::Layout::from_size_align(size, 4096)
            .map_err(|e| VmError::UnmapFailed(std::io::Error::other(e)))?;
        // Safety: ptr was allocated with the same layout via `map`.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        Ok(())
    }
}
