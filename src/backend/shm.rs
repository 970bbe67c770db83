//! Anonymous shared memory regions
//!
//! A region is a temporary file whose directory entry is removed right away, so it is only
//! reachable through its descriptor, mapped read-write and shared. The descriptor can be handed
//! to the compositor while this process keeps drawing into the mapping.

use std::{
    fs::File,
    io,
    os::unix::io::{AsFd, BorrowedFd},
    path::Path,
    ptr::{self, NonNull},
    slice,
};

use rustix::mm::{self, MapFlags, ProtFlags};
use tracing::{error, trace};

use crate::host::BackingStore;

/// Failure to set up a shared memory region
#[derive(Debug, thiserror::Error)]
pub enum ShmError {
    /// The temporary file could not be created
    #[error("failed to create a temporary file in {dir}")]
    Create {
        /// Directory the file was created in
        dir: String,
        /// Underlying error
        #[source]
        source: io::Error,
    },
    /// The temporary file could not be resized
    #[error("failed to resize the temporary file to {size} bytes")]
    Resize {
        /// Requested size
        size: usize,
        /// Underlying error
        #[source]
        source: io::Error,
    },
    /// The file could not be mapped
    #[error("failed to map {size} bytes")]
    Map {
        /// Requested size
        size: usize,
        /// Underlying error
        #[source]
        source: io::Error,
    },
    /// A zero sized region was requested
    #[error("cannot map an empty region")]
    EmptyRegion,
}

/// A mapped shared memory region
///
/// Unmapped and closed on drop.
#[derive(Debug)]
pub struct ShmRegion {
    file: File,
    ptr: NonNull<u8>,
    size: usize,
}

impl ShmRegion {
    /// Create a region of `size` bytes backed by an unnamed file in `dir`
    pub fn new(dir: &Path, size: usize) -> Result<ShmRegion, ShmError> {
        if size == 0 {
            return Err(ShmError::EmptyRegion);
        }

        // `tempfile_in` unlinks the entry before returning
        let file = tempfile::tempfile_in(dir).map_err(|source| {
            error!(dir = %dir.display(), "Failed to create temporary file: {}", source);
            ShmError::Create {
                dir: dir.display().to_string(),
                source,
            }
        })?;

        file.set_len(size as u64).map_err(|source| {
            error!(size, "Failed to resize temporary file: {}", source);
            ShmError::Resize { size, source }
        })?;

        let ptr = unsafe { map(&file, size) }.map_err(|source| {
            error!(size, "Failed to map temporary file: {}", source);
            ShmError::Map { size, source }
        })?;

        trace!(size, "Created shared memory region");
        Ok(ShmRegion { file, ptr, size })
    }

    /// Size of the region in bytes
    #[inline]
    pub fn len(&self) -> usize {
        self.size
    }

    /// Regions are never empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Contents of the region
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the mapping is readable, `size` bytes long and lives as long as `self`
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.size) }
    }

    /// Mutable contents of the region
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: the mapping is writable and borrowed exclusively
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.size) }
    }

    /// The mapping as a host pixmap backing store
    pub fn backing_store(&self) -> BackingStore {
        BackingStore::new(self.ptr, self.size)
    }
}

impl AsFd for ShmRegion {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        // munmap cannot fail, as we are unmapping a pre-existing map
        let _ = unsafe { mm::munmap(self.ptr.as_ptr().cast(), self.size) };
        trace!(size = self.size, "Released shared memory region");
    }
}

unsafe fn map(file: &File, size: usize) -> io::Result<NonNull<u8>> {
    let ptr = mm::mmap(
        ptr::null_mut(),
        size,
        ProtFlags::READ | ProtFlags::WRITE,
        MapFlags::SHARED,
        file,
        0,
    )?;
    NonNull::new(ptr.cast::<u8>()).ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned null"))
}
