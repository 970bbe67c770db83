//! Shared memory backend
//!
//! Used when no GPU buffer sharing is possible. The first time a window buffer is requested for
//! a pixmap, its current contents are copied into a fresh [`ShmRegion`] and the pixmap is rebound
//! to the mapping, so further rendering lands directly in memory the compositor can read.

use std::{
    os::unix::io::AsFd,
    path::{Path, PathBuf},
};

use tracing::{debug, instrument, trace};

use super::{
    check_depth, presentation_format,
    shm::{ShmError, ShmRegion},
    UnsupportedDepth,
};
use crate::{
    host::{
        HostError, PixmapHeader, PixmapHost, PixmapId, PixmapInfo, PresentationHost, WindowBuffer,
        WindowId,
    },
    privates::{PixmapPrivates, PrivateKey},
};

/// Errors of the shared memory backend
#[derive(Debug, thiserror::Error)]
pub enum SoftwareError {
    /// The pixmap has a depth that cannot be presented
    #[error(transparent)]
    UnsupportedDepth(#[from] UnsupportedDepth),
    /// The pixmap is unknown to the host
    #[error("unknown pixmap {0:?}")]
    NoPixmap(PixmapId),
    /// The host refused to rebind the pixmap to the shared memory region
    #[error("host refused to rebind pixmap {0:?}")]
    HeaderRejected(PixmapId),
    /// The shared memory region could not be set up
    #[error(transparent)]
    Shm(#[from] ShmError),
    /// The compositor did not accept the buffer
    #[error("failed to register the window buffer")]
    Registration(#[source] HostError),
}

/// Shared memory backend state of a screen
#[derive(Debug)]
pub struct SoftwareBackend {
    shm_dir: PathBuf,
    privates: PixmapPrivates<ShmRegion>,
}

impl SoftwareBackend {
    /// Create the backend, regions are created in `shm_dir`
    pub fn new(key: PrivateKey, shm_dir: impl Into<PathBuf>) -> SoftwareBackend {
        SoftwareBackend {
            shm_dir: shm_dir.into(),
            privates: PixmapPrivates::new(key),
        }
    }

    /// Directory the regions are created in
    pub fn shm_dir(&self) -> &Path {
        &self.shm_dir
    }

    /// The region backing a pixmap
    pub fn mapping(&self, pixmap: PixmapId) -> Option<&ShmRegion> {
        self.privates.get(pixmap)
    }

    /// Number of pixmaps backed by a region
    pub fn mapped_pixmaps(&self) -> usize {
        self.privates.len()
    }

    /// Hand a shared memory copy of `pixmap` to the compositor for `window`
    ///
    /// The region is allocated on the first call only; later calls for the same pixmap just
    /// register it again.
    #[instrument(level = "debug", skip(self, host), err)]
    #[profiling::function]
    pub fn create_window_buffer<H>(
        &mut self,
        host: &mut H,
        window: WindowId,
        pixmap: PixmapId,
    ) -> Result<(), SoftwareError>
    where
        H: PixmapHost + PresentationHost + ?Sized,
    {
        let info = host.pixmap(pixmap).ok_or(SoftwareError::NoPixmap(pixmap))?;
        let depth = check_depth(info.depth as u32)?;
        let stride = packed_stride(&info);

        if !self.privates.contains(pixmap) {
            let region = self.map_pixmap(host, pixmap, &info)?;
            self.privates.attach(pixmap, region);
        } else {
            trace!(?pixmap, "Reusing shared memory region");
        }

        let region = self.privates.get(pixmap).ok_or(SoftwareError::NoPixmap(pixmap))?;
        host.register_window_buffer(
            window,
            pixmap,
            WindowBuffer::Shm {
                fd: region.as_fd(),
                stride,
                size: info.size(),
                format: presentation_format(depth),
            },
        )
        .map_err(SoftwareError::Registration)
    }

    fn map_pixmap<H>(
        &self,
        host: &mut H,
        pixmap: PixmapId,
        info: &PixmapInfo,
    ) -> Result<ShmRegion, SoftwareError>
    where
        H: PixmapHost + ?Sized,
    {
        let stride = packed_stride(info) as usize;
        let mut region = ShmRegion::new(&self.shm_dir, stride * info.height as usize)?;

        if let Some(contents) = host.pixmap_contents(pixmap) {
            let src_stride = info.stride as usize;
            let row = stride.min(src_stride);
            for (dst, src) in region
                .as_mut_slice()
                .chunks_exact_mut(stride)
                .zip(contents.chunks(src_stride.max(1)))
            {
                let n = row.min(src.len());
                dst[..n].copy_from_slice(&src[..n]);
            }
        }

        let header = PixmapHeader {
            stride: Some(stride as u32),
            data: Some(region.backing_store()),
            ..Default::default()
        };
        if !host.modify_pixmap_header(pixmap, header) {
            debug!(?pixmap, "Host refused to rebind pixmap storage");
            return Err(SoftwareError::HeaderRejected(pixmap));
        }

        debug!(?pixmap, size = region.len(), "Pixmap rebound to shared memory");
        Ok(region)
    }

    /// Destroy a pixmap, releasing its region when this is the final reference
    pub fn destroy_pixmap<H>(&mut self, host: &mut H, pixmap: PixmapId) -> bool
    where
        H: PixmapHost + ?Sized,
    {
        let last = host.pixmap(pixmap).map_or(false, |info| info.refcount == 1);
        if last {
            // unmapped and closed on drop
            if let Some(region) = self.privates.clear(pixmap) {
                trace!(?pixmap, size = region.len(), "Releasing shared memory region");
            }
        }
        host.destroy_pixmap(pixmap)
    }

    /// Release every region
    pub fn teardown(&mut self) {
        let released = self.privates.drain().count();
        if released > 0 {
            debug!(released, "Released remaining shared memory regions");
        }
    }
}

/// Row size of the pixmap without padding
fn packed_stride(info: &PixmapInfo) -> u32 {
    info.width * info.bytes_per_pixel()
}
