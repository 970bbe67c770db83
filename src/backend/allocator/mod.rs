//! GPU buffer allocation
//!
//! The GPU backends allocate one buffer object per accelerated pixmap through a [`GpuDevice`]
//! and share it with the compositor either by global name or by descriptor.
//!
//! Implementations provided:
//! - [`GbmGpuDevice`](gbm::GbmGpuDevice) through [`::gbm::Device`] (feature `backend_gbm`)
//!
//! Buffer objects release their GPU memory when dropped. The kernel keeps the memory alive
//! while other processes still hold a name or descriptor for it.

#[cfg(feature = "backend_gbm")]
pub mod gbm;

use std::{
    io,
    os::unix::io::{BorrowedFd, OwnedFd},
    path::PathBuf,
};

pub use drm_fourcc::{DrmFourcc as Fourcc, DrmModifier as Modifier, UnrecognizedFourcc};

use crate::backend::node::NodeType;

/// Common properties of GPU buffer objects
pub trait Buffer {
    /// Width of the two-dimensional buffer
    fn width(&self) -> u32;
    /// Height of the two-dimensional buffer
    fn height(&self) -> u32;
    /// Size (w x h) of the two-dimensional buffer
    fn size(&self) -> (u32, u32) {
        (self.width(), self.height())
    }
    /// Pixel format of the buffer
    fn format(&self) -> Fourcc;
    /// Bytes per row
    fn stride(&self) -> u32;
    /// Handle of the buffer on the allocating device
    fn handle(&self) -> u32;
    /// Export the buffer as a new descriptor owned by the caller
    fn export_fd(&self) -> io::Result<OwnedFd>;
}

bitflags::bitflags! {
    /// Intended usage of a buffer object
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        /// The buffer is rendered to by the GPU
        const RENDERING = 1;
        /// The buffer may be scanned out by the compositor
        const SCANOUT = 2;
    }
}

/// A GPU device able to allocate and share buffer objects
pub trait GpuDevice {
    /// Buffer objects allocated by this device
    type Buffer: Buffer;
    /// Error returned by allocations
    type Error: std::error::Error + Send + Sync + 'static;

    /// Descriptor of the opened device
    fn device_fd(&self) -> BorrowedFd<'_>;
    /// Type of the device node, `None` if it could not be determined
    fn node_type(&self) -> Option<NodeType>;
    /// Name of the kernel driver
    fn driver_name(&self) -> Option<String>;
    /// Path of the device node
    fn device_path(&self) -> Option<PathBuf>;

    /// Allocate a new buffer object
    fn create_buffer(
        &self,
        width: u32,
        height: u32,
        format: Fourcc,
        usage: BufferUsage,
    ) -> Result<Self::Buffer, Self::Error>;

    /// Import a buffer object from a descriptor
    fn import_buffer(
        &self,
        fd: BorrowedFd<'_>,
        width: u32,
        height: u32,
        stride: u32,
        format: Fourcc,
    ) -> Result<Self::Buffer, Self::Error>;

    /// Export a global name for a buffer object
    fn export_name(&self, buffer: &Self::Buffer) -> io::Result<u32>;
}
