//! Buffer objects allocated through [libgbm](gbm).
//!
//! [`GbmGpuDevice`] wraps a [`gbm::Device`] opened on the host's DRM device and implements
//! [`GpuDevice`]; its [`GbmBuffer`]s satisfy the [`Buffer`] trait.

use std::{
    io,
    os::unix::io::{AsFd, BorrowedFd, OwnedFd},
    path::PathBuf,
};

use gbm::{BufferObject, BufferObjectFlags};
use tracing::{instrument, trace};

use super::{Buffer, BufferUsage, Fourcc, GpuDevice};
use crate::backend::node::{DrmNode, NodeType};

/// Owned descriptor of an opened DRM device
#[derive(Debug)]
pub struct DeviceFd(OwnedFd);

impl DeviceFd {
    /// Wrap an opened device
    pub fn new(fd: OwnedFd) -> DeviceFd {
        DeviceFd(fd)
    }
}

impl AsFd for DeviceFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl drm::Device for DeviceFd {}

/// A GBM buffer object
#[derive(Debug)]
pub struct GbmBuffer {
    bo: BufferObject<()>,
}

impl Buffer for GbmBuffer {
    #[inline]
    fn width(&self) -> u32 {
        self.bo.width()
    }

    #[inline]
    fn height(&self) -> u32 {
        self.bo.height()
    }

    #[inline]
    fn format(&self) -> Fourcc {
        self.bo.format()
    }

    #[inline]
    fn stride(&self) -> u32 {
        self.bo.stride()
    }

    #[inline]
    fn handle(&self) -> u32 {
        u32::from(drm::buffer::Buffer::handle(&self.bo))
    }

    fn export_fd(&self) -> io::Result<OwnedFd> {
        // SAFETY of ownership: `gbm_bo_get_fd` returns a new fd owned by the caller.
        self.bo
            .fd()
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
    }
}

impl std::ops::Deref for GbmBuffer {
    type Target = BufferObject<()>;

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.bo
    }
}

/// GPU device backed by libgbm
#[derive(Debug)]
pub struct GbmGpuDevice {
    device: gbm::Device<DeviceFd>,
    node: Option<DrmNode>,
}

impl GbmGpuDevice {
    /// Open a gbm device on a DRM device descriptor
    pub fn new(fd: OwnedFd) -> io::Result<GbmGpuDevice> {
        let device = gbm::Device::new(DeviceFd::new(fd))?;
        let node = DrmNode::from_file(device.as_fd()).ok();
        Ok(GbmGpuDevice { device, node })
    }

    /// The DRM node of the device when available
    pub fn node(&self) -> Option<DrmNode> {
        self.node
    }
}

impl AsFd for GbmGpuDevice {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.device.as_fd()
    }
}

fn usage_flags(usage: BufferUsage) -> BufferObjectFlags {
    let mut flags = BufferObjectFlags::empty();
    if usage.contains(BufferUsage::RENDERING) {
        flags |= BufferObjectFlags::RENDERING;
    }
    if usage.contains(BufferUsage::SCANOUT) {
        flags |= BufferObjectFlags::SCANOUT;
    }
    flags
}

impl GpuDevice for GbmGpuDevice {
    type Buffer = GbmBuffer;
    type Error = io::Error;

    fn device_fd(&self) -> BorrowedFd<'_> {
        self.device.as_fd()
    }

    fn node_type(&self) -> Option<NodeType> {
        self.node.map(|node| node.ty())
    }

    fn driver_name(&self) -> Option<String> {
        drm::Device::get_driver(&self.device)
            .ok()
            .map(|driver| driver.name().to_string_lossy().into_owned())
    }

    fn device_path(&self) -> Option<PathBuf> {
        self.node.and_then(|node| node.dev_path())
    }

    #[instrument(level = "trace", skip(self), err)]
    #[profiling::function]
    fn create_buffer(
        &self,
        width: u32,
        height: u32,
        format: Fourcc,
        usage: BufferUsage,
    ) -> Result<GbmBuffer, io::Error> {
        self.device
            .create_buffer_object::<()>(width, height, format, usage_flags(usage))
            .map(|bo| GbmBuffer { bo })
    }

    #[instrument(level = "trace", skip(self, fd), err)]
    fn import_buffer(
        &self,
        fd: BorrowedFd<'_>,
        width: u32,
        height: u32,
        stride: u32,
        format: Fourcc,
    ) -> Result<GbmBuffer, io::Error> {
        self.device
            .import_buffer_object_from_dma_buf::<()>(
                fd,
                width,
                height,
                stride,
                format,
                BufferObjectFlags::RENDERING,
            )
            .map(|bo| GbmBuffer { bo })
    }

    fn export_name(&self, buffer: &GbmBuffer) -> io::Result<u32> {
        flink_name(self.device.as_fd(), buffer.handle())
    }
}

/// Global name of a GEM handle on `fd`
fn flink_name(fd: BorrowedFd<'_>, handle: u32) -> io::Result<u32> {
    let flink = drm_ffi::gem::flink(fd, handle)?;
    trace!(handle, name = flink.name, "Exported buffer name");
    Ok(flink.name)
}
