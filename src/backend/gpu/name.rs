//! Buffer sharing by global name
//!
//! Buffer objects are exported through the device's name export ioctl. Any process that knows
//! a name can open the buffer, so the kernel only honours names for clients that authenticated
//! against a primary node. This backend therefore refuses to run on render nodes.

use std::rc::Rc;

use tracing::{error, info, instrument};

use super::{Attachment, BufferError, ExportKind, ExportedBuffer, GpuContext};
use crate::{
    backend::{
        allocator::{Buffer, GpuDevice},
        selector::{BackendInitError, InitOutcome},
    },
    config::ScreenConfig,
    host::{ClientId, Drawable, Host, HostError, NameSharingInfo, PixmapId, WindowBuffer, WindowId},
    privates::PrivateKey,
    utils::Size,
};

/// Interface version announced to the name sharing extension
pub const NAME_SHARING_VERSION: u32 = 10;

/// Parameters announcing `device` to the name sharing extension
pub fn name_sharing_info<G: GpuDevice>(device: &G) -> NameSharingInfo {
    NameSharingInfo {
        version: NAME_SHARING_VERSION,
        driver_name: device.driver_name().unwrap_or_default(),
        device_path: device.device_path(),
    }
}

/// Whether clients of `device` can go through the authentication handshake
///
/// Devices whose node type cannot be determined are assumed to support it.
pub fn can_authenticate<G: GpuDevice>(device: &G) -> bool {
    device.node_type().map_or(true, |ty| ty.requires_authentication())
}

/// Name sharing backend state of a screen
pub struct NameBackend<G: GpuDevice> {
    gpu: GpuContext<G>,
}

impl<G: GpuDevice> std::fmt::Debug for NameBackend<G> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NameBackend").field("gpu", &self.gpu).finish()
    }
}

impl<G: GpuDevice> NameBackend<G> {
    /// Try to initialize name sharing on `device`
    #[instrument(level = "debug", skip_all)]
    pub fn init<H: Host + ?Sized>(
        host: &mut H,
        device: &Rc<G>,
        key: PrivateKey,
        config: &ScreenConfig,
    ) -> InitOutcome<NameBackend<G>> {
        if !can_authenticate(device.as_ref()) {
            error!("Name sharing initialization failed: Unable to provide authentication");
            return InitOutcome::Unsupported("render nodes cannot authenticate clients");
        }

        if !host.init_name_sharing(&name_sharing_info(device.as_ref())) {
            info!("Name sharing initialization failed");
            return InitOutcome::Failed(BackendInitError::NameSharing);
        }

        info!("Name sharing initialized");
        InitOutcome::Ready(NameBackend {
            gpu: GpuContext::new(device.clone(), key, config),
        })
    }

    /// Buffer lifecycle state
    pub fn gpu(&self) -> &GpuContext<G> {
        &self.gpu
    }

    /// Mutable buffer lifecycle state
    pub fn gpu_mut(&mut self) -> &mut GpuContext<G> {
        &mut self.gpu
    }

    /// Hand the buffer object of `pixmap` to the compositor by name
    #[instrument(level = "debug", skip(self, host), err)]
    #[profiling::function]
    pub fn create_window_buffer<H: Host + ?Sized>(
        &mut self,
        host: &mut H,
        window: WindowId,
        pixmap: PixmapId,
    ) -> Result<(), BufferError> {
        let payload = self.gpu.payload(pixmap).ok_or(BufferError::NoBuffer(pixmap))?;
        let (size, stride, format) = payload
            .with_buffer(|buffer| (Size::from(buffer.size()), buffer.stride(), buffer.format()))
            .ok_or(BufferError::NoBuffer(pixmap))?;
        let name = self.gpu.export_name(pixmap, payload)?;

        host.register_window_buffer(
            window,
            pixmap,
            WindowBuffer::Name {
                name,
                stride,
                size,
                format,
            },
        )
        .map_err(BufferError::Registration)
    }

    /// Create a buffer shared by name
    pub fn create_buffer<H: Host + ?Sized>(
        &mut self,
        host: &mut H,
        drawable: Drawable,
        attachment: Attachment,
        format: u32,
    ) -> Result<ExportedBuffer<G::Buffer>, BufferError> {
        self.gpu
            .create_buffer(host, drawable, attachment, format, ExportKind::Name)
    }

    /// Authenticate a client against the device
    pub fn authenticate<H: Host + ?Sized>(
        &self,
        host: &mut H,
        client: ClientId,
        magic: u32,
    ) -> Result<(), HostError> {
        host.authenticate(client, magic)
    }

    /// Tear down the extension and release all payloads
    pub fn teardown<H: Host + ?Sized>(&mut self, host: &mut H) {
        self.gpu.release_all();
        host.close_name_sharing();
    }
}
