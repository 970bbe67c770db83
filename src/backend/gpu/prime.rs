//! Buffer sharing by file descriptor
//!
//! Buffer objects are exported as descriptors and passed to the compositor and clients over the
//! host's local descriptor passing channel. Besides compositor support this needs shared memory
//! sync fences and the descriptor passing extension, which routes its open, import and export
//! requests to [`PrimeBackend::open_client_device`], [`PrimeBackend::pixmap_from_fd`] and
//! [`PrimeBackend::fd_from_pixmap`].
//!
//! Older clients keep working through the name sharing extension, which is registered alongside
//! when possible.

use std::{
    os::unix::io::{AsFd, BorrowedFd, OwnedFd},
    rc::Rc,
};

use tracing::{debug, error, info, instrument};

use super::{name::name_sharing_info, Attachment, BufferError, ExportKind, ExportedBuffer, GpuContext};
use crate::{
    backend::{
        allocator::{Buffer, GpuDevice},
        check_depth, presentation_format,
        selector::{BackendInitError, InitOutcome},
    },
    config::ScreenConfig,
    host::{ClientId, Drawable, FdPassingInfo, Host, HostError, PixmapId, PixmapUsage, WindowBuffer, WindowId},
    privates::PrivateKey,
    utils::Size,
};

/// Interface version announced to the descriptor passing extension
pub const FD_PASSING_VERSION: u32 = 1;

/// A pixmap exported as a descriptor
#[derive(Debug)]
pub struct PixmapExport {
    /// Descriptor of the buffer object
    pub fd: OwnedFd,
    /// Bytes per row
    pub stride: u32,
    /// Size of the buffer in bytes
    pub size: u32,
}

/// Descriptor passing backend state of a screen
pub struct PrimeBackend<G: GpuDevice> {
    gpu: GpuContext<G>,
    name_sharing: bool,
}

impl<G: GpuDevice> std::fmt::Debug for PrimeBackend<G> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrimeBackend")
            .field("gpu", &self.gpu)
            .field("name_sharing", &self.name_sharing)
            .finish()
    }
}

impl<G: GpuDevice> PrimeBackend<G> {
    /// Try to initialize descriptor passing on `device`
    ///
    /// Either every requirement is met and the extensions are set up, or nothing is left
    /// registered.
    #[instrument(level = "debug", skip_all)]
    pub fn init<H: Host + ?Sized>(
        host: &mut H,
        device: &Rc<G>,
        key: PrivateKey,
        config: &ScreenConfig,
    ) -> InitOutcome<PrimeBackend<G>> {
        if !host.supports_fd_passing() {
            info!("Descriptor passing initialization failed: not supported by the compositor");
            return InitOutcome::Unsupported("compositor does not accept buffer descriptors");
        }
        if !host.acceleration_supports_fd_passing() {
            info!("Descriptor passing initialization failed: not supported by the acceleration layer");
            return InitOutcome::Unsupported("acceleration layer cannot export buffer descriptors");
        }

        if !host.init_sync_fences() {
            info!("Descriptor passing initialization failed: sync fences unavailable");
            return InitOutcome::Failed(BackendInitError::SyncFences);
        }
        let mut host = scopeguard::guard(host, |host| host.close_sync_fences());
        if !host.init_fd_passing(&FdPassingInfo {
            version: FD_PASSING_VERSION,
        }) {
            info!("Descriptor passing initialization failed");
            return InitOutcome::Failed(BackendInitError::FdPassing);
        }
        let host = scopeguard::ScopeGuard::into_inner(host);
        info!("Descriptor passing initialized");

        let name_sharing = host.init_name_sharing(&name_sharing_info(device.as_ref()));
        if name_sharing {
            info!("Name sharing initialized");
        } else {
            info!("Name sharing initialization failed");
        }

        InitOutcome::Ready(PrimeBackend {
            gpu: GpuContext::new(device.clone(), key, config),
            name_sharing,
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

    /// Whether name sharing was registered alongside
    pub fn has_name_sharing(&self) -> bool {
        self.name_sharing
    }

    /// Hand the buffer object of `pixmap` to the compositor by descriptor
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
        // closed once the compositor has its own copy
        let fd = self.gpu.export_fd(pixmap, payload)?;

        host.register_window_buffer(
            window,
            pixmap,
            WindowBuffer::Dmabuf {
                fd: fd.as_fd(),
                stride,
                size,
                format,
            },
        )
        .map_err(BufferError::Registration)
    }

    /// Create a buffer shared by descriptor
    pub fn create_buffer<H: Host + ?Sized>(
        &mut self,
        host: &mut H,
        drawable: Drawable,
        attachment: Attachment,
        format: u32,
    ) -> Result<ExportedBuffer<G::Buffer>, BufferError> {
        self.gpu.create_buffer(host, drawable, attachment, format, ExportKind::Fd)
    }

    /// Open the device for a client
    pub fn open_client_device<H: Host + ?Sized>(&self, host: &mut H) -> Result<OwnedFd, HostError> {
        host.open_client_device().map_err(|err| {
            error!("Failed to open the device for a client: {}", err);
            err
        })
    }

    /// Authenticate a client of the name sharing extension
    pub fn authenticate<H: Host + ?Sized>(
        &self,
        host: &mut H,
        client: ClientId,
        magic: u32,
    ) -> Result<(), HostError> {
        host.authenticate(client, magic)
    }

    /// Export the buffer object of a pixmap as a descriptor
    pub fn fd_from_pixmap(&self, pixmap: PixmapId) -> Result<PixmapExport, BufferError> {
        let payload = self.gpu.payload(pixmap).ok_or(BufferError::NoBuffer(pixmap))?;
        let (stride, height) = payload
            .with_buffer(|buffer| (buffer.stride(), buffer.height()))
            .ok_or(BufferError::NoBuffer(pixmap))?;
        let fd = self.gpu.export_fd(pixmap, payload)?;
        Ok(PixmapExport {
            fd,
            stride,
            size: stride * height,
        })
    }

    /// Import a client descriptor as a new buffer backed pixmap
    #[instrument(level = "debug", skip(self, host, fd), err)]
    pub fn pixmap_from_fd<H: Host + ?Sized>(
        &mut self,
        host: &mut H,
        fd: BorrowedFd<'_>,
        size: Size,
        stride: u32,
        depth: u8,
    ) -> Result<PixmapId, BufferError> {
        let depth = check_depth(depth as u32)?;
        self.gpu.check_dimensions(size)?;

        let buffer = self
            .gpu
            .device()
            .import_buffer(fd, size.w, size.h, stride, presentation_format(depth))
            .map_err(|err| BufferError::Import(Box::new(err)))?;
        let pixmap = host
            .create_pixmap(Size::from((0, 0)), depth, PixmapUsage::Default)
            .ok_or(BufferError::PixmapCreation)?;

        match self.gpu.attach_buffer(host, pixmap, buffer) {
            Ok(()) => {
                debug!(?pixmap, %size, "Imported client buffer");
                Ok(pixmap)
            }
            Err(err) => {
                host.destroy_pixmap(pixmap);
                Err(err)
            }
        }
    }

    /// Tear down the extensions and release all payloads
    pub fn teardown<H: Host + ?Sized>(&mut self, host: &mut H) {
        self.gpu.release_all();
        if self.name_sharing {
            host.close_name_sharing();
        }
        host.close_fd_passing();
        host.close_sync_fences();
    }
}
