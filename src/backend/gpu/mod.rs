//! Buffer object lifecycle shared by the GPU backends
//!
//! Every accelerated pixmap carries a [`GpuPixmap`] payload holding its buffer object. Two
//! reference counts are involved and they are kept apart:
//!
//! - the host's own pixmap reference count, which decides when the pixmap is destroyed
//! - the payload's count, which decides when the buffer object is released
//!
//! The pixmap holds one payload reference from creation until its final destruction, and every
//! [`ExportedBuffer`] holds one more until it is destroyed itself. Exported buffers also hold a
//! host reference on their pixmap, so the buffer object is released on whichever of the two
//! comes last, exactly once.
//!
//! Front buffers alias the drawable's pixmap: requesting one takes a host reference on the
//! existing pixmap instead of creating a new one. Every other attachment gets a private pixmap
//! of the drawable's size, owned by the exported buffer.

pub mod name;
pub mod prime;

use std::{
    cell::{Cell, RefCell},
    fmt, io,
    os::unix::io::OwnedFd,
    rc::Rc,
};

use tracing::{debug, error, instrument, trace, warn};

use super::{
    allocator::{Buffer, BufferUsage, Fourcc, GpuDevice},
    check_depth, UnsupportedDepth,
};
use crate::{
    config::ScreenConfig,
    host::{
        CopyArea, Drawable, DrawableInfo, Host, HostError, PixmapHeader, PixmapHost, PixmapId, PixmapUsage,
    },
    privates::{PixmapPrivates, PrivateKey},
    utils::{Point, Rectangle, Region, Size},
};

/// Errors of the GPU buffer lifecycle
#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    /// The requested depth cannot be shared
    #[error(transparent)]
    UnsupportedDepth(#[from] UnsupportedDepth),
    /// The drawable is unknown to the host
    #[error("unknown drawable")]
    NoDrawable,
    /// The host could not create a pixmap
    #[error("failed to create a pixmap")]
    PixmapCreation,
    /// The pixmap has no buffer object attached
    #[error("pixmap {0:?} is not backed by a buffer object")]
    NoBuffer(PixmapId),
    /// A buffer object of this size cannot be created
    #[error("invalid buffer dimensions {0}")]
    InvalidDimensions(Size),
    /// The device could not allocate a buffer object
    #[error("failed to allocate a buffer object")]
    Allocation(#[source] Box<dyn std::error::Error + Send + Sync>),
    /// The buffer object could not be exported by name
    #[error("failed to export the buffer name")]
    NameExport(#[source] io::Error),
    /// The buffer object could not be exported as a descriptor
    #[error("failed to export the buffer descriptor")]
    DescriptorExport(#[source] io::Error),
    /// A client descriptor could not be imported
    #[error("failed to import the buffer descriptor")]
    Import(#[source] Box<dyn std::error::Error + Send + Sync>),
    /// The acceleration layer could not bind a texture to the buffer object
    #[error("failed to bind a texture to pixmap {0:?}")]
    TextureBinding(PixmapId),
    /// The compositor did not accept the buffer
    #[error("failed to register the window buffer")]
    Registration(#[source] HostError),
}

/// Buffer object payload of an accelerated pixmap
#[derive(Debug)]
pub struct GpuPixmap<B> {
    refcount: Cell<u32>,
    buffer: RefCell<Option<B>>,
}

impl<B> GpuPixmap<B> {
    fn new(buffer: B) -> Rc<GpuPixmap<B>> {
        Rc::new(GpuPixmap {
            refcount: Cell::new(1),
            buffer: RefCell::new(Some(buffer)),
        })
    }

    /// Number of holders of the buffer object
    pub fn refcount(&self) -> u32 {
        self.refcount.get()
    }

    /// Whether the buffer object was released
    pub fn is_released(&self) -> bool {
        self.buffer.borrow().is_none()
    }

    /// Run `f` on the buffer object unless it was released
    pub fn with_buffer<R>(&self, f: impl FnOnce(&B) -> R) -> Option<R> {
        self.buffer.borrow().as_ref().map(f)
    }

    fn acquire(&self) {
        self.refcount.set(self.refcount.get() + 1);
    }

    /// Drop one hold, releasing the buffer object on the transition to zero
    fn release(&self) -> bool {
        match self.refcount.get() {
            0 => {
                warn!("Buffer object released more often than it was acquired");
                false
            }
            1 => {
                self.refcount.set(0);
                let buffer = self.buffer.borrow_mut().take();
                trace!("Released buffer object");
                buffer.is_some()
            }
            n => {
                self.refcount.set(n - 1);
                false
            }
        }
    }
}

impl<B: Buffer> GpuPixmap<B> {
    /// Stride of the buffer object
    pub fn stride(&self) -> Option<u32> {
        self.with_buffer(|buffer| buffer.stride())
    }
}

/// Role of an exported buffer relative to its drawable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Attachment {
    /// The visible front buffer, aliasing the drawable's pixmap
    FrontLeft,
    /// Any auxiliary buffer (back, depth, ...) by its protocol value
    Other(u32),
}

impl From<u32> for Attachment {
    fn from(value: u32) -> Attachment {
        match value {
            0 => Attachment::FrontLeft,
            other => Attachment::Other(other),
        }
    }
}

/// Depth and storage size of a requested buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferFormat {
    /// Color depth
    pub depth: u8,
    /// Bytes per pixel
    pub cpp: u32,
}

impl BufferFormat {
    /// Resolve a buffer request
    ///
    /// A non-zero `format` is the requested depth, otherwise the drawable's own depth is used.
    pub fn from_request(format: u32, drawable: &DrawableInfo) -> Result<BufferFormat, UnsupportedDepth> {
        let (depth, cpp) = if format != 0 {
            let cpp = match format {
                15 => 2,
                24 => 4,
                depth => depth / 8,
            };
            (format, cpp)
        } else {
            (drawable.depth as u32, drawable.bits_per_pixel as u32 / 8)
        };
        let depth = check_depth(depth)?;
        Ok(BufferFormat { depth, cpp })
    }
}

/// Handle a client uses to access an exported buffer
#[derive(Debug)]
pub enum BufferHandle {
    /// Global name of the buffer object
    Name(u32),
    /// Descriptor of the buffer object
    Fd(OwnedFd),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExportKind {
    Name,
    Fd,
}

#[derive(Debug)]
struct ExportedInner<B> {
    attachment: Attachment,
    pitch: u32,
    format: BufferFormat,
    requested_format: u32,
    handle: BufferHandle,
    pixmap: PixmapId,
    refcnt: Cell<u32>,
    payload: Rc<GpuPixmap<B>>,
}

/// A buffer handed to a client
///
/// Clones refer to the same record. The record is destroyed when its reference count reaches
/// zero through [`GpuContext::destroy_buffer`].
#[derive(Debug)]
pub struct ExportedBuffer<B>(Rc<ExportedInner<B>>);

impl<B> Clone for ExportedBuffer<B> {
    fn clone(&self) -> Self {
        ExportedBuffer(self.0.clone())
    }
}

impl<B> ExportedBuffer<B> {
    /// Role of the buffer
    pub fn attachment(&self) -> Attachment {
        self.0.attachment
    }

    /// Bytes per row of the pixmap
    pub fn pitch(&self) -> u32 {
        self.0.pitch
    }

    /// Bytes per pixel
    pub fn cpp(&self) -> u32 {
        self.0.format.cpp
    }

    /// Depth of the buffer
    pub fn depth(&self) -> u8 {
        self.0.format.depth
    }

    /// Format as requested by the client
    pub fn format(&self) -> u32 {
        self.0.requested_format
    }

    /// Handle of the buffer object
    pub fn handle(&self) -> &BufferHandle {
        &self.0.handle
    }

    /// Pixmap the buffer refers to
    pub fn pixmap(&self) -> PixmapId {
        self.0.pixmap
    }

    /// Current reference count of the record
    pub fn refcount(&self) -> u32 {
        self.0.refcnt.get()
    }

    /// Payload of the referenced pixmap
    pub fn payload(&self) -> &Rc<GpuPixmap<B>> {
        &self.0.payload
    }
}

/// Buffer lifecycle state of a GPU backend
pub struct GpuContext<G: GpuDevice> {
    device: Rc<G>,
    privates: PixmapPrivates<Rc<GpuPixmap<G::Buffer>>>,
    max_dimension: u32,
    small_pixmap_threshold: u32,
}

impl<G: GpuDevice> fmt::Debug for GpuContext<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuContext")
            .field("key", &self.privates.key())
            .field("buffer_pixmaps", &self.privates.len())
            .field("max_dimension", &self.max_dimension)
            .field("small_pixmap_threshold", &self.small_pixmap_threshold)
            .finish_non_exhaustive()
    }
}

impl<G: GpuDevice> GpuContext<G> {
    pub(crate) fn new(device: Rc<G>, key: PrivateKey, config: &ScreenConfig) -> GpuContext<G> {
        GpuContext {
            device,
            privates: PixmapPrivates::new(key),
            max_dimension: config.max_pixmap_dimension,
            small_pixmap_threshold: config.small_pixmap_threshold,
        }
    }

    /// The GPU device
    pub fn device(&self) -> &G {
        &self.device
    }

    /// Payload attached to a pixmap
    pub fn payload(&self, pixmap: PixmapId) -> Option<&Rc<GpuPixmap<G::Buffer>>> {
        self.privates.get(pixmap)
    }

    /// Number of pixmaps backed by a buffer object
    pub fn buffer_pixmaps(&self) -> usize {
        self.privates.len()
    }

    /// Create a pixmap, backed by a buffer object when possible
    ///
    /// Falls back to a pixmap of the acceleration layer and then to a plain host pixmap.
    /// Returns `None` only for oversized requests or when the host cannot create any pixmap.
    #[instrument(level = "trace", skip(self, host))]
    pub fn create_pixmap<H: Host + ?Sized>(
        &mut self,
        host: &mut H,
        size: Size,
        depth: u8,
        usage: PixmapUsage,
    ) -> Option<PixmapId> {
        if size.w > self.max_dimension || size.h > self.max_dimension {
            debug!(%size, "Refusing oversized pixmap");
            return None;
        }

        let small_glyph = usage == PixmapUsage::GlyphPicture
            && size.w <= self.small_pixmap_threshold
            && size.h <= self.small_pixmap_threshold;
        if depth == 1 || small_glyph {
            return host.create_pixmap(size, depth, usage);
        }

        if check_depth(depth as u32).is_ok() && !size.is_empty() {
            match self.create_gpu_pixmap(host, size, depth, usage) {
                Ok(pixmap) => return Some(pixmap),
                Err(err) => debug!(%size, depth, "Falling back to an accelerated pixmap: {}", err),
            }
        }

        host.create_accelerated_pixmap(size, depth, usage)
            .or_else(|| host.create_pixmap(size, depth, usage))
    }

    fn create_gpu_pixmap<H: Host + ?Sized>(
        &mut self,
        host: &mut H,
        size: Size,
        depth: u8,
        usage: PixmapUsage,
    ) -> Result<PixmapId, BufferError> {
        self.check_dimensions(size)?;

        let pixmap = host
            .create_pixmap(Size::from((0, 0)), depth, usage)
            .ok_or(BufferError::PixmapCreation)?;
        // The bare pixmap is destroyed again if anything below fails
        let mut host = scopeguard::guard(host, |host| {
            host.destroy_pixmap(pixmap);
        });

        let buffer = self
            .device
            .create_buffer(
                size.w,
                size.h,
                Fourcc::Argb8888,
                BufferUsage::RENDERING | BufferUsage::SCANOUT,
            )
            .map_err(|err| BufferError::Allocation(Box::new(err)))?;
        self.attach_buffer(&mut **host, pixmap, buffer)?;

        let _ = scopeguard::ScopeGuard::into_inner(host);
        trace!(?pixmap, %size, depth, "Created buffer backed pixmap");
        Ok(pixmap)
    }

    pub(crate) fn check_dimensions(&self, size: Size) -> Result<(), BufferError> {
        if size.is_empty() || size.w > self.max_dimension || size.h > self.max_dimension {
            return Err(BufferError::InvalidDimensions(size));
        }
        Ok(())
    }

    /// Back `pixmap` with `buffer` and bind a texture to it
    ///
    /// On failure the payload is detached and released again.
    pub(crate) fn attach_buffer<H: Host + ?Sized>(
        &mut self,
        host: &mut H,
        pixmap: PixmapId,
        buffer: G::Buffer,
    ) -> Result<(), BufferError> {
        let size = Size::from(buffer.size());
        let stride = buffer.stride();
        let handle = buffer.handle();

        self.privates.attach(pixmap, GpuPixmap::new(buffer));
        if !host.modify_pixmap_header(pixmap, PixmapHeader::sized(size, stride)) {
            warn!(?pixmap, "Host refused to resize pixmap to its buffer object");
        }

        if !host.bind_texture(pixmap, handle, stride) {
            if let Some(payload) = self.privates.clear(pixmap) {
                payload.release();
            }
            return Err(BufferError::TextureBinding(pixmap));
        }
        Ok(())
    }

    /// Destroy a pixmap
    ///
    /// On the final host reference the texture is released and the pixmap's hold on its
    /// payload dropped, before the host frees the pixmap.
    pub fn destroy_pixmap<H: Host + ?Sized>(&mut self, host: &mut H, pixmap: PixmapId) -> bool {
        if host.pixmap(pixmap).map_or(false, |info| info.refcount == 1) {
            host.release_texture(pixmap);
            if let Some(payload) = self.privates.clear(pixmap) {
                payload.release();
            }
        }
        host.destroy_pixmap(pixmap)
    }

    /// Create a buffer for a client
    ///
    /// Nothing is created for unsupported depths. If the export fails, the reference taken on a
    /// front pixmap is dropped again and a private pixmap is destroyed.
    #[instrument(level = "debug", skip(self, host), err)]
    pub(crate) fn create_buffer<H: Host + ?Sized>(
        &mut self,
        host: &mut H,
        drawable: Drawable,
        attachment: Attachment,
        format: u32,
        kind: ExportKind,
    ) -> Result<ExportedBuffer<G::Buffer>, BufferError> {
        let info = host.drawable(drawable).ok_or(BufferError::NoDrawable)?;
        let buffer_format = BufferFormat::from_request(format, &info)?;

        let pixmap = match attachment {
            Attachment::FrontLeft => {
                let front = host.drawable_pixmap(drawable).ok_or(BufferError::NoDrawable)?;
                if !self.privates.contains(front) {
                    self.adopt_buffer(host, front, buffer_format.depth)?;
                }
                host.reference_pixmap(front);
                front
            }
            Attachment::Other(_) => self
                .create_pixmap(host, info.size(), buffer_format.depth, PixmapUsage::Default)
                .ok_or(BufferError::PixmapCreation)?,
        };

        match self.export_buffer(&*host, pixmap, attachment, buffer_format, format, kind) {
            Ok(buffer) => {
                trace!(?pixmap, ?attachment, "Exported buffer");
                Ok(buffer)
            }
            Err(err) => {
                self.destroy_pixmap(host, pixmap);
                Err(err)
            }
        }
    }

    fn export_buffer<H: PixmapHost + ?Sized>(
        &self,
        host: &H,
        pixmap: PixmapId,
        attachment: Attachment,
        format: BufferFormat,
        requested_format: u32,
        kind: ExportKind,
    ) -> Result<ExportedBuffer<G::Buffer>, BufferError> {
        let payload = self.privates.get(pixmap).cloned().ok_or(BufferError::NoBuffer(pixmap))?;
        let pitch = host.pixmap(pixmap).ok_or(BufferError::NoBuffer(pixmap))?.stride;
        let handle = self.export(pixmap, &payload, kind)?;

        payload.acquire();
        Ok(ExportedBuffer(Rc::new(ExportedInner {
            attachment,
            pitch,
            format,
            requested_format,
            handle,
            pixmap,
            refcnt: Cell::new(1),
            payload,
        })))
    }

    fn export(
        &self,
        pixmap: PixmapId,
        payload: &GpuPixmap<G::Buffer>,
        kind: ExportKind,
    ) -> Result<BufferHandle, BufferError> {
        match kind {
            ExportKind::Name => self.export_name(pixmap, payload).map(BufferHandle::Name),
            ExportKind::Fd => self.export_fd(pixmap, payload).map(BufferHandle::Fd),
        }
    }

    pub(crate) fn export_name(
        &self,
        pixmap: PixmapId,
        payload: &GpuPixmap<G::Buffer>,
    ) -> Result<u32, BufferError> {
        let buffer = payload.buffer.borrow();
        let buffer = buffer.as_ref().ok_or(BufferError::NoBuffer(pixmap))?;
        self.device.export_name(buffer).map_err(|err| {
            error!(?pixmap, "Couldn't flink pixmap handle: {}", err);
            BufferError::NameExport(err)
        })
    }

    pub(crate) fn export_fd(
        &self,
        pixmap: PixmapId,
        payload: &GpuPixmap<G::Buffer>,
    ) -> Result<OwnedFd, BufferError> {
        let buffer = payload.buffer.borrow();
        let buffer = buffer.as_ref().ok_or(BufferError::NoBuffer(pixmap))?;
        buffer.export_fd().map_err(|err| {
            error!(?pixmap, "Couldn't export pixmap buffer descriptor: {}", err);
            BufferError::DescriptorExport(err)
        })
    }

    /// Give a front-buffer pixmap without buffer object a fresh one
    ///
    /// A buffer backed pixmap of the same size and of the buffer's `depth` receives the current
    /// contents, its payload moves onto `front` and the two textures are exchanged before the
    /// temporary pixmap is destroyed.
    fn adopt_buffer<H: Host + ?Sized>(
        &mut self,
        host: &mut H,
        front: PixmapId,
        depth: u8,
    ) -> Result<(), BufferError> {
        let old = host.pixmap(front).ok_or(BufferError::NoDrawable)?;
        let size = old.size();
        let temp = self.create_gpu_pixmap(host, size, depth, PixmapUsage::Default)?;

        let clip = Region::from_rect(Rectangle::from_size(size));
        host.copy_area(CopyArea {
            src: Drawable::Pixmap(front),
            dst: Drawable::Pixmap(temp),
            clip: &clip,
            depth: old.depth,
            src_origin: Point::ORIGIN,
            size,
            dst_origin: Point::ORIGIN,
        });

        let Some(payload) = self.privates.clear(temp) else {
            host.destroy_pixmap(temp);
            return Err(BufferError::NoBuffer(temp));
        };
        host.exchange_textures(front, temp);
        let stride = payload.stride().unwrap_or(old.stride);
        self.privates.attach(front, payload);
        // releases the texture `temp` received in the exchange
        self.destroy_pixmap(host, temp);

        if !host.modify_pixmap_header(front, PixmapHeader::sized(size, stride)) {
            warn!(?front, "Host refused to resize adopted pixmap");
        }
        debug!(?front, "Adopted buffer object for pixmap");
        Ok(())
    }

    /// Take an additional reference on an exported buffer
    pub fn reference_buffer(&self, buffer: &ExportedBuffer<G::Buffer>) -> bool {
        let refcnt = buffer.0.refcnt.get();
        if refcnt == 0 {
            warn!(pixmap = ?buffer.pixmap(), "Attempted to reference a destroyed buffer");
            return false;
        }
        buffer.0.refcnt.set(refcnt + 1);
        true
    }

    /// Drop one reference of an exported buffer
    ///
    /// At zero the payload hold is dropped and the pixmap reference of the buffer destroyed.
    /// Destroying an already destroyed buffer only warns.
    pub fn destroy_buffer<H: Host + ?Sized>(
        &mut self,
        host: &mut H,
        buffer: &ExportedBuffer<G::Buffer>,
    ) -> bool {
        let inner = &buffer.0;
        let refcnt = inner.refcnt.get();
        if refcnt == 0 {
            warn!(
                pixmap = ?inner.pixmap,
                "Attempted to destroy previously destroyed buffer. This is a programming error"
            );
            return false;
        }

        inner.refcnt.set(refcnt - 1);
        if refcnt == 1 {
            inner.payload.release();
            self.destroy_pixmap(host, inner.pixmap);
            trace!(pixmap = ?inner.pixmap, attachment = ?inner.attachment, "Destroyed buffer");
        }
        true
    }

    /// Copy `region` between two exported buffers of `drawable`
    ///
    /// Front buffers stand for the drawable itself. The copy always goes through the host's
    /// generic copy path, covering the whole drawable clipped to `region`.
    #[profiling::function]
    pub fn copy_region<H: PixmapHost + ?Sized>(
        &self,
        host: &mut H,
        drawable: Drawable,
        region: &Region,
        dst: &ExportedBuffer<G::Buffer>,
        src: &ExportedBuffer<G::Buffer>,
    ) -> bool {
        let resolve = |buffer: &ExportedBuffer<G::Buffer>| match buffer.attachment() {
            Attachment::FrontLeft => drawable,
            Attachment::Other(_) => Drawable::Pixmap(buffer.pixmap()),
        };
        let src_drawable = resolve(src);
        let dst_drawable = resolve(dst);

        let (Some(info), Some(dst_info)) = (host.drawable(drawable), host.drawable(dst_drawable)) else {
            warn!(?drawable, "Copy between unknown drawables");
            return false;
        };

        host.copy_area(CopyArea {
            src: src_drawable,
            dst: dst_drawable,
            clip: region,
            depth: dst_info.depth,
            src_origin: Point::ORIGIN,
            size: info.size(),
            dst_origin: Point::ORIGIN,
        })
    }

    /// Drop the hold of every pixmap on its payload
    pub(crate) fn release_all(&mut self) {
        let mut released = 0;
        for (_, payload) in self.privates.drain() {
            if payload.release() {
                released += 1;
            }
        }
        if released > 0 {
            debug!(released, "Released remaining buffer objects");
        }
    }
}
