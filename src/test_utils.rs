//! In-memory host and device used by the unit tests

use std::{
    cell::Cell,
    fs::File,
    io,
    os::unix::io::{AsFd, BorrowedFd, OwnedFd},
    path::PathBuf,
    rc::Rc,
};

use crate::{
    backend::{
        allocator::{Buffer, BufferUsage, Fourcc, GpuDevice},
        gpu::GpuContext,
        node::NodeType,
    },
    config::ScreenConfig,
    host::{
        AccelerationHost, BackingStore, ClientId, CopyArea, Drawable, DrawableInfo, ExtensionHost,
        FdPassingInfo, HostError, ModuleVersion, NameSharingInfo, PixmapHeader, PixmapHost, PixmapId,
        PixmapInfo, PixmapUsage, PresentationHost, ScreenLifecycle, WindowBuffer, WindowId,
    },
    privates::PrivateKey,
    utils::{Region, Size},
};

/// Route tracing output of a test through the test harness
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug)]
pub struct MockPixmap {
    pub info: PixmapInfo,
    pub contents: Vec<u8>,
    pub backing: Option<BackingStore>,
    pub header_changes: usize,
    pub accelerated: bool,
    pub textured: bool,
    pub destroyed: bool,
}

#[derive(Debug)]
pub enum RegisteredBuffer {
    Shm {
        fd: OwnedFd,
        stride: u32,
        size: Size,
        format: Fourcc,
    },
    Name {
        name: u32,
        stride: u32,
        size: Size,
        format: Fourcc,
    },
    Dmabuf {
        fd: OwnedFd,
        stride: u32,
        size: Size,
        format: Fourcc,
    },
}

#[derive(Debug)]
pub struct Registration {
    pub window: WindowId,
    pub pixmap: PixmapId,
    pub buffer: RegisteredBuffer,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CopyRecord {
    pub src: Drawable,
    pub dst: Drawable,
    pub clip: Region,
    pub depth: u8,
    pub size: Size,
}

fn bits_per_pixel(depth: u8) -> u8 {
    match depth {
        1 => 1,
        2..=8 => 8,
        9..=16 => 16,
        _ => 32,
    }
}

/// A host keeping its pixmaps in plain vectors
///
/// Every knob defaults to the happy path, tests flip them to provoke failures.
#[derive(Debug)]
pub struct MockHost {
    pub generation: u32,
    pub pixmaps: Vec<MockPixmap>,
    pub windows: Vec<PixmapId>,

    pub fail_private_registration: bool,
    pub fail_registration: bool,
    pub fail_header_change: bool,
    pub registrations: Vec<Registration>,
    pub copies: Vec<CopyRecord>,
    pub exchanges: Vec<(PixmapId, PixmapId)>,
    pub authenticated: Vec<(ClientId, u32)>,
    pub calls: Vec<&'static str>,

    pub name_sharing: Option<NameSharingInfo>,
    pub name_sharing_ok: bool,
    pub fd_passing_supported: bool,
    pub acceleration_fd_passing: bool,
    pub sync_fences_ok: bool,
    pub sync_fences_active: bool,
    pub fd_passing_ok: bool,
    pub fd_passing_active: bool,

    pub acceleration_version: Option<ModuleVersion>,
    pub acceleration_init_ok: bool,
    pub acceleration_active: bool,
    pub bind_texture_ok: bool,
    pub accelerated_pixmaps_ok: bool,

    pub open_device_ok: bool,
    pub presentation_ok: bool,
}

impl MockHost {
    pub fn new() -> MockHost {
        MockHost {
            generation: 0,
            pixmaps: Vec::new(),
            windows: Vec::new(),
            fail_private_registration: false,
            fail_registration: false,
            fail_header_change: false,
            registrations: Vec::new(),
            copies: Vec::new(),
            exchanges: Vec::new(),
            authenticated: Vec::new(),
            calls: Vec::new(),
            name_sharing: None,
            name_sharing_ok: true,
            fd_passing_supported: true,
            acceleration_fd_passing: true,
            sync_fences_ok: true,
            sync_fences_active: false,
            fd_passing_ok: true,
            fd_passing_active: false,
            acceleration_version: Some(ModuleVersion::new(0, 6, 0)),
            acceleration_init_ok: true,
            acceleration_active: false,
            bind_texture_ok: true,
            accelerated_pixmaps_ok: true,
            open_device_ok: true,
            presentation_ok: true,
        }
    }

    fn new_pixmap(&mut self, size: Size, depth: u8, accelerated: bool) -> PixmapId {
        let bits_per_pixel = bits_per_pixel(depth);
        let stride = (size.w * bits_per_pixel as u32 + 31) / 32 * 4;
        self.pixmaps.push(MockPixmap {
            info: PixmapInfo {
                width: size.w,
                height: size.h,
                depth,
                bits_per_pixel,
                stride,
                refcount: 1,
            },
            contents: vec![0; (stride * size.h) as usize],
            backing: None,
            header_changes: 0,
            accelerated,
            textured: false,
            destroyed: false,
        });
        PixmapId(self.pixmaps.len() as u32)
    }

    fn entry(&self, pixmap: PixmapId) -> Option<&MockPixmap> {
        let index = (pixmap.0 as usize).checked_sub(1)?;
        self.pixmaps.get(index).filter(|p| !p.destroyed)
    }

    fn entry_mut(&mut self, pixmap: PixmapId) -> Option<&mut MockPixmap> {
        let index = (pixmap.0 as usize).checked_sub(1)?;
        self.pixmaps.get_mut(index).filter(|p| !p.destroyed)
    }

    /// A window showing a new plain pixmap
    pub fn add_window(&mut self, size: Size, depth: u8) -> (WindowId, PixmapId) {
        let pixmap = self.new_pixmap(size, depth, false);
        (self.add_window_for(pixmap), pixmap)
    }

    /// A window showing `pixmap`, without taking a reference on it
    pub fn add_window_for(&mut self, pixmap: PixmapId) -> WindowId {
        self.windows.push(pixmap);
        WindowId(self.windows.len() as u32)
    }

    pub fn write_pixels(&mut self, pixmap: PixmapId, pixels: &[u8]) {
        let entry = self.entry_mut(pixmap).unwrap();
        let len = pixels.len().min(entry.contents.len());
        entry.contents[..len].copy_from_slice(&pixels[..len]);
    }

    pub fn header_changes(&self, pixmap: PixmapId) -> usize {
        self.entry(pixmap).map_or(0, |p| p.header_changes)
    }

    pub fn is_destroyed(&self, pixmap: PixmapId) -> bool {
        self.pixmaps
            .get(pixmap.0 as usize - 1)
            .map_or(false, |p| p.destroyed)
    }

    pub fn is_accelerated(&self, pixmap: PixmapId) -> bool {
        self.entry(pixmap).map_or(false, |p| p.accelerated)
    }

    pub fn is_textured(&self, pixmap: PixmapId) -> bool {
        self.entry(pixmap).map_or(false, |p| p.textured)
    }

    /// Number of live pixmaps
    pub fn pixmap_count(&self) -> usize {
        self.pixmaps.iter().filter(|p| !p.destroyed).count()
    }

    pub fn destroyed_count(&self) -> usize {
        self.pixmaps.iter().filter(|p| p.destroyed).count()
    }

    fn window_pixmap(&self, window: WindowId) -> Option<PixmapId> {
        let index = (window.0 as usize).checked_sub(1)?;
        self.windows.get(index).copied()
    }
}

impl PixmapHost for MockHost {
    fn create_pixmap(&mut self, size: Size, depth: u8, _usage: PixmapUsage) -> Option<PixmapId> {
        Some(self.new_pixmap(size, depth, false))
    }

    fn destroy_pixmap(&mut self, pixmap: PixmapId) -> bool {
        let Some(entry) = self.entry_mut(pixmap) else {
            return false;
        };
        entry.info.refcount -= 1;
        if entry.info.refcount == 0 {
            entry.destroyed = true;
            entry.textured = false;
            entry.backing = None;
            entry.contents.clear();
        }
        true
    }

    fn reference_pixmap(&mut self, pixmap: PixmapId) {
        if let Some(entry) = self.entry_mut(pixmap) {
            entry.info.refcount += 1;
        }
    }

    fn pixmap(&self, pixmap: PixmapId) -> Option<PixmapInfo> {
        self.entry(pixmap).map(|p| p.info)
    }

    fn modify_pixmap_header(&mut self, pixmap: PixmapId, header: PixmapHeader) -> bool {
        if self.fail_header_change {
            return false;
        }
        let Some(entry) = self.entry_mut(pixmap) else {
            return false;
        };
        if let Some(size) = header.size {
            entry.info.width = size.w;
            entry.info.height = size.h;
        }
        if let Some(stride) = header.stride {
            entry.info.stride = stride;
        }
        if header.data.is_some() {
            entry.backing = header.data;
        } else {
            let len = (entry.info.stride * entry.info.height) as usize;
            entry.contents.resize(len, 0);
        }
        entry.header_changes += 1;
        true
    }

    fn pixmap_contents(&self, pixmap: PixmapId) -> Option<&[u8]> {
        let entry = self.entry(pixmap)?;
        match entry.backing {
            // the backing store outlives the pixmap's use of it
            Some(backing) => Some(unsafe { std::slice::from_raw_parts(backing.as_ptr(), backing.len()) }),
            None => Some(&entry.contents),
        }
    }

    fn drawable(&self, drawable: Drawable) -> Option<DrawableInfo> {
        let pixmap = self.drawable_pixmap(drawable)?;
        self.pixmap(pixmap).map(DrawableInfo::from)
    }

    fn drawable_pixmap(&self, drawable: Drawable) -> Option<PixmapId> {
        match drawable {
            Drawable::Pixmap(pixmap) => self.entry(pixmap).map(|_| pixmap),
            Drawable::Window(window) => self.window_pixmap(window),
        }
    }

    fn copy_area(&mut self, op: CopyArea<'_>) -> bool {
        self.copies.push(CopyRecord {
            src: op.src,
            dst: op.dst,
            clip: op.clip.clone(),
            depth: op.depth,
            size: op.size,
        });
        true
    }
}

impl PresentationHost for MockHost {
    fn supports_fd_passing(&self) -> bool {
        self.fd_passing_supported
    }

    fn open_client_device(&mut self) -> Result<OwnedFd, HostError> {
        if !self.open_device_ok {
            return Err(HostError::Rejected(String::from("device unavailable")));
        }
        Ok(OwnedFd::from(tempfile::tempfile()?))
    }

    fn authenticate(&mut self, client: ClientId, magic: u32) -> Result<(), HostError> {
        self.authenticated.push((client, magic));
        Ok(())
    }

    fn register_window_buffer(
        &mut self,
        window: WindowId,
        pixmap: PixmapId,
        buffer: WindowBuffer<'_>,
    ) -> Result<(), HostError> {
        if self.fail_registration {
            return Err(HostError::Rejected(String::from("registration refused")));
        }
        let buffer = match buffer {
            WindowBuffer::Shm {
                fd,
                stride,
                size,
                format,
            } => RegisteredBuffer::Shm {
                fd: fd.try_clone_to_owned()?,
                stride,
                size,
                format,
            },
            WindowBuffer::Name {
                name,
                stride,
                size,
                format,
            } => RegisteredBuffer::Name {
                name,
                stride,
                size,
                format,
            },
            WindowBuffer::Dmabuf {
                fd,
                stride,
                size,
                format,
            } => RegisteredBuffer::Dmabuf {
                fd: fd.try_clone_to_owned()?,
                stride,
                size,
                format,
            },
        };
        self.registrations.push(Registration {
            window,
            pixmap,
            buffer,
        });
        Ok(())
    }

    fn init_presentation(&mut self) -> Result<(), HostError> {
        self.calls.push("init_presentation");
        if self.presentation_ok {
            Ok(())
        } else {
            Err(HostError::Rejected(String::from("no compositor")))
        }
    }

    fn post_damage(&mut self) {
        self.calls.push("post_damage");
    }

    fn close_presentation(&mut self) {
        self.calls.push("close_presentation");
    }

    fn destroy_presentation(&mut self) {
        self.calls.push("destroy_presentation");
    }
}

impl ExtensionHost for MockHost {
    fn generation(&self) -> u32 {
        self.generation
    }

    fn register_pixmap_private(&mut self) -> bool {
        !self.fail_private_registration
    }

    fn init_name_sharing(&mut self, info: &NameSharingInfo) -> bool {
        if self.name_sharing_ok {
            self.name_sharing = Some(info.clone());
        }
        self.name_sharing_ok
    }

    fn close_name_sharing(&mut self) {
        self.calls.push("close_name_sharing");
        self.name_sharing = None;
    }

    fn init_sync_fences(&mut self) -> bool {
        self.sync_fences_active = self.sync_fences_ok;
        self.sync_fences_ok
    }

    fn close_sync_fences(&mut self) {
        self.calls.push("close_sync_fences");
        self.sync_fences_active = false;
    }

    fn init_fd_passing(&mut self, _info: &FdPassingInfo) -> bool {
        self.fd_passing_active = self.fd_passing_ok;
        self.fd_passing_ok
    }

    fn close_fd_passing(&mut self) {
        self.calls.push("close_fd_passing");
        self.fd_passing_active = false;
    }
}

impl AccelerationHost for MockHost {
    fn acceleration_version(&self) -> Option<ModuleVersion> {
        self.acceleration_version
    }

    fn init_acceleration(&mut self, _device: BorrowedFd<'_>) -> bool {
        self.acceleration_active = self.acceleration_init_ok;
        self.acceleration_init_ok
    }

    fn acceleration_supports_fd_passing(&self) -> bool {
        self.acceleration_fd_passing
    }

    fn bind_texture(&mut self, pixmap: PixmapId, _handle: u32, _stride: u32) -> bool {
        let ok = self.bind_texture_ok;
        match self.entry_mut(pixmap) {
            Some(entry) if ok => {
                entry.textured = true;
                true
            }
            _ => false,
        }
    }

    fn release_texture(&mut self, pixmap: PixmapId) {
        if let Some(entry) = self.entry_mut(pixmap) {
            entry.textured = false;
        }
    }

    fn exchange_textures(&mut self, front: PixmapId, other: PixmapId) {
        let front_textured = self.is_textured(front);
        let other_textured = self.is_textured(other);
        if let Some(entry) = self.entry_mut(front) {
            entry.textured = other_textured;
        }
        if let Some(entry) = self.entry_mut(other) {
            entry.textured = front_textured;
        }
        self.exchanges.push((front, other));
    }

    fn create_accelerated_pixmap(&mut self, size: Size, depth: u8, _usage: PixmapUsage) -> Option<PixmapId> {
        self.accelerated_pixmaps_ok
            .then(|| self.new_pixmap(size, depth, true))
    }

    fn flush(&mut self) {
        self.calls.push("flush");
    }

    fn close_acceleration(&mut self) {
        self.calls.push("close_acceleration");
        self.acceleration_active = false;
    }
}

impl ScreenLifecycle for MockHost {
    fn create_screen_resources(&mut self) -> bool {
        self.calls.push("create_screen_resources");
        true
    }

    fn block_handler(&mut self) {
        self.calls.push("block_handler");
    }

    fn close_screen(&mut self) -> bool {
        self.calls.push("close_screen");
        true
    }
}

/// Counters and failure switches shared by a [`MockDevice`] and its buffers
#[derive(Debug, Default)]
pub struct MockGpu {
    pub allocated: Cell<u32>,
    pub released: Cell<u32>,
    pub fail_allocation: Cell<bool>,
    pub fail_name_export: Cell<bool>,
    pub fail_fd_export: Cell<bool>,
    pub fail_import: Cell<bool>,
}

fn mock_error(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::Other, msg.to_owned())
}

#[derive(Debug)]
pub struct MockBuffer {
    width: u32,
    height: u32,
    stride: u32,
    format: Fourcc,
    handle: u32,
    state: Rc<MockGpu>,
}

impl Buffer for MockBuffer {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn format(&self) -> Fourcc {
        self.format
    }

    fn stride(&self) -> u32 {
        self.stride
    }

    fn handle(&self) -> u32 {
        self.handle
    }

    fn export_fd(&self) -> io::Result<OwnedFd> {
        if self.state.fail_fd_export.get() {
            return Err(mock_error("prime export failed"));
        }
        tempfile::tempfile().map(OwnedFd::from)
    }
}

impl Drop for MockBuffer {
    fn drop(&mut self) {
        self.state.released.set(self.state.released.get() + 1);
    }
}

#[derive(Debug)]
pub struct MockDevice {
    file: File,
    node_type: Option<NodeType>,
    state: Rc<MockGpu>,
}

impl MockDevice {
    pub fn new(node_type: Option<NodeType>) -> MockDevice {
        MockDevice {
            file: tempfile::tempfile().unwrap(),
            node_type,
            state: Rc::new(MockGpu::default()),
        }
    }

    pub fn primary() -> MockDevice {
        MockDevice::new(Some(NodeType::Primary))
    }

    pub fn render() -> MockDevice {
        MockDevice::new(Some(NodeType::Render))
    }

    pub fn state(&self) -> Rc<MockGpu> {
        self.state.clone()
    }

    fn buffer(&self, width: u32, height: u32, stride: u32, format: Fourcc) -> MockBuffer {
        let handle = self.state.allocated.get() + 1;
        self.state.allocated.set(handle);
        MockBuffer {
            width,
            height,
            stride,
            format,
            handle,
            state: self.state.clone(),
        }
    }
}

impl GpuDevice for MockDevice {
    type Buffer = MockBuffer;
    type Error = io::Error;

    fn device_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }

    fn node_type(&self) -> Option<NodeType> {
        self.node_type
    }

    fn driver_name(&self) -> Option<String> {
        Some(String::from("mock"))
    }

    fn device_path(&self) -> Option<PathBuf> {
        None
    }

    fn create_buffer(
        &self,
        width: u32,
        height: u32,
        format: Fourcc,
        _usage: BufferUsage,
    ) -> Result<MockBuffer, io::Error> {
        if self.state.fail_allocation.get() {
            return Err(mock_error("out of video memory"));
        }
        Ok(self.buffer(width, height, width * 4, format))
    }

    fn import_buffer(
        &self,
        _fd: BorrowedFd<'_>,
        width: u32,
        height: u32,
        stride: u32,
        format: Fourcc,
    ) -> Result<MockBuffer, io::Error> {
        if self.state.fail_import.get() {
            return Err(mock_error("import refused"));
        }
        Ok(self.buffer(width, height, stride, format))
    }

    fn export_name(&self, buffer: &MockBuffer) -> io::Result<u32> {
        if self.state.fail_name_export.get() {
            return Err(mock_error("flink failed"));
        }
        Ok(0x100 + buffer.handle)
    }
}

/// A buffer lifecycle context on a fresh private key
pub fn gpu_context(host: &mut MockHost, device: MockDevice) -> (GpuContext<MockDevice>, Rc<MockGpu>) {
    let key = PrivateKey::register(host).unwrap();
    let state = device.state();
    (GpuContext::new(Rc::new(device), key, &ScreenConfig::default()), state)
}
