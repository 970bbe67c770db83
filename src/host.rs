//! Interfaces of the host window system
//!
//! The buffer backends never own pixmaps, windows or clients. Those objects are created and
//! destroyed by the host server, which hands out opaque ids for them and implements the traits
//! of this module so the backends can query and manipulate them.
//!
//! The traits are split by concern:
//!
//! - [`PixmapHost`]: pixmap and drawable lifecycle, geometry and the generic 2D copy path
//! - [`PresentationHost`]: everything talking to the compositor (buffer registration,
//!   authentication, damage posting)
//! - [`ExtensionHost`]: private data registration and the buffer sharing extensions
//! - [`AccelerationHost`]: the optional 2D/3D acceleration layer
//! - [`ScreenLifecycle`]: the host's own implementations of the screen entry points
//!
//! [`Host`] is implemented for every type providing all of them.

use std::{
    fmt,
    os::unix::io::{BorrowedFd, OwnedFd},
    path::PathBuf,
    ptr::NonNull,
};

use crate::backend::allocator::Fourcc;
use crate::utils::{Point, Region, Size};

/// Id of a pixmap owned by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PixmapId(pub u32);

/// Id of a window owned by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WindowId(pub u32);

/// Id of a connected client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(pub u32);

/// A pixel destination: either a pixmap or an on-screen window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Drawable {
    /// An off-screen pixmap
    Pixmap(PixmapId),
    /// An on-screen window
    Window(WindowId),
}

impl From<PixmapId> for Drawable {
    #[inline]
    fn from(id: PixmapId) -> Drawable {
        Drawable::Pixmap(id)
    }
}

impl From<WindowId> for Drawable {
    #[inline]
    fn from(id: WindowId) -> Drawable {
        Drawable::Window(id)
    }
}

/// Geometry and bookkeeping of a host pixmap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixmapInfo {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Color depth
    pub depth: u8,
    /// Storage size of a pixel in bits
    pub bits_per_pixel: u8,
    /// Bytes per row
    pub stride: u32,
    /// The host's own reference count of the pixmap
    pub refcount: u32,
}

impl PixmapInfo {
    /// Storage size of a pixel in bytes
    #[inline]
    pub fn bytes_per_pixel(&self) -> u32 {
        self.bits_per_pixel as u32 / 8
    }

    /// Dimensions of the pixmap
    #[inline]
    pub fn size(&self) -> Size {
        Size {
            w: self.width,
            h: self.height,
        }
    }
}

/// Geometry of a drawable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawableInfo {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Color depth
    pub depth: u8,
    /// Storage size of a pixel in bits
    pub bits_per_pixel: u8,
}

impl DrawableInfo {
    /// Dimensions of the drawable
    #[inline]
    pub fn size(&self) -> Size {
        Size {
            w: self.width,
            h: self.height,
        }
    }
}

impl From<PixmapInfo> for DrawableInfo {
    fn from(info: PixmapInfo) -> DrawableInfo {
        DrawableInfo {
            width: info.width,
            height: info.height,
            depth: info.depth,
            bits_per_pixel: info.bits_per_pixel,
        }
    }
}

/// Purpose of a pixmap creation request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PixmapUsage {
    /// Regular pixmap
    #[default]
    Default,
    /// Pixmap backing a glyph picture
    GlyphPicture,
    /// Backing pixmap of a redirected window
    BackingPixmap,
}

/// A memory region a pixmap can be rebound to
///
/// The region stays valid as long as the backend payload attached to the pixmap is alive,
/// which is until the pixmap's final destruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackingStore {
    ptr: NonNull<u8>,
    len: usize,
}

impl BackingStore {
    pub(crate) fn new(ptr: NonNull<u8>, len: usize) -> BackingStore {
        BackingStore { ptr, len }
    }

    /// Start of the region
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Length of the region in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// Checks if the region is empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Changes to apply to a pixmap header
///
/// Fields left at `None` are not modified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PixmapHeader {
    /// New dimensions
    pub size: Option<Size>,
    /// New number of bytes per row
    pub stride: Option<u32>,
    /// New backing storage for the pixels
    pub data: Option<BackingStore>,
}

impl PixmapHeader {
    /// Header change resizing a pixmap to match a buffer object
    pub fn sized(size: Size, stride: u32) -> PixmapHeader {
        PixmapHeader {
            size: Some(size),
            stride: Some(stride),
            data: None,
        }
    }

    /// Header change rebinding the pixel storage
    pub fn with_data(data: BackingStore) -> PixmapHeader {
        PixmapHeader {
            data: Some(data),
            ..Default::default()
        }
    }
}

/// A copy through a scratch graphics context
#[derive(Debug, Clone, Copy)]
pub struct CopyArea<'a> {
    /// Source drawable
    pub src: Drawable,
    /// Destination drawable
    pub dst: Drawable,
    /// Clip installed on the graphics context
    pub clip: &'a Region,
    /// Depth of the scratch graphics context, the one of the destination
    pub depth: u8,
    /// Origin in the source
    pub src_origin: Point,
    /// Size of the copied area
    pub size: Size,
    /// Origin in the destination
    pub dst_origin: Point,
}

/// A presentable buffer handed to the compositor for a window
#[derive(Debug)]
pub enum WindowBuffer<'a> {
    /// Shared memory region
    Shm {
        /// Descriptor of the region
        fd: BorrowedFd<'a>,
        /// Bytes per row
        stride: u32,
        /// Dimensions
        size: Size,
        /// Pixel format
        format: Fourcc,
    },
    /// GPU buffer shared by global name
    Name {
        /// The global name of the buffer object
        name: u32,
        /// Bytes per row
        stride: u32,
        /// Dimensions
        size: Size,
        /// Pixel format
        format: Fourcc,
    },
    /// GPU buffer shared by descriptor
    Dmabuf {
        /// Descriptor of the buffer object
        fd: BorrowedFd<'a>,
        /// Bytes per row
        stride: u32,
        /// Dimensions
        size: Size,
        /// Pixel format
        format: Fourcc,
    },
}

/// Parameters of the name sharing extension
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameSharingInfo {
    /// Protocol version of the driver interface
    pub version: u32,
    /// Name of the client-side driver
    pub driver_name: String,
    /// Path of the device node clients should open
    pub device_path: Option<PathBuf>,
}

/// Parameters of the descriptor passing extension
///
/// Once initialized, the host routes the extension's open, pixmap-from-descriptor and
/// descriptor-from-pixmap requests to the screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FdPassingInfo {
    /// Protocol version of the driver interface
    pub version: u32,
}

/// Version of a loadable host module
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ModuleVersion {
    /// Major version
    pub major: u32,
    /// Minor version
    pub minor: u32,
    /// Patch level
    pub patch: u32,
}

impl ModuleVersion {
    /// Create a new version number
    pub const fn new(major: u32, minor: u32, patch: u32) -> ModuleVersion {
        ModuleVersion { major, minor, patch }
    }
}

impl fmt::Display for ModuleVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Failures reported by the host
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    /// The host ran out of resources
    #[error("host allocation failed")]
    BadAlloc,
    /// The object is unknown to the host
    #[error("unknown host object")]
    BadMatch,
    /// The compositor refused the request
    #[error("compositor rejected the request: {0}")]
    Rejected(String),
    /// An io error occurred on the host side
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Pixmap and drawable operations of the host
pub trait PixmapHost {
    /// Create a system memory pixmap
    fn create_pixmap(&mut self, size: Size, depth: u8, usage: PixmapUsage) -> Option<PixmapId>;
    /// Drop one reference of a pixmap, freeing it when the count reaches zero
    fn destroy_pixmap(&mut self, pixmap: PixmapId) -> bool;
    /// Take an additional reference on a pixmap
    fn reference_pixmap(&mut self, pixmap: PixmapId);
    /// Query a pixmap
    fn pixmap(&self, pixmap: PixmapId) -> Option<PixmapInfo>;
    /// Modify the header of a pixmap
    fn modify_pixmap_header(&mut self, pixmap: PixmapId, header: PixmapHeader) -> bool;
    /// Current pixel contents of a pixmap, if it lives in memory the host can read
    fn pixmap_contents(&self, pixmap: PixmapId) -> Option<&[u8]>;
    /// Query a drawable
    fn drawable(&self, drawable: Drawable) -> Option<DrawableInfo>;
    /// The pixmap backing a drawable
    fn drawable_pixmap(&self, drawable: Drawable) -> Option<PixmapId>;
    /// Copy an area between two drawables through a clipped scratch graphics context
    fn copy_area(&mut self, op: CopyArea<'_>) -> bool;
}

/// The compositor side of the host
pub trait PresentationHost {
    /// Whether the compositor accepts buffers shared by descriptor
    fn supports_fd_passing(&self) -> bool;
    /// Open a device descriptor for a client
    fn open_client_device(&mut self) -> Result<OwnedFd, HostError>;
    /// Authenticate a client against the device
    fn authenticate(&mut self, client: ClientId, magic: u32) -> Result<(), HostError>;
    /// Attach a presentable buffer to a window
    fn register_window_buffer(
        &mut self,
        window: WindowId,
        pixmap: PixmapId,
        buffer: WindowBuffer<'_>,
    ) -> Result<(), HostError>;
    /// Initialize the presentation layer once screen resources exist
    fn init_presentation(&mut self) -> Result<(), HostError>;
    /// Send pending damage to the compositor
    fn post_damage(&mut self);
    /// Close the presentation layer at screen close
    fn close_presentation(&mut self);
    /// Free the presentation layer
    fn destroy_presentation(&mut self);
}

/// Private data and extension registration of the host
pub trait ExtensionHost {
    /// Current screen generation
    fn generation(&self) -> u32;
    /// Register the pixmap private slot for the current generation
    fn register_pixmap_private(&mut self) -> bool;
    /// Initialize the name sharing extension
    fn init_name_sharing(&mut self, info: &NameSharingInfo) -> bool;
    /// Tear down the name sharing extension
    fn close_name_sharing(&mut self);
    /// Initialize shared memory synchronization fences
    fn init_sync_fences(&mut self) -> bool;
    /// Tear down shared memory synchronization fences
    fn close_sync_fences(&mut self);
    /// Initialize the descriptor passing extension
    fn init_fd_passing(&mut self, info: &FdPassingInfo) -> bool;
    /// Tear down the descriptor passing extension
    fn close_fd_passing(&mut self);
}

/// The host's 2D/3D acceleration layer
pub trait AccelerationHost {
    /// Version of the loaded acceleration module, `None` if it is not loaded
    fn acceleration_version(&self) -> Option<ModuleVersion>;
    /// Initialize the acceleration layer on a device
    fn init_acceleration(&mut self, device: BorrowedFd<'_>) -> bool;
    /// Whether the acceleration layer can export pixmaps by descriptor
    fn acceleration_supports_fd_passing(&self) -> bool;
    /// Bind a texture to the buffer object backing a pixmap
    fn bind_texture(&mut self, pixmap: PixmapId, handle: u32, stride: u32) -> bool;
    /// Release the texture bound to a pixmap
    fn release_texture(&mut self, pixmap: PixmapId);
    /// Swap the textures of two pixmaps
    fn exchange_textures(&mut self, front: PixmapId, other: PixmapId);
    /// Create a pixmap managed by the acceleration layer alone
    fn create_accelerated_pixmap(&mut self, size: Size, depth: u8, usage: PixmapUsage) -> Option<PixmapId>;
    /// Flush pending rendering
    fn flush(&mut self);
    /// Tear down the acceleration layer
    fn close_acceleration(&mut self);
}

/// The host's own implementation of the screen entry points
pub trait ScreenLifecycle {
    /// Create the screen resources
    fn create_screen_resources(&mut self) -> bool;
    /// Called before blocking for client requests
    fn block_handler(&mut self);
    /// Close the screen
    fn close_screen(&mut self) -> bool;
}

/// Everything the buffer backends need from the host
pub trait Host: PixmapHost + PresentationHost + ExtensionHost + AccelerationHost + ScreenLifecycle {}

impl<T> Host for T where
    T: PixmapHost + PresentationHost + ExtensionHost + AccelerationHost + ScreenLifecycle
{
}
