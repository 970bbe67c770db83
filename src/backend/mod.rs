//! Buffer backends
//!
//! A pixmap shown in a window needs a buffer the compositor can read. Three interchangeable
//! backends provide one:
//!
//! - [`PrimeBackend`](gpu::prime::PrimeBackend) backs pixmaps with GPU buffer objects shared by
//!   file descriptor
//! - [`NameBackend`](gpu::name::NameBackend) backs pixmaps with GPU buffer objects shared by
//!   global name, which requires clients to authenticate against the device
//! - [`SoftwareBackend`](software::SoftwareBackend) backs pixmaps with anonymous shared memory
//!   and is always available
//!
//! The [`selector`] tries them in that order when a screen is set up and commits to the first
//! one that initializes. The committed backend is held as an [`ActiveBackend`] for the lifetime
//! of the screen.
//!
//! Supporting modules:
//!
//! - [`allocator`]: GPU devices and their buffer objects
//! - [`node`]: classification of DRM device nodes
//! - [`shm`]: anonymous shared memory regions

use std::fmt;

use tracing::error;

use crate::host::{Host, PixmapId, WindowId};

pub mod allocator;
pub mod gpu;
pub mod node;
pub mod selector;
pub mod shm;
pub mod software;

use allocator::{Fourcc, GpuDevice};
use gpu::{name::NameBackend, prime::PrimeBackend, GpuContext};
use software::SoftwareBackend;

/// Buffers can only be shared for these depths
pub const SUPPORTED_DEPTHS: [u32; 2] = [24, 32];

/// A buffer of an unsupported depth was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("unsupported depth {0}, only depths 24 and 32 can be shared")]
pub struct UnsupportedDepth(pub u32);

/// Checks that a depth can be shared with the compositor
#[inline]
pub fn check_depth(depth: u32) -> Result<u8, UnsupportedDepth> {
    match depth {
        24 => Ok(24),
        32 => Ok(32),
        _ => Err(UnsupportedDepth(depth)),
    }
}

/// Pixel format used to present a pixmap of a supported depth
pub fn presentation_format(depth: u8) -> Fourcc {
    if depth == 32 {
        Fourcc::Argb8888
    } else {
        Fourcc::Xrgb8888
    }
}

/// Kind of a committed backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// GPU buffers shared by file descriptor
    Prime,
    /// GPU buffers shared by global name
    Name,
    /// Shared memory
    Software,
}

impl BackendKind {
    /// Whether pixmaps are backed by GPU buffer objects
    pub fn is_accelerated(&self) -> bool {
        !matches!(self, BackendKind::Software)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackendKind::Prime => "descriptor passing",
            BackendKind::Name => "name sharing",
            BackendKind::Software => "software",
        })
    }
}

/// The backend a screen committed to
#[derive(Debug)]
pub enum ActiveBackend<G: GpuDevice> {
    /// Descriptor passing
    Prime(PrimeBackend<G>),
    /// Name sharing
    Name(NameBackend<G>),
    /// Shared memory
    Software(SoftwareBackend),
}

impl<G: GpuDevice> ActiveBackend<G> {
    /// Kind of the backend
    pub fn kind(&self) -> BackendKind {
        match self {
            ActiveBackend::Prime(_) => BackendKind::Prime,
            ActiveBackend::Name(_) => BackendKind::Name,
            ActiveBackend::Software(_) => BackendKind::Software,
        }
    }

    /// Buffer lifecycle state of the GPU backends
    pub fn gpu(&self) -> Option<&GpuContext<G>> {
        match self {
            ActiveBackend::Prime(backend) => Some(backend.gpu()),
            ActiveBackend::Name(backend) => Some(backend.gpu()),
            ActiveBackend::Software(_) => None,
        }
    }

    /// Mutable buffer lifecycle state of the GPU backends
    pub fn gpu_mut(&mut self) -> Option<&mut GpuContext<G>> {
        match self {
            ActiveBackend::Prime(backend) => Some(backend.gpu_mut()),
            ActiveBackend::Name(backend) => Some(backend.gpu_mut()),
            ActiveBackend::Software(_) => None,
        }
    }

    /// (Re)establish the presentable buffer of a window
    pub fn create_window_buffer<H: Host + ?Sized>(
        &mut self,
        host: &mut H,
        window: WindowId,
        pixmap: PixmapId,
    ) -> bool {
        let result = match self {
            ActiveBackend::Prime(backend) => backend
                .create_window_buffer(host, window, pixmap)
                .map_err(|err| Box::new(err) as Box<dyn std::error::Error>),
            ActiveBackend::Name(backend) => backend
                .create_window_buffer(host, window, pixmap)
                .map_err(|err| Box::new(err) as Box<dyn std::error::Error>),
            ActiveBackend::Software(backend) => backend
                .create_window_buffer(host, window, pixmap)
                .map_err(|err| Box::new(err) as Box<dyn std::error::Error>),
        };
        match result {
            Ok(()) => true,
            Err(err) => {
                error!(?window, ?pixmap, backend = %self.kind(), "Failed to create window buffer: {}", err);
                false
            }
        }
    }

    /// Destroy a pixmap, releasing the backend payload on its final reference
    pub fn destroy_pixmap<H: Host + ?Sized>(&mut self, host: &mut H, pixmap: PixmapId) -> bool {
        match self {
            ActiveBackend::Software(backend) => backend.destroy_pixmap(host, pixmap),
            ActiveBackend::Prime(backend) => backend.gpu_mut().destroy_pixmap(host, pixmap),
            ActiveBackend::Name(backend) => backend.gpu_mut().destroy_pixmap(host, pixmap),
        }
    }

    /// Tear down the extensions and payloads of the backend
    pub fn teardown<H: Host + ?Sized>(&mut self, host: &mut H) {
        match self {
            ActiveBackend::Prime(backend) => backend.teardown(host),
            ActiveBackend::Name(backend) => backend.teardown(host),
            ActiveBackend::Software(backend) => backend.teardown(),
        }
    }
}
