//! Classification of DRM device nodes
//!
//! The name sharing backend needs clients to authenticate against the device before they may
//! open shared buffers. Render nodes have no authentication handshake, so the backend refuses
//! to run on them.

pub(crate) mod constants;

use constants::*;

use std::{
    fmt::{self, Display, Formatter},
    io,
    os::unix::io::AsFd,
    path::PathBuf,
};

use rustix::fs::{fstat, major, minor, Dev as dev_t, FileType, Stat};

/// A node which refers to a DRM device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DrmNode {
    dev: dev_t,
    ty: NodeType,
}

impl DrmNode {
    /// Creates a DRM node from an open drm device.
    ///
    /// This function does not take ownership of the passed in file descriptor.
    pub fn from_file<A: AsFd>(file: A) -> Result<DrmNode, CreateDrmNodeError> {
        let stat = fstat(file).map_err(Into::<io::Error>::into)?;
        DrmNode::from_stat(stat)
    }

    /// Creates a DRM node from a file stat.
    pub fn from_stat(stat: Stat) -> Result<DrmNode, CreateDrmNodeError> {
        if FileType::from_raw_mode(stat.st_mode) != FileType::CharacterDevice {
            return Err(CreateDrmNodeError::NotDrmNode);
        }
        DrmNode::from_dev_id(stat.st_rdev)
    }

    /// Creates a DRM node from a dev_t
    pub fn from_dev_id(dev: dev_t) -> Result<DrmNode, CreateDrmNodeError> {
        if !is_device_drm(dev) {
            return Err(CreateDrmNodeError::NotDrmNode);
        }
        let ty = NodeType::from_minor(minor(dev)).ok_or(CreateDrmNodeError::NotDrmNode)?;
        Ok(DrmNode { dev, ty })
    }

    /// Returns the type of the DRM node.
    pub fn ty(&self) -> NodeType {
        self.ty
    }

    /// Returns the device_id of the underlying DRM node.
    pub fn dev_id(&self) -> dev_t {
        self.dev
    }

    /// Returns the path of the open device if possible.
    pub fn dev_path(&self) -> Option<PathBuf> {
        dev_path(self.dev, self.ty).ok()
    }
}

impl Display for DrmNode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.ty.minor_name_prefix(), minor(self.dev_id()))
    }
}

/// A type of node
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub enum NodeType {
    /// A primary node may be used to allocate buffers and requires client authentication.
    Primary,

    /// A control node may be used for mode-setting.
    Control,

    /// A render node may be used by a client to allocate buffers, without authentication.
    Render,
}

impl NodeType {
    /// The node type is encoded in the minor number: 0-63 primary, 64-127 control, 128-255 render.
    pub fn from_minor(minor: u32) -> Option<NodeType> {
        match minor {
            0..=63 => Some(NodeType::Primary),
            64..=127 => Some(NodeType::Control),
            128..=255 => Some(NodeType::Render),
            _ => None,
        }
    }

    /// Returns a string representing the prefix of a minor device's name.
    pub fn minor_name_prefix(&self) -> &'static str {
        match self {
            NodeType::Primary => PRIMARY_NAME,
            NodeType::Control => CONTROL_NAME,
            NodeType::Render => RENDER_NAME,
        }
    }

    /// Whether clients of this node go through the authentication handshake
    pub fn requires_authentication(&self) -> bool {
        !matches!(self, NodeType::Render)
    }
}

impl Display for NodeType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NodeType::Primary => "Primary",
            NodeType::Control => "Control",
            NodeType::Render => "Render",
        })
    }
}

/// An error that may occur when creating a DrmNode from a file descriptor.
#[derive(Debug, thiserror::Error)]
pub enum CreateDrmNodeError {
    /// Some underlying IO error occured while trying to create a DRM node.
    #[error("{0}")]
    Io(#[from] io::Error),

    /// The provided file descriptor does not refer to a DRM node.
    #[error("the provided file descriptor does not refer to a DRM node.")]
    NotDrmNode,
}

/// Returns if the given device by major:minor pair is a drm device
#[cfg(target_os = "linux")]
pub fn is_device_drm(dev: dev_t) -> bool {
    let path = format!("/sys/dev/char/{}:{}/device/drm", major(dev), minor(dev));
    rustix::fs::stat(path.as_str()).is_ok()
}

/// Returns if the given device by major:minor pair is a drm device
#[cfg(not(target_os = "linux"))]
pub fn is_device_drm(dev: dev_t) -> bool {
    major(dev) == DRM_MAJOR
}

/// Path of the node of type `ty` belonging to the same device as `dev`.
#[cfg(target_os = "linux")]
fn dev_path(dev: dev_t, ty: NodeType) -> io::Result<PathBuf> {
    use std::fs;
    use std::io::ErrorKind;

    let read = fs::read_dir(format!("/sys/dev/char/{}:{}/device/drm", major(dev), minor(dev)))?;

    for entry in read.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();

        // Only one node of each type exists per device
        if name.starts_with(ty.minor_name_prefix()) {
            let path = [r"/", "dev", "dri", &name].iter().collect::<PathBuf>();
            if path.exists() {
                return Ok(path);
            }
        }
    }

    Err(io::Error::new(
        ErrorKind::NotFound,
        format!(
            "Could not find node of type {} from DRM device {}:{}",
            ty,
            major(dev),
            minor(dev)
        ),
    ))
}

/// Path of the node of type `ty` belonging to the same device as `dev`.
#[cfg(not(target_os = "linux"))]
fn dev_path(dev: dev_t, ty: NodeType) -> io::Result<PathBuf> {
    let base = |ty: NodeType| match ty {
        NodeType::Primary => 0,
        NodeType::Control => 64,
        NodeType::Render => 128,
    };
    let old_id = minor(dev);
    let old_ty = NodeType::from_minor(old_id)
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "not a DRM device"))?;
    let id = old_id - base(old_ty) + base(ty);
    let path = PathBuf::from(format!("/dev/dri/{}{}", ty.minor_name_prefix(), id));
    if path.exists() {
        Ok(path)
    } else {
        Err(io::Error::new(io::ErrorKind::NotFound, "device node not found"))
    }
}
