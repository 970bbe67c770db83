//! Per-OS DRM device numbers and node names

// Character device major of DRM devices, where it is fixed.
#[cfg(target_os = "dragonfly")]
pub const DRM_MAJOR: u32 = 145;

#[cfg(target_os = "netbsd")]
pub const DRM_MAJOR: u32 = 34;

#[cfg(all(target_os = "openbsd", target_arch = "x86"))]
pub const DRM_MAJOR: u32 = 88;

#[cfg(all(target_os = "openbsd", not(target_arch = "x86")))]
pub const DRM_MAJOR: u32 = 87;

#[cfg(not(any(target_os = "dragonfly", target_os = "netbsd", target_os = "openbsd")))]
#[allow(dead_code)] // linux asks sysfs instead
pub const DRM_MAJOR: u32 = 226;

#[cfg(not(target_os = "openbsd"))]
pub const PRIMARY_NAME: &str = "card";
#[cfg(target_os = "openbsd")]
pub const PRIMARY_NAME: &str = "drm";

#[cfg(not(target_os = "openbsd"))]
pub const CONTROL_NAME: &str = "controlD";
#[cfg(target_os = "openbsd")]
pub const CONTROL_NAME: &str = "drmC";

#[cfg(not(target_os = "openbsd"))]
pub const RENDER_NAME: &str = "renderD";
#[cfg(target_os = "openbsd")]
pub const RENDER_NAME: &str = "drmR";
