//! Screen configuration
//!
//! [`ScreenConfig::default`] matches what a host expects out of the box. A few knobs can be
//! overridden through the environment, which is handy to force a fallback path when debugging
//! a driver stack:
//!
//! - `WLPIXMAP_FORCE_SOFTWARE`: skip both GPU backends
//! - `WLPIXMAP_DISABLE_FD_PASSING`: never try descriptor passing
//! - `WLPIXMAP_DISABLE_NAME_SHARING`: never try name sharing
//! - `WLPIXMAP_SHM_DIR`: directory used for shared memory files

use std::{env, path::PathBuf};

use tracing::info;

use crate::host::ModuleVersion;

/// Configuration of a screen's buffer backends
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScreenConfig {
    /// Directory shared memory files are created in
    pub shm_dir: PathBuf,
    /// Allow the descriptor passing backend
    pub enable_fd_passing: bool,
    /// Allow the name sharing backend
    pub enable_name_sharing: bool,
    /// Skip the GPU backends altogether
    pub force_software: bool,
    /// Oldest acceleration module that is accepted
    pub min_acceleration_version: ModuleVersion,
    /// Largest width or height of a GPU backed pixmap
    pub max_pixmap_dimension: u32,
    /// Glyph pixmaps up to this size stay in system memory
    pub small_pixmap_threshold: u32,
}

impl Default for ScreenConfig {
    fn default() -> Self {
        ScreenConfig {
            shm_dir: env::temp_dir(),
            enable_fd_passing: true,
            enable_name_sharing: true,
            force_software: false,
            min_acceleration_version: ModuleVersion::new(0, 5, 1),
            max_pixmap_dimension: 32767,
            small_pixmap_threshold: 32,
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    env::var(name).ok().map(|x| {
        let x = x.to_lowercase();
        x == "1" || x == "true" || x == "yes" || x == "y"
    })
}

impl ScreenConfig {
    /// Default configuration with environment overrides applied
    pub fn from_env() -> Self {
        ScreenConfig::default().with_env_overrides()
    }

    /// Apply environment overrides on top of this configuration
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(force) = env_flag("WLPIXMAP_FORCE_SOFTWARE") {
            if force {
                info!("WLPIXMAP_FORCE_SOFTWARE is set. Forcing the software backend.");
            }
            self.force_software = force;
        }
        if let Some(true) = env_flag("WLPIXMAP_DISABLE_FD_PASSING") {
            info!("WLPIXMAP_DISABLE_FD_PASSING is set. Descriptor passing disabled.");
            self.enable_fd_passing = false;
        }
        if let Some(true) = env_flag("WLPIXMAP_DISABLE_NAME_SHARING") {
            info!("WLPIXMAP_DISABLE_NAME_SHARING is set. Name sharing disabled.");
            self.enable_name_sharing = false;
        }
        if let Some(dir) = env::var_os("WLPIXMAP_SHM_DIR") {
            self.shm_dir = PathBuf::from(dir);
        }
        self
    }
}
