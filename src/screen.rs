//! Per-screen buffer backend context
//!
//! A [`Screen`] is created when the host sets up a screen and lives until the host frees it.
//! It owns the committed backend together with the pixmap payloads, and is passed the host
//! explicitly on every call. There is no global state: two screens never share anything.
//!
//! The host forwards its entry points to the matching methods:
//!
//! - pixmap creation and destruction: [`Screen::create_pixmap`], [`Screen::destroy_pixmap`]
//! - presentable window buffers: [`Screen::create_window_buffer`]
//! - client buffers of the sharing extensions: [`Screen::create_buffer`],
//!   [`Screen::destroy_buffer`], [`Screen::copy_region`], [`Screen::authenticate`]
//! - descriptor passing requests: [`Screen::open_client_device`], [`Screen::fd_from_pixmap`],
//!   [`Screen::pixmap_from_fd`]
//! - the screen lifecycle: [`Screen::create_screen_resources`], [`Screen::block_handler`],
//!   [`Screen::close_screen`], [`Screen::free_screen`]
//!
//! The lifecycle entry points run the host's own implementation inside a [`HookChain`]. The
//! screen registers its bookkeeping there, and further hooks can be added with
//! [`Screen::add_hook`].

use std::{
    fmt,
    os::unix::io::{BorrowedFd, OwnedFd},
};

use tracing::{debug, error, info, instrument, warn};

use crate::{
    backend::{
        allocator::GpuDevice,
        gpu::{prime::PixmapExport, Attachment, BufferError, ExportedBuffer},
        selector::{Selector, SelectorState, StaleKey},
        ActiveBackend, BackendKind,
    },
    config::ScreenConfig,
    host::{ClientId, Drawable, Host, HostError, PixmapId, PixmapUsage, WindowId},
    privates::{PrivateKey, PrivateKeyError},
    utils::{HookChain, HookId, Lifecycle, Region, Size, Stage},
};

/// Errors surfaced to the host
#[derive(Debug, thiserror::Error)]
pub enum ScreenError {
    /// The pixmap private slot could not be registered
    #[error("failed to register the pixmap private slot")]
    BadAlloc(#[from] PrivateKeyError),
    /// The screen belongs to an older generation
    #[error(transparent)]
    StaleGeneration(#[from] StaleKey),
    /// The committed backend does not provide the operation
    #[error("not supported by the {0} backend")]
    NotSupported(BackendKind),
    /// A buffer operation failed
    #[error(transparent)]
    Buffer(#[from] BufferError),
    /// The host failed the request
    #[error(transparent)]
    Host(#[from] HostError),
}

/// State of the committed backend
pub struct BackendState<G: GpuDevice> {
    key: PrivateKey,
    config: ScreenConfig,
    backend: ActiveBackend<G>,
    selection: Vec<SelectorState>,
}

impl<G: GpuDevice> fmt::Debug for BackendState<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendState")
            .field("key", &self.key)
            .field("config", &self.config)
            .field("backend", &self.backend.kind())
            .field("selection", &self.selection)
            .finish()
    }
}

impl<G: GpuDevice> BackendState<G> {
    /// Key of the pixmap private slot
    pub fn key(&self) -> PrivateKey {
        self.key
    }

    /// Configuration the screen was set up with
    pub fn config(&self) -> &ScreenConfig {
        &self.config
    }

    /// The committed backend
    pub fn backend(&self) -> &ActiveBackend<G> {
        &self.backend
    }

    /// Mutable access to the committed backend
    pub fn backend_mut(&mut self) -> &mut ActiveBackend<G> {
        &mut self.backend
    }

    /// Kind of the committed backend
    pub fn kind(&self) -> BackendKind {
        self.backend.kind()
    }

    /// States the selection went through
    pub fn selection(&self) -> &[SelectorState] {
        &self.selection
    }
}

/// Buffer backend context of one host screen
pub struct Screen<H: Host + 'static, G: GpuDevice + 'static> {
    state: BackendState<G>,
    hooks: HookChain<H, BackendState<G>>,
}

impl<H: Host + 'static, G: GpuDevice + 'static> fmt::Debug for Screen<H, G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Screen")
            .field("state", &self.state)
            .field("hooks", &self.hooks)
            .finish()
    }
}

impl<H: Host + 'static, G: GpuDevice + 'static> Screen<H, G> {
    /// Set up the buffer backend of a screen
    ///
    /// Registers the pixmap private slot for the host's current generation and commits to the
    /// first backend that initializes, see [`selector`](crate::backend::selector).
    #[instrument(level = "info", skip_all)]
    pub fn new(host: &mut H, config: ScreenConfig, device: Option<G>) -> Result<Screen<H, G>, ScreenError> {
        let key = PrivateKey::register(host).map_err(|err| {
            error!("{}", err);
            err
        })?;

        let mut selector = Selector::new();
        let backend = selector.select(host, key, &config, device)?;
        info!(
            backend = %backend.kind(),
            generation = key.generation(),
            "Screen buffer backend committed"
        );

        let mut hooks = HookChain::new();
        hooks.add(Lifecycle::CreateScreenResources, Stage::After, |host: &mut H, _| {
            match host.init_presentation() {
                Ok(()) => true,
                Err(err) => {
                    error!("Failed to initialize the presentation layer: {}", err);
                    false
                }
            }
        });
        hooks.add(
            Lifecycle::BlockHandler,
            Stage::After,
            |host: &mut H, state: &mut BackendState<G>| {
                if state.kind().is_accelerated() {
                    host.flush();
                }
                host.post_damage();
                true
            },
        );
        hooks.add(Lifecycle::CloseScreen, Stage::Before, |host: &mut H, _| {
            host.close_presentation();
            true
        });
        hooks.add(
            Lifecycle::FreeScreen,
            Stage::Before,
            |host: &mut H, state: &mut BackendState<G>| {
                state.backend.teardown(host);
                if state.kind().is_accelerated() {
                    host.close_acceleration();
                }
                host.destroy_presentation();
                true
            },
        );

        Ok(Screen {
            state: BackendState {
                key,
                config,
                backend,
                selection: selector.history().to_vec(),
            },
            hooks,
        })
    }

    /// State of the committed backend
    pub fn state(&self) -> &BackendState<G> {
        &self.state
    }

    /// Kind of the committed backend
    pub fn backend_kind(&self) -> BackendKind {
        self.state.kind()
    }

    /// Whether the screen still belongs to the host's current generation
    pub fn is_current(&self, host: &H) -> bool {
        self.state.key.is_current(host)
    }

    /// Register an additional lifecycle hook
    pub fn add_hook<F>(&mut self, lifecycle: Lifecycle, stage: Stage, hook: F) -> HookId
    where
        F: FnMut(&mut H, &mut BackendState<G>) -> bool + 'static,
    {
        self.hooks.add(lifecycle, stage, hook)
    }

    /// Remove a lifecycle hook
    pub fn remove_hook(&mut self, id: HookId) -> bool {
        self.hooks.remove(id)
    }

    /// (Re)establish the presentable buffer of a window
    pub fn create_window_buffer(&mut self, host: &mut H, window: WindowId, pixmap: PixmapId) -> bool {
        self.state.backend.create_window_buffer(host, window, pixmap)
    }

    /// Create a pixmap
    pub fn create_pixmap(
        &mut self,
        host: &mut H,
        size: Size,
        depth: u8,
        usage: PixmapUsage,
    ) -> Option<PixmapId> {
        match self.state.backend.gpu_mut() {
            Some(gpu) => gpu.create_pixmap(host, size, depth, usage),
            None => host.create_pixmap(size, depth, usage),
        }
    }

    /// Destroy a pixmap
    pub fn destroy_pixmap(&mut self, host: &mut H, pixmap: PixmapId) -> bool {
        self.state.backend.destroy_pixmap(host, pixmap)
    }

    /// Create a buffer for a client of the sharing extensions
    pub fn create_buffer(
        &mut self,
        host: &mut H,
        drawable: Drawable,
        attachment: Attachment,
        format: u32,
    ) -> Result<ExportedBuffer<G::Buffer>, ScreenError> {
        let buffer = match &mut self.state.backend {
            ActiveBackend::Prime(backend) => backend.create_buffer(host, drawable, attachment, format)?,
            ActiveBackend::Name(backend) => backend.create_buffer(host, drawable, attachment, format)?,
            ActiveBackend::Software(_) => return Err(ScreenError::NotSupported(BackendKind::Software)),
        };
        Ok(buffer)
    }

    /// Drop one reference of a client buffer
    pub fn destroy_buffer(&mut self, host: &mut H, buffer: &ExportedBuffer<G::Buffer>) -> bool {
        match self.state.backend.gpu_mut() {
            Some(gpu) => gpu.destroy_buffer(host, buffer),
            None => {
                warn!("Buffer destroyed on a screen without GPU backend");
                false
            }
        }
    }

    /// Take an additional reference on a client buffer
    pub fn reference_buffer(&self, buffer: &ExportedBuffer<G::Buffer>) -> bool {
        self.state
            .backend
            .gpu()
            .map_or(false, |gpu| gpu.reference_buffer(buffer))
    }

    /// Copy a region between two client buffers of a drawable
    pub fn copy_region(
        &self,
        host: &mut H,
        drawable: Drawable,
        region: &Region,
        dst: &ExportedBuffer<G::Buffer>,
        src: &ExportedBuffer<G::Buffer>,
    ) -> bool {
        self.state
            .backend
            .gpu()
            .map_or(false, |gpu| gpu.copy_region(host, drawable, region, dst, src))
    }

    /// Authenticate a client of the name sharing extension
    pub fn authenticate(&self, host: &mut H, client: ClientId, magic: u32) -> Result<(), ScreenError> {
        match &self.state.backend {
            ActiveBackend::Name(backend) => Ok(backend.authenticate(host, client, magic)?),
            ActiveBackend::Prime(backend) if backend.has_name_sharing() => {
                Ok(backend.authenticate(host, client, magic)?)
            }
            backend => Err(ScreenError::NotSupported(backend.kind())),
        }
    }

    /// Open the device for a client of the descriptor passing extension
    pub fn open_client_device(&self, host: &mut H) -> Result<OwnedFd, ScreenError> {
        match &self.state.backend {
            ActiveBackend::Prime(backend) => Ok(backend.open_client_device(host)?),
            backend => Err(ScreenError::NotSupported(backend.kind())),
        }
    }

    /// Export a pixmap as a descriptor
    pub fn fd_from_pixmap(&self, pixmap: PixmapId) -> Result<PixmapExport, ScreenError> {
        match &self.state.backend {
            ActiveBackend::Prime(backend) => Ok(backend.fd_from_pixmap(pixmap)?),
            backend => Err(ScreenError::NotSupported(backend.kind())),
        }
    }

    /// Import a client descriptor as a new pixmap
    pub fn pixmap_from_fd(
        &mut self,
        host: &mut H,
        fd: BorrowedFd<'_>,
        size: Size,
        stride: u32,
        depth: u8,
    ) -> Result<PixmapId, ScreenError> {
        match &mut self.state.backend {
            ActiveBackend::Prime(backend) => Ok(backend.pixmap_from_fd(host, fd, size, stride, depth)?),
            backend => Err(ScreenError::NotSupported(backend.kind())),
        }
    }

    /// Create the screen resources, then set up the presentation layer
    pub fn create_screen_resources(&mut self, host: &mut H) -> bool {
        self.hooks.run(
            Lifecycle::CreateScreenResources,
            host,
            &mut self.state,
            |host, _| host.create_screen_resources(),
        )
    }

    /// Run the host's block handler, then flush rendering and post damage
    #[profiling::function]
    pub fn block_handler(&mut self, host: &mut H) {
        self.hooks.run(Lifecycle::BlockHandler, host, &mut self.state, |host, _| {
            host.block_handler();
            true
        });
    }

    /// Close the presentation layer, then the host screen
    pub fn close_screen(&mut self, host: &mut H) -> bool {
        self.hooks
            .run(Lifecycle::CloseScreen, host, &mut self.state, |host, _| host.close_screen())
    }

    /// Release the backend together with every remaining payload
    pub fn free_screen(mut self, host: &mut H) -> bool {
        let kind = self.state.kind();
        let freed = self
            .hooks
            .run(Lifecycle::FreeScreen, host, &mut self.state, |_, _| true);
        debug!(backend = %kind, "Screen freed");
        freed
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use super::{Screen, ScreenError};
    use crate::{
        backend::{gpu::Attachment, node::NodeType, BackendKind},
        config::ScreenConfig,
        host::{ClientId, PixmapHost, PixmapUsage},
        test_utils::{init_logging, MockDevice, MockHost},
        utils::{Lifecycle, Size, Stage},
    };

    type TestScreen = Screen<MockHost, MockDevice>;

    fn software_config() -> ScreenConfig {
        ScreenConfig {
            shm_dir: std::env::temp_dir(),
            ..ScreenConfig::default()
        }
    }

    fn hosts() -> Vec<(MockHost, BackendKind)> {
        let prime = MockHost::new();
        let mut name = MockHost::new();
        name.fd_passing_supported = false;
        let mut software = MockHost::new();
        software.acceleration_version = None;
        vec![
            (prime, BackendKind::Prime),
            (name, BackendKind::Name),
            (software, BackendKind::Software),
        ]
    }

    #[test]
    fn private_registration_failure_is_fatal() {
        let mut host = MockHost::new();
        host.fail_private_registration = true;
        let err =
            TestScreen::new(&mut host, ScreenConfig::default(), Some(MockDevice::primary())).unwrap_err();
        assert!(matches!(err, ScreenError::BadAlloc(_)));
        assert!(!host.acceleration_active);
    }

    #[test]
    fn screen_setup_always_succeeds() {
        init_logging();
        for (mut host, expected) in hosts() {
            let screen = TestScreen::new(&mut host, software_config(), Some(MockDevice::primary())).unwrap();
            assert_eq!(screen.backend_kind(), expected);
            assert!(screen.is_current(&host));
        }

        let mut host = MockHost::new();
        host.acceleration_version = None;
        let screen = TestScreen::new(&mut host, software_config(), None).unwrap();
        assert_eq!(screen.backend_kind(), BackendKind::Software);
    }

    #[test]
    fn unsupported_depths_fail_on_every_backend() {
        for (mut host, kind) in hosts() {
            let mut screen =
                TestScreen::new(&mut host, software_config(), Some(MockDevice::primary())).unwrap();
            let (window, pixmap) = host.add_window(Size::from((16, 16)), 16);
            let pixmaps = host.pixmap_count();

            assert!(!screen.create_window_buffer(&mut host, window, pixmap), "{}", kind);
            assert!(host.registrations.is_empty());
            assert_eq!(host.header_changes(pixmap), 0);

            for format in [0, 8, 16, 30] {
                assert!(screen
                    .create_buffer(&mut host, window.into(), Attachment::Other(1), format)
                    .is_err());
            }
            assert_eq!(host.pixmap_count(), pixmaps);
            if let Some(gpu) = screen.state().backend().gpu() {
                assert_eq!(gpu.buffer_pixmaps(), 0);
            }
        }
    }

    #[test]
    fn window_buffers_on_every_backend() {
        for (mut host, kind) in hosts() {
            let mut screen =
                TestScreen::new(&mut host, software_config(), Some(MockDevice::primary())).unwrap();
            let pixmap = screen
                .create_pixmap(&mut host, Size::from((16, 16)), 24, PixmapUsage::BackingPixmap)
                .unwrap();
            let window = host.add_window_for(pixmap);
            assert!(screen.create_window_buffer(&mut host, window, pixmap), "{}", kind);
            assert_eq!(host.registrations.len(), 1);
        }
    }

    #[test]
    fn buffer_object_outlives_the_window_pixmap() {
        let mut host = MockHost::new();
        host.fd_passing_supported = false;
        let device = MockDevice::primary();
        let state = device.state();
        let mut screen = TestScreen::new(&mut host, ScreenConfig::default(), Some(device)).unwrap();
        assert_eq!(screen.backend_kind(), BackendKind::Name);

        let pixmap = screen
            .create_pixmap(&mut host, Size::from((32, 32)), 32, PixmapUsage::BackingPixmap)
            .unwrap();
        let window = host.add_window_for(pixmap);
        let front = screen
            .create_buffer(&mut host, window.into(), Attachment::FrontLeft, 0)
            .unwrap();
        let back = screen
            .create_buffer(&mut host, window.into(), Attachment::Other(1), 0)
            .unwrap();
        assert_eq!(host.pixmap(pixmap).unwrap().refcount, 2);

        assert!(screen.destroy_pixmap(&mut host, pixmap));
        assert!(screen.destroy_buffer(&mut host, &back));
        assert_eq!(state.released.get(), 1);
        assert!(!host.is_destroyed(pixmap));

        assert!(screen.destroy_buffer(&mut host, &front));
        assert_eq!(state.released.get(), 2);
        assert!(host.is_destroyed(pixmap));

        assert!(!screen.destroy_buffer(&mut host, &front));
        assert_eq!(state.released.get(), 2);
    }

    #[test]
    fn extension_requests_need_the_right_backend() {
        let mut host = MockHost::new();
        host.fd_passing_supported = false;
        let mut screen =
            TestScreen::new(&mut host, ScreenConfig::default(), Some(MockDevice::primary())).unwrap();
        assert!(matches!(
            screen.open_client_device(&mut host),
            Err(ScreenError::NotSupported(BackendKind::Name))
        ));
        assert!(screen.authenticate(&mut host, ClientId(1), 7).is_ok());

        let fd = tempfile::tempfile().unwrap();
        assert!(matches!(
            screen.pixmap_from_fd(&mut host, std::os::unix::io::AsFd::as_fd(&fd), Size::from((4, 4)), 16, 24),
            Err(ScreenError::NotSupported(BackendKind::Name))
        ));

        let mut host = MockHost::new();
        host.acceleration_version = None;
        let mut screen = TestScreen::new(&mut host, software_config(), None).unwrap();
        assert!(matches!(
            screen.authenticate(&mut host, ClientId(1), 7),
            Err(ScreenError::NotSupported(BackendKind::Software))
        ));
        let (window, _) = host.add_window(Size::from((4, 4)), 24);
        assert!(matches!(
            screen.create_buffer(&mut host, window.into(), Attachment::FrontLeft, 0),
            Err(ScreenError::NotSupported(BackendKind::Software))
        ));
    }

    #[test]
    fn descriptor_requests_on_the_prime_backend() {
        let mut host = MockHost::new();
        let mut screen =
            TestScreen::new(&mut host, ScreenConfig::default(), Some(MockDevice::render())).unwrap();
        assert_eq!(screen.backend_kind(), BackendKind::Prime);
        assert!(screen.open_client_device(&mut host).is_ok());

        let pixmap = screen
            .create_pixmap(&mut host, Size::from((8, 8)), 32, PixmapUsage::Default)
            .unwrap();
        let export = screen.fd_from_pixmap(pixmap).unwrap();
        let imported = screen
            .pixmap_from_fd(
                &mut host,
                std::os::unix::io::AsFd::as_fd(&export.fd),
                Size::from((8, 8)),
                export.stride,
                32,
            )
            .unwrap();
        assert!(screen.state().backend().gpu().unwrap().payload(imported).is_some());
    }

    #[test]
    fn lifecycle_runs_through_the_hooks() {
        let mut host = MockHost::new();
        let mut screen =
            TestScreen::new(&mut host, ScreenConfig::default(), Some(MockDevice::render())).unwrap();
        host.calls.clear();

        assert!(screen.create_screen_resources(&mut host));
        assert_eq!(host.calls, ["create_screen_resources", "init_presentation"]);

        host.calls.clear();
        screen.block_handler(&mut host);
        assert_eq!(host.calls, ["block_handler", "flush", "post_damage"]);

        host.calls.clear();
        assert!(screen.close_screen(&mut host));
        assert_eq!(host.calls, ["close_presentation", "close_screen"]);

        host.calls.clear();
        assert!(screen.free_screen(&mut host));
        assert_eq!(
            host.calls,
            [
                "close_name_sharing",
                "close_fd_passing",
                "close_sync_fences",
                "close_acceleration",
                "destroy_presentation"
            ]
        );
    }

    #[test]
    fn software_screens_do_not_flush() {
        let mut host = MockHost::new();
        host.acceleration_version = None;
        let mut screen = TestScreen::new(&mut host, software_config(), None).unwrap();
        host.calls.clear();
        screen.block_handler(&mut host);
        assert_eq!(host.calls, ["block_handler", "post_damage"]);
    }

    #[test]
    fn failing_presentation_fails_resource_creation() {
        let mut host = MockHost::new();
        let mut screen =
            TestScreen::new(&mut host, ScreenConfig::default(), Some(MockDevice::render())).unwrap();
        host.presentation_ok = false;
        assert!(!screen.create_screen_resources(&mut host));
    }

    #[test]
    fn additional_hooks_wrap_the_host() {
        let mut host = MockHost::new();
        let mut screen =
            TestScreen::new(&mut host, ScreenConfig::default(), Some(MockDevice::render())).unwrap();
        let seen = Rc::new(RefCell::new(Vec::new()));

        let before = seen.clone();
        let id = screen.add_hook(Lifecycle::CloseScreen, Stage::Before, move |_, state| {
            before.borrow_mut().push(state.kind());
            true
        });
        assert!(screen.close_screen(&mut host));
        assert_eq!(*seen.borrow(), [BackendKind::Prime]);

        assert!(screen.remove_hook(id));
        assert!(screen.close_screen(&mut host));
        assert_eq!(seen.borrow().len(), 1);

        screen.add_hook(Lifecycle::CloseScreen, Stage::Before, |_, _| false);
        host.calls.clear();
        assert!(!screen.close_screen(&mut host));
        assert!(!host.calls.contains(&"close_screen"));
    }

    #[test]
    fn freeing_releases_remaining_buffer_objects() {
        let mut host = MockHost::new();
        let device = MockDevice::new(Some(NodeType::Primary));
        let state = device.state();
        let mut screen = TestScreen::new(&mut host, ScreenConfig::default(), Some(device)).unwrap();
        screen
            .create_pixmap(&mut host, Size::from((8, 8)), 24, PixmapUsage::Default)
            .unwrap();
        screen
            .create_pixmap(&mut host, Size::from((8, 8)), 32, PixmapUsage::Default)
            .unwrap();

        assert!(screen.free_screen(&mut host));
        assert_eq!(state.released.get(), 2);
        assert!(!host.acceleration_active);
        assert!(!host.fd_passing_active);
    }
}
