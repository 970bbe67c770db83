//! Backend selection at screen setup
//!
//! The backends are tried in order of preference:
//!
//! ```text
//! Unselected -> TryingPrime -> TryingName -> Software -> Committed
//! ```
//!
//! Both GPU backends are skipped when there is no device or the acceleration module is missing
//! or too old. Each attempt reports an [`InitOutcome`]; an attempt that does not succeed leaves
//! nothing registered. Once a backend is committed the choice is final for the lifetime of the
//! screen.

use std::rc::Rc;

use smallvec::SmallVec;
use tracing::{debug, error, info, instrument, trace, warn};

use super::{
    allocator::GpuDevice,
    gpu::{name::NameBackend, prime::PrimeBackend},
    software::SoftwareBackend,
    ActiveBackend, BackendKind,
};
use crate::{config::ScreenConfig, host::Host, privates::PrivateKey};

/// Result of one backend initialization attempt
#[derive(Debug)]
pub enum InitOutcome<B> {
    /// The backend is ready to be committed
    Ready(B),
    /// A required capability is absent
    Unsupported(&'static str),
    /// Setting up the backend failed
    Failed(BackendInitError),
}

/// Hard failures while setting up a GPU backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BackendInitError {
    /// Shared memory sync fences could not be initialized
    #[error("failed to initialize sync fences")]
    SyncFences,
    /// The descriptor passing extension could not be initialized
    #[error("failed to initialize the descriptor passing extension")]
    FdPassing,
    /// The name sharing extension could not be initialized
    #[error("failed to initialize the name sharing extension")]
    NameSharing,
}

/// Selection was attempted with a key of an older screen generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("private key of generation {key} used in generation {current}")]
pub struct StaleKey {
    /// Generation of the key
    pub key: u32,
    /// Current generation of the host
    pub current: u32,
}

/// State of the backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SelectorState {
    /// Nothing attempted yet
    Unselected,
    /// Attempting descriptor passing
    TryingPrime,
    /// Attempting name sharing
    TryingName,
    /// Falling back to shared memory
    Software,
    /// A backend was committed
    Committed(BackendKind),
    /// Selection failed
    Failed,
}

impl SelectorState {
    /// Whether the selection is over
    pub fn is_terminal(&self) -> bool {
        matches!(self, SelectorState::Committed(_) | SelectorState::Failed)
    }

    /// Whether `next` may follow this state
    pub fn can_advance_to(&self, next: SelectorState) -> bool {
        use SelectorState::*;
        matches!(
            (self, next),
            (Unselected, TryingPrime | TryingName | Software | Failed)
                | (TryingPrime, TryingName | Software | Committed(BackendKind::Prime))
                | (TryingName, Software | Committed(BackendKind::Name))
                | (Software, Committed(BackendKind::Software))
        )
    }
}

/// Runs the fallback chain once
#[derive(Debug)]
pub struct Selector {
    state: SelectorState,
    history: SmallVec<[SelectorState; 6]>,
}

impl Default for Selector {
    fn default() -> Self {
        Selector {
            state: SelectorState::Unselected,
            history: SmallVec::new(),
        }
    }
}

impl Selector {
    /// Create a selector in the [`SelectorState::Unselected`] state
    pub fn new() -> Selector {
        Selector::default()
    }

    /// Current state
    pub fn state(&self) -> SelectorState {
        self.state
    }

    /// States passed through so far
    pub fn history(&self) -> &[SelectorState] {
        &self.history
    }

    fn advance(&mut self, next: SelectorState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "invalid selector transition {:?} -> {:?}",
            self.state,
            next
        );
        trace!(from = ?self.state, to = ?next, "Backend selection");
        self.history.push(next);
        self.state = next;
    }

    /// Select and commit a backend
    ///
    /// Only fails for keys of an older screen generation. Otherwise the software backend is
    /// committed at the latest.
    #[instrument(level = "debug", skip_all)]
    pub fn select<H, G>(
        &mut self,
        host: &mut H,
        key: PrivateKey,
        config: &ScreenConfig,
        device: Option<G>,
    ) -> Result<ActiveBackend<G>, StaleKey>
    where
        H: Host + ?Sized,
        G: GpuDevice,
    {
        if !key.is_current(host) {
            self.advance(SelectorState::Failed);
            let err = StaleKey {
                key: key.generation(),
                current: host.generation(),
            };
            error!("Backend selection failed: {}", err);
            return Err(err);
        }

        let device = match device {
            Some(_) if config.force_software => {
                info!("Software backend forced by configuration");
                None
            }
            device => device.map(Rc::new),
        };

        if let Some(device) = device.filter(|device| init_acceleration(host, device.as_ref(), config)) {
            if config.enable_fd_passing {
                self.advance(SelectorState::TryingPrime);
                match PrimeBackend::init(host, &device, key, config) {
                    InitOutcome::Ready(backend) => {
                        self.advance(SelectorState::Committed(BackendKind::Prime));
                        return Ok(ActiveBackend::Prime(backend));
                    }
                    outcome => log_fallback(BackendKind::Prime, &outcome),
                }
            }

            if config.enable_name_sharing {
                self.advance(SelectorState::TryingName);
                match NameBackend::init(host, &device, key, config) {
                    InitOutcome::Ready(backend) => {
                        self.advance(SelectorState::Committed(BackendKind::Name));
                        return Ok(ActiveBackend::Name(backend));
                    }
                    outcome => log_fallback(BackendKind::Name, &outcome),
                }
            }

            // no GPU backend took over the acceleration layer
            host.close_acceleration();
        }

        self.advance(SelectorState::Software);
        info!("Use software acceleration");
        let backend = SoftwareBackend::new(key, config.shm_dir.clone());
        self.advance(SelectorState::Committed(BackendKind::Software));
        Ok(ActiveBackend::Software(backend))
    }
}

fn init_acceleration<H, G>(host: &mut H, device: &G, config: &ScreenConfig) -> bool
where
    H: Host + ?Sized,
    G: GpuDevice,
{
    match host.acceleration_version() {
        None => {
            info!("Acceleration module not loaded");
            false
        }
        Some(version) if version < config.min_acceleration_version => {
            warn!(
                %version,
                required = %config.min_acceleration_version,
                "Acceleration module too old"
            );
            false
        }
        Some(version) => {
            if host.init_acceleration(device.device_fd()) {
                debug!(%version, "Acceleration initialized");
                true
            } else {
                error!("Failed to initialize acceleration");
                false
            }
        }
    }
}

fn log_fallback<B>(kind: BackendKind, outcome: &InitOutcome<B>) {
    match outcome {
        InitOutcome::Unsupported(reason) => info!(backend = %kind, "Backend unavailable: {}", reason),
        InitOutcome::Failed(err) => info!(backend = %kind, "Backend failed to initialize: {}", err),
        InitOutcome::Ready(_) => {}
    }
}
