//! Ordered decorator chains around host lifecycle entry points
//!
//! A host screen exposes a handful of entry points (resource creation, the block handler,
//! close and free). Instead of swapping the host's function pointers and restoring them from
//! inside the wrapper, every participant registers a hook that runs either before or after
//! the host's own implementation. Hooks run in registration order and can be removed again
//! through the [`HookId`] returned on registration.

use indexmap::IndexMap;
use std::fmt;

/// Unique hook identifier used to unregister lifecycle hooks
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct HookId(usize);

/// Host entry points a hook can be attached to
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Lifecycle {
    /// The host creates its screen resources (screen pixmap etc.)
    CreateScreenResources,
    /// The host is about to block waiting for clients
    BlockHandler,
    /// The screen is being closed
    CloseScreen,
    /// The screen private data is being freed
    FreeScreen,
}

/// Position of a hook relative to the host implementation
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Stage {
    /// Runs before the host implementation
    Before,
    /// Runs after the host implementation succeeded
    After,
}

type HookFn<H, S> = dyn FnMut(&mut H, &mut S) -> bool;

pub(crate) struct Hook<H: ?Sized, S> {
    pub lifecycle: Lifecycle,
    pub stage: Stage,
    pub cb: Box<HookFn<H, S>>,
}

impl<H: ?Sized, S> fmt::Debug for Hook<H, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hook")
            .field("lifecycle", &self.lifecycle)
            .field("stage", &self.stage)
            .finish_non_exhaustive()
    }
}

/// An ordered list of hooks wrapped around the host lifecycle calls
///
/// `H` is the host type the hooks are handed, `S` the state they operate on.
pub struct HookChain<H: ?Sized, S> {
    next_id: usize,
    hooks: IndexMap<HookId, Hook<H, S>>,
}

impl<H: ?Sized, S> fmt::Debug for HookChain<H, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookChain").field("hooks", &self.hooks).finish()
    }
}

impl<H: ?Sized, S> Default for HookChain<H, S> {
    fn default() -> Self {
        HookChain {
            next_id: 0,
            hooks: IndexMap::new(),
        }
    }
}

impl<H: ?Sized, S> HookChain<H, S> {
    /// Create an empty chain
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new hook
    ///
    /// A hook returning `false` aborts the chain and makes the whole call fail.
    /// For entry points without a result (like the block handler) the return value is ignored.
    pub fn add<F>(&mut self, lifecycle: Lifecycle, stage: Stage, cb: F) -> HookId
    where
        F: FnMut(&mut H, &mut S) -> bool + 'static,
    {
        let id = HookId(self.next_id);
        self.next_id += 1;
        self.hooks.insert(
            id,
            Hook {
                lifecycle,
                stage,
                cb: Box::new(cb),
            },
        );
        id
    }

    /// Unregister a hook, returns `false` if it was not registered
    pub fn remove(&mut self, id: HookId) -> bool {
        self.hooks.shift_remove(&id).is_some()
    }

    /// Number of hooks registered for an entry point
    pub fn count(&self, lifecycle: Lifecycle) -> usize {
        self.hooks.values().filter(|h| h.lifecycle == lifecycle).count()
    }

    fn run_stage(&mut self, lifecycle: Lifecycle, stage: Stage, host: &mut H, state: &mut S) -> bool {
        self.hooks
            .values_mut()
            .filter(|h| h.lifecycle == lifecycle && h.stage == stage)
            .all(|hook| (hook.cb)(host, state))
    }

    /// Run the chain around `original`
    ///
    /// Before-hooks run first, then `original`, then the after-hooks.
    /// Returns `false` as soon as one of them fails.
    pub fn run<F>(&mut self, lifecycle: Lifecycle, host: &mut H, state: &mut S, original: F) -> bool
    where
        F: FnOnce(&mut H, &mut S) -> bool,
    {
        if !self.run_stage(lifecycle, Stage::Before, host, state) {
            return false;
        }
        if !original(host, state) {
            return false;
        }
        self.run_stage(lifecycle, Stage::After, host, state)
    }
}
