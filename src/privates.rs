//! Per-pixmap private payloads
//!
//! Backends attach their own payload (a shared memory mapping or a GPU buffer object) to the
//! host pixmaps they manage. The slot is registered with the host once per screen generation;
//! failing to register it is fatal to the screen setup.

use std::collections::HashMap;

use tracing::{debug, trace};

use crate::host::{ExtensionHost, PixmapId};

/// Registered private slot, valid for one screen generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrivateKey {
    generation: u32,
}

/// The host refused to register the pixmap private slot
#[derive(Debug, thiserror::Error)]
#[error("failed to register the pixmap private slot for generation {generation}")]
pub struct PrivateKeyError {
    /// Generation the registration was attempted for
    pub generation: u32,
}

impl PrivateKey {
    /// Register the pixmap private slot with the host
    pub fn register<H: ExtensionHost + ?Sized>(host: &mut H) -> Result<PrivateKey, PrivateKeyError> {
        let generation = host.generation();
        if !host.register_pixmap_private() {
            return Err(PrivateKeyError { generation });
        }
        debug!(generation, "Registered pixmap private slot");
        Ok(PrivateKey { generation })
    }

    /// Generation this key was registered for
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Whether the key still belongs to the host's current generation
    pub fn is_current<H: ExtensionHost + ?Sized>(&self, host: &H) -> bool {
        host.generation() == self.generation
    }
}

/// Payloads attached to pixmaps through a [`PrivateKey`]
///
/// The store only holds the association. [`clear`](PixmapPrivates::clear) hands the payload
/// back to the caller, who is responsible for releasing it.
#[derive(Debug)]
pub struct PixmapPrivates<T> {
    key: PrivateKey,
    slots: HashMap<PixmapId, T>,
}

impl<T> PixmapPrivates<T> {
    /// Create an empty store for a registered key
    pub fn new(key: PrivateKey) -> Self {
        PixmapPrivates {
            key,
            slots: HashMap::new(),
        }
    }

    /// The key this store was created for
    pub fn key(&self) -> PrivateKey {
        self.key
    }

    /// Attach a payload, returning the previously attached one
    pub fn attach(&mut self, pixmap: PixmapId, payload: T) -> Option<T> {
        trace!(?pixmap, "Attaching pixmap payload");
        self.slots.insert(pixmap, payload)
    }

    /// Payload attached to a pixmap
    pub fn get(&self, pixmap: PixmapId) -> Option<&T> {
        self.slots.get(&pixmap)
    }

    /// Mutable access to the payload attached to a pixmap
    pub fn get_mut(&mut self, pixmap: PixmapId) -> Option<&mut T> {
        self.slots.get_mut(&pixmap)
    }

    /// Whether a payload is attached
    pub fn contains(&self, pixmap: PixmapId) -> bool {
        self.slots.contains_key(&pixmap)
    }

    /// Remove the association and hand the payload back
    pub fn clear(&mut self, pixmap: PixmapId) -> Option<T> {
        let payload = self.slots.remove(&pixmap);
        if payload.is_some() {
            trace!(?pixmap, "Detached pixmap payload");
        }
        payload
    }

    /// Number of pixmaps carrying a payload
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no pixmap carries a payload
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Detach every payload, used at screen teardown
    pub fn drain(&mut self) -> impl Iterator<Item = (PixmapId, T)> + '_ {
        self.slots.drain()
    }
}
