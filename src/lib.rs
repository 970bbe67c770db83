#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

//! # wlpixmap: pixmap buffers for an X server under Wayland
//!
//! An X server running as a Wayland client has to hand every on-screen pixmap to the compositor
//! as a buffer the compositor can read. This crate provides the backends producing those
//! buffers, and the bookkeeping tying them to the host server's pixmaps.
//!
//! ## Structure of the crate
//!
//! - [`host`] defines the traits the X server implements. The crate never owns pixmaps, windows
//!   or clients, it manipulates them through these traits.
//! - [`backend`] contains the three buffer backends (descriptor passing, name sharing and shared
//!   memory), the buffer object allocator and the selection logic picking one of them.
//! - [`screen`] ties it together: a [`Screen`](screen::Screen) is created per host screen,
//!   commits to a backend and serves the host's entry points until the screen is freed.
//! - [`privates`] attaches backend payloads to host pixmaps.
//! - [`config`] holds the knobs of the backend selection.
//!
//! ## General principles
//!
//! ### State handling
//!
//! Everything runs on the host's single dispatch thread. A [`Screen`](screen::Screen) holds all
//! state of one screen and the host is passed explicitly as `&mut` to every call, there are no
//! globals. Buffer objects can be shared between a pixmap and the client buffers exported from
//! it, which is tracked with reference counts independent from the host's own pixmap counts.
//!
//! ### Logging
//!
//! wlpixmap makes extensive use of [`tracing`] for its internal logging.
//!
//! For release builds it is recommended to limit the log level during compile time.
//! This can be done by adding a dependency to [`tracing`] and enabling the corresponding features.
//! For example to enable `trace` messages for debug builds, but limit release builds to `debug` add
//! the following in your binary crate `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! tracing = { version = "0.1", features = ["max_level_trace", "release_max_level_debug"] }
//! ```

pub mod backend;
pub mod config;
pub mod host;
pub mod privates;
pub mod screen;
pub mod utils;

#[cfg(test)]
mod test_utils;
