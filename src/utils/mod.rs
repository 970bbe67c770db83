//! Various utilities functions and types

mod geometry;
pub mod hook;

pub use self::geometry::{Point, Rectangle, Region, Size};
pub use self::hook::{HookChain, HookId, Lifecycle, Stage};
