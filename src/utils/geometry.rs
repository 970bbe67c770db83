use smallvec::SmallVec;
use std::fmt;

/// A point in drawable coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Point {
    /// horizontal coordinate
    pub x: i32,
    /// vertical coordinate
    pub y: i32,
}

impl Point {
    /// The origin of a drawable
    pub const ORIGIN: Point = Point { x: 0, y: 0 };
}

impl From<(i32, i32)> for Point {
    #[inline]
    fn from((x, y): (i32, i32)) -> Point {
        Point { x, y }
    }
}

/// A size in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Size {
    /// horizontal extent
    pub w: u32,
    /// vertical extent
    pub h: u32,
}

impl Size {
    /// Checks whether this size has no area
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.w == 0 || self.h == 0
    }
}

impl From<(u32, u32)> for Size {
    #[inline]
    fn from((w, h): (u32, u32)) -> Size {
        Size { w, h }
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.w, self.h)
    }
}

/// An axis-aligned rectangle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rectangle {
    /// Location of the top-left corner of the rectangle
    pub loc: Point,
    /// Size of the rectangle, as (width, height)
    pub size: Size,
}

impl Rectangle {
    /// Create a new [`Rectangle`] from the coordinates of its top-left corner and its dimensions
    #[inline]
    pub fn from_loc_and_size(loc: impl Into<Point>, size: impl Into<Size>) -> Self {
        Rectangle {
            loc: loc.into(),
            size: size.into(),
        }
    }

    /// Create a new [`Rectangle`] from its dimensions, with location zero
    #[inline]
    pub fn from_size(size: impl Into<Size>) -> Self {
        Rectangle {
            loc: Point::ORIGIN,
            size: size.into(),
        }
    }

    fn right(&self) -> i64 {
        self.loc.x as i64 + self.size.w as i64
    }

    fn bottom(&self) -> i64 {
        self.loc.y as i64 + self.size.h as i64
    }

    /// Checks whether a given [`Rectangle`] overlaps with this one
    #[inline]
    pub fn overlaps(&self, other: &Rectangle) -> bool {
        (self.loc.x as i64) < other.right()
            && (other.loc.x as i64) < self.right()
            && (self.loc.y as i64) < other.bottom()
            && (other.loc.y as i64) < self.bottom()
    }

    /// Clamp rectangle to the overlapping area of two rectangles
    ///
    /// Returns `None` if the two rectangles don't overlap
    pub fn intersection(&self, other: &Rectangle) -> Option<Rectangle> {
        if !self.overlaps(other) {
            return None;
        }
        let x = self.loc.x.max(other.loc.x);
        let y = self.loc.y.max(other.loc.y);
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());
        Some(Rectangle::from_loc_and_size(
            (x, y),
            ((right - x as i64) as u32, (bottom - y as i64) as u32),
        ))
    }
}

/// A clip region, made of a list of rectangles
///
/// Rectangles are not required to be disjoint, the host merges them
/// when it installs the region as a clip.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Region {
    rects: SmallVec<[Rectangle; 4]>,
}

impl Region {
    /// An empty region
    pub fn new() -> Region {
        Region::default()
    }

    /// A region covering a single rectangle
    pub fn from_rect(rect: Rectangle) -> Region {
        let mut region = Region::new();
        region.add(rect);
        region
    }

    /// Add a rectangle to the region, empty rectangles are ignored
    pub fn add(&mut self, rect: Rectangle) {
        if !rect.size.is_empty() {
            self.rects.push(rect);
        }
    }

    /// Rectangles making up this region
    pub fn rects(&self) -> &[Rectangle] {
        &self.rects
    }

    /// Checks if the region covers nothing
    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }

    /// Restrict the region to the given bounds
    pub fn clipped_to(&self, bounds: &Rectangle) -> Region {
        Region {
            rects: self.rects.iter().filter_map(|r| r.intersection(bounds)).collect(),
        }
    }
}

impl FromIterator<Rectangle> for Region {
    fn from_iter<T: IntoIterator<Item = Rectangle>>(iter: T) -> Self {
        let mut region = Region::new();
        for rect in iter {
            region.add(rect);
        }
        region
    }
}
