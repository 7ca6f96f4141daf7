// Region tracking helpers
//

use std::cmp::PartialOrd;
use std::ops::{Add, Sub};

/// A rectangular region
///
/// Used for layer source crops and display frames. It is determined
/// by the corners of a rectangle:
///   r_pos:  the upper left corner's position on the display
///   r_size: the distance from the upper left to the lower right
#[derive(Debug, Default, PartialEq, Copy, Clone)]
pub struct Rect<T: PartialOrd + Copy + Add<Output = T> + Sub<Output = T>> {
    pub r_pos: (T, T),
    pub r_size: (T, T),
}

impl<T: PartialOrd + Copy + Add<Output = T> + Sub<Output = T>> Rect<T> {
    pub fn new(x: T, y: T, width: T, height: T) -> Rect<T> {
        Rect {
            r_pos: (x, y),
            r_size: (width, height),
        }
    }

    /// Build a rect from its edges, the way display servers describe them
    pub fn from_edges(left: T, top: T, right: T, bottom: T) -> Rect<T> {
        Rect {
            r_pos: (left, top),
            r_size: (right - left, bottom - top),
        }
    }

    pub fn left(&self) -> T {
        self.r_pos.0
    }

    pub fn top(&self) -> T {
        self.r_pos.1
    }

    pub fn right(&self) -> T {
        self.r_pos.0 + self.r_size.0
    }

    pub fn bottom(&self) -> T {
        self.r_pos.1 + self.r_size.1
    }

    pub fn width(&self) -> T {
        self.r_size.0
    }

    pub fn height(&self) -> T {
        self.r_size.1
    }

    /// Checks if the two rectangles share any area.
    ///
    /// Rectangles that only touch along an edge do not overlap.
    pub fn overlaps(&self, other: &Rect<T>) -> bool {
        !(other.left() >= self.right()
            || other.right() <= self.left()
            || other.top() >= self.bottom()
            || other.bottom() <= self.top())
    }
}
