//! Region descriptors: rectangular views of an image at a given scale.
//!
//! A [`Region`] is the currency passed between pipeline stages. Its
//! offset and size are expressed in pixels of the image *at `scale`*,
//! so a preview at half resolution and a full-resolution export of the
//! same crop carry different `x`/`y`/`width`/`height` but describe the
//! same part of the picture.
//!
//! Coordinates are signed: geometry stages may map a view partially
//! outside the source image, which the source sampler resolves by
//! edge-clamping.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::Dimensions;

/// A rectangular sub-view of an image at a scale factor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Region {
    /// Horizontal offset of the left edge, in scaled pixels.
    pub x: i32,
    /// Vertical offset of the top edge, in scaled pixels.
    pub y: i32,
    /// Width in scaled pixels.
    pub width: u32,
    /// Height in scaled pixels.
    pub height: u32,
    /// Scale relative to the full-resolution image (1.0 = full size).
    pub scale: f32,
}

impl Region {
    /// Create a new region.
    #[must_use]
    pub const fn new(x: i32, y: i32, width: u32, height: u32, scale: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
            scale,
        }
    }

    /// The region covering a whole image of `dimensions` (full
    /// resolution) viewed at `scale`.
    ///
    /// Scaled sizes are rounded to the nearest pixel and never drop
    /// below one pixel for a non-empty image.
    #[must_use]
    pub fn full(dimensions: Dimensions, scale: f32) -> Self {
        Self::new(
            0,
            0,
            scaled_extent(dimensions.width, scale),
            scaled_extent(dimensions.height, scale),
            scale,
        )
    }

    /// Number of pixels in the region.
    #[must_use]
    pub const fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Returns `true` if the region covers no pixels.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Exclusive right edge.
    #[must_use]
    pub const fn right(&self) -> i64 {
        self.x as i64 + self.width as i64
    }

    /// Exclusive bottom edge.
    #[must_use]
    pub const fn bottom(&self) -> i64 {
        self.y as i64 + self.height as i64
    }

    /// Size of the region as [`Dimensions`].
    #[must_use]
    pub const fn dimensions(&self) -> Dimensions {
        Dimensions {
            width: self.width,
            height: self.height,
        }
    }

    /// The same region shifted by `(dx, dy)`.
    #[must_use]
    pub fn translate(&self, dx: i32, dy: i32) -> Self {
        Self {
            x: self.x.saturating_add(dx),
            y: self.y.saturating_add(dy),
            ..*self
        }
    }

    /// The region grown by `margin` pixels on every side.
    #[must_use]
    pub fn expand(&self, margin: u32) -> Self {
        let m = i32::try_from(margin).unwrap_or(i32::MAX);
        Self {
            x: self.x.saturating_sub(m),
            y: self.y.saturating_sub(m),
            width: self.width.saturating_add(margin.saturating_mul(2)),
            height: self.height.saturating_add(margin.saturating_mul(2)),
            scale: self.scale,
        }
    }

    /// Intersection of two regions, or `None` when they do not overlap.
    ///
    /// The scale of `self` is kept.
    #[must_use]
    pub fn intersect(&self, other: &Self) -> Option<Self> {
        let left = i64::from(self.x).max(i64::from(other.x));
        let top = i64::from(self.y).max(i64::from(other.y));
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());
        if right <= left || bottom <= top {
            return None;
        }
        Some(Self {
            x: i32::try_from(left).ok()?,
            y: i32::try_from(top).ok()?,
            width: u32::try_from(right - left).ok()?,
            height: u32::try_from(bottom - top).ok()?,
            scale: self.scale,
        })
    }

    /// A horizontal band of `rows` rows starting `row_offset` rows below
    /// the top edge, clipped to the region.
    #[must_use]
    pub fn band(&self, row_offset: u32, rows: u32) -> Self {
        let start = row_offset.min(self.height);
        let rows = rows.min(self.height - start);
        Self {
            y: self.y.saturating_add(i32::try_from(start).unwrap_or(i32::MAX)),
            height: rows,
            ..*self
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{}@({},{}) scale {}",
            self.width, self.height, self.x, self.y, self.scale
        )
    }
}

/// Scale a full-resolution extent, rounding to the nearest pixel.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn scaled_extent(extent: u32, scale: f32) -> u32 {
    if extent == 0 {
        return 0;
    }
    let scaled = (f64::from(extent) * f64::from(scale)).round();
    if scaled < 1.0 {
        1
    } else if scaled >= f64::from(u32::MAX) {
        u32::MAX
    } else {
        scaled as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_region_at_unit_scale_matches_dimensions() {
        let r = Region::full(
            Dimensions {
                width: 640,
                height: 480,
            },
            1.0,
        );
        assert_eq!(r, Region::new(0, 0, 640, 480, 1.0));
    }

    #[test]
    fn full_region_rounds_scaled_extent() {
        let r = Region::full(
            Dimensions {
                width: 101,
                height: 3,
            },
            0.5,
        );
        assert_eq!(r.width, 51);
        assert_eq!(r.height, 2);
    }

    #[test]
    fn full_region_never_collapses_below_one_pixel() {
        let r = Region::full(
            Dimensions {
                width: 10,
                height: 10,
            },
            0.01,
        );
        assert_eq!((r.width, r.height), (1, 1));
    }

    #[test]
    fn empty_region_detection() {
        assert!(Region::new(0, 0, 0, 0, 1.0).is_empty());
        assert!(Region::new(3, 3, 5, 0, 1.0).is_empty());
        assert!(!Region::new(0, 0, 1, 1, 1.0).is_empty());
    }

    #[test]
    fn expand_then_intersect_clips_to_bounds() {
        let bounds = Region::new(0, 0, 10, 10, 1.0);
        let tile = Region::new(0, 4, 10, 2, 1.0);
        let window = tile.expand(3).intersect(&bounds).unwrap();
        assert_eq!(window, Region::new(0, 1, 10, 8, 1.0));
    }

    #[test]
    fn disjoint_regions_do_not_intersect() {
        let a = Region::new(0, 0, 4, 4, 1.0);
        let b = Region::new(4, 0, 4, 4, 1.0);
        assert!(a.intersect(&b).is_none());
    }

    #[test]
    fn band_is_clipped_to_height() {
        let r = Region::new(2, 10, 8, 5, 1.0);
        assert_eq!(r.band(3, 4), Region::new(2, 13, 8, 2, 1.0));
        assert!(r.band(9, 4).is_empty());
    }

    #[test]
    fn translate_round_trips() {
        let r = Region::new(-3, 7, 4, 4, 0.5);
        assert_eq!(r.translate(5, -2).translate(-5, 2), r);
    }

    #[test]
    fn display_is_compact() {
        let r = Region::new(1, 2, 3, 4, 1.0);
        assert_eq!(r.to_string(), "3x4@(1,2) scale 1");
    }
}
