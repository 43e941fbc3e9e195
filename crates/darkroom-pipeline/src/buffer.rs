//! Pixel buffers and the tile-scoped views stages read from and write to.
//!
//! Every buffer in the pipeline holds [`CHANNELS`] `f32` values per
//! pixel, row-major, with no padding. Stages never see a whole
//! [`PixelBuffer`]: they read through an [`InputView`] restricted to the
//! tile's read window and write through an [`OutputTile`] whose slice is
//! exactly the tile's pixels, so writing outside the allocation cannot
//! be expressed.

use crate::region::Region;
use crate::types::{Dimensions, PipelineError};

/// Channels per pixel in the default color pipeline.
pub const CHANNELS: usize = 3;

/// One pixel's channel values.
pub type Pixel = [f32; CHANNELS];

/// An owned, row-major RGB float image.
#[derive(Debug, Clone, PartialEq)]
pub struct PixelBuffer {
    width: u32,
    height: u32,
    data: Vec<f32>,
}

impl PixelBuffer {
    /// Allocate a zero-filled buffer.
    #[must_use]
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0.0; width as usize * height as usize * CHANNELS],
        }
    }

    /// Wrap existing channel data.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::BufferSizeViolation`] if `data` does not
    /// hold exactly `width * height * CHANNELS` values.
    pub fn from_raw(width: u32, height: u32, data: Vec<f32>) -> Result<Self, PipelineError> {
        let expected = width as usize * height as usize * CHANNELS;
        if data.len() != expected {
            return Err(PipelineError::BufferSizeViolation {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    /// Build a buffer by evaluating `f` at every pixel.
    #[must_use]
    pub fn from_fn(width: u32, height: u32, mut f: impl FnMut(u32, u32) -> Pixel) -> Self {
        let mut data = Vec::with_capacity(width as usize * height as usize * CHANNELS);
        for y in 0..height {
            for x in 0..width {
                data.extend_from_slice(&f(x, y));
            }
        }
        Self {
            width,
            height,
            data,
        }
    }

    /// Width in pixels.
    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels.
    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    /// Size as [`Dimensions`].
    #[must_use]
    pub const fn dimensions(&self) -> Dimensions {
        Dimensions {
            width: self.width,
            height: self.height,
        }
    }

    /// Number of pixels.
    #[must_use]
    pub const fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// The pixel at `(x, y)`, or `None` when out of bounds.
    #[must_use]
    pub fn pixel(&self, x: u32, y: u32) -> Option<Pixel> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let idx = (y as usize * self.width as usize + x as usize) * CHANNELS;
        read_pixel(&self.data, idx)
    }

    /// Raw channel data.
    #[must_use]
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Mutable raw channel data.
    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Consume the buffer and return its channel data.
    #[must_use]
    pub fn into_raw(self) -> Vec<f32> {
        self.data
    }

    /// Read-only view of this buffer, treating it as covering `region`,
    /// with reads limited to `window`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::BufferSizeViolation`] if the buffer does
    /// not hold exactly `region.pixel_count()` pixels.
    pub fn view(&self, region: Region, window: Region) -> Result<InputView<'_>, PipelineError> {
        if self.pixel_count() != region.pixel_count() || self.width != region.width {
            return Err(PipelineError::BufferSizeViolation {
                expected: region.pixel_count() * CHANNELS,
                actual: self.data.len(),
            });
        }
        let window = window.intersect(&region).unwrap_or(region);
        Ok(InputView {
            data: &self.data,
            region,
            window,
        })
    }
}

fn read_pixel(data: &[f32], idx: usize) -> Option<Pixel> {
    data.get(idx..idx + CHANNELS)
        .and_then(|p| <[f32; CHANNELS]>::try_from(p).ok())
}

/// Read access to a stage's input, limited to a window.
///
/// Coordinates are absolute (in the region's coordinate space). Reads
/// outside the window are clamped to its nearest edge pixel, which makes
/// a spatial stage's result independent of how the output is tiled as
/// long as the window includes the stage's declared halo.
#[derive(Debug, Clone, Copy)]
pub struct InputView<'a> {
    data: &'a [f32],
    region: Region,
    window: Region,
}

impl InputView<'_> {
    /// The region the underlying buffer covers.
    #[must_use]
    pub const fn region(&self) -> Region {
        self.region
    }

    /// The part of the region this view may read.
    #[must_use]
    pub const fn window(&self) -> Region {
        self.window
    }

    /// The pixel at absolute `(x, y)`, clamped into the window.
    #[must_use]
    pub fn pixel(&self, x: i64, y: i64) -> Pixel {
        if self.window.is_empty() {
            return [0.0; CHANNELS];
        }
        let cx = x.clamp(i64::from(self.window.x), self.window.right() - 1);
        let cy = y.clamp(i64::from(self.window.y), self.window.bottom() - 1);
        let col = cx - i64::from(self.region.x);
        let row = cy - i64::from(self.region.y);
        let idx = usize::try_from(row * i64::from(self.region.width) + col).unwrap_or(usize::MAX);
        read_pixel(self.data, idx.saturating_mul(CHANNELS)).unwrap_or([0.0; CHANNELS])
    }
}

/// Write access to exactly one tile of a stage's output buffer.
#[derive(Debug)]
pub struct OutputTile<'a> {
    region: Region,
    data: &'a mut [f32],
}

impl<'a> OutputTile<'a> {
    /// Wrap a tile slice.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::BufferSizeViolation`] if `data` is not
    /// exactly `region.pixel_count() * CHANNELS` values long.
    pub fn new(region: Region, data: &'a mut [f32]) -> Result<Self, PipelineError> {
        let expected = region.pixel_count() * CHANNELS;
        if data.len() != expected {
            return Err(PipelineError::BufferSizeViolation {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self { region, data })
    }

    /// The region this tile covers.
    #[must_use]
    pub const fn region(&self) -> Region {
        self.region
    }

    /// Raw channel data of the tile.
    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut *self.data
    }

    /// Write every pixel of the tile from `f(x, y)` in absolute
    /// coordinates, row by row.
    pub fn fill(&mut self, mut f: impl FnMut(i64, i64) -> Pixel) {
        let width = self.region.width as usize;
        if width == 0 {
            return;
        }
        let x0 = i64::from(self.region.x);
        let y0 = i64::from(self.region.y);
        for (row, line) in self.data.chunks_exact_mut(width * CHANNELS).enumerate() {
            let y = y0 + row as i64;
            for (col, px) in line.chunks_exact_mut(CHANNELS).enumerate() {
                px.copy_from_slice(&f(x0 + col as i64, y));
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[allow(clippy::cast_precision_loss)]
    fn gradient(width: u32, height: u32) -> PixelBuffer {
        PixelBuffer::from_fn(width, height, |x, y| {
            [x as f32, y as f32, (x * 100 + y) as f32]
        })
    }

    #[test]
    fn from_raw_rejects_wrong_length() {
        let err = PixelBuffer::from_raw(2, 2, vec![0.0; 11]).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::BufferSizeViolation {
                expected: 12,
                actual: 11
            }
        ));
    }

    #[test]
    fn pixel_out_of_bounds_is_none() {
        let buf = PixelBuffer::new(3, 2);
        assert!(buf.pixel(3, 0).is_none());
        assert!(buf.pixel(0, 2).is_none());
        assert_eq!(buf.pixel(2, 1), Some([0.0; 3]));
    }

    #[test]
    fn view_reads_absolute_coordinates() {
        let buf = gradient(4, 3);
        let region = Region::new(10, 20, 4, 3, 1.0);
        let view = buf.view(region, region).unwrap();
        assert_eq!(view.pixel(10, 20), [0.0, 0.0, 0.0]);
        assert_eq!(view.pixel(13, 22), [3.0, 2.0, 302.0]);
    }

    #[test]
    fn view_clamps_to_window() {
        let buf = gradient(4, 4);
        let region = Region::new(0, 0, 4, 4, 1.0);
        let window = Region::new(1, 1, 2, 2, 1.0);
        let view = buf.view(region, window).unwrap();
        assert_eq!(view.pixel(0, 0), buf.pixel(1, 1).unwrap());
        assert_eq!(view.pixel(100, -5), buf.pixel(2, 1).unwrap());
    }

    #[test]
    fn view_rejects_mismatched_region() {
        let buf = gradient(4, 4);
        let region = Region::new(0, 0, 5, 4, 1.0);
        assert!(matches!(
            buf.view(region, region),
            Err(PipelineError::BufferSizeViolation { .. })
        ));
    }

    #[test]
    fn output_tile_rejects_wrong_slice_length() {
        let mut data = vec![0.0; 10];
        let region = Region::new(0, 0, 2, 2, 1.0);
        assert!(OutputTile::new(region, &mut data).is_err());
    }

    #[test]
    #[allow(clippy::cast_precision_loss)]
    fn fill_writes_every_pixel_once() {
        let region = Region::new(5, 7, 3, 2, 1.0);
        let mut data = vec![f32::NAN; region.pixel_count() * CHANNELS];
        let mut tile = OutputTile::new(region, &mut data).unwrap();
        let mut calls = 0;
        tile.fill(|x, y| {
            calls += 1;
            [x as f32, y as f32, 1.0]
        });
        assert_eq!(calls, 6);
        assert!(data.iter().all(|v| !v.is_nan()));
        assert_eq!(&data[..3], &[5.0, 7.0, 1.0]);
        assert_eq!(&data[15..], &[7.0, 8.0, 1.0]);
    }
}
