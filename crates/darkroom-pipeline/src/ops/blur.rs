//! Box blur.
//!
//! The radius is given in full-resolution pixels and scaled to the
//! pipeline at commit time, so a preview and an export of the same edit
//! blur the same part of the picture. The stage asks for `radius` extra
//! pixels on every side of its output, so a region request sees the same
//! neighbours as a full export.

use serde::Serialize;

use crate::buffer::{CHANNELS, InputView, OutputTile, Pixel};
use crate::commit::PipelineContext;
use crate::operation::{ExecutionState, Operation, OperationKind, ParamBlock};
use crate::region::Region;
use crate::types::{CommitError, StageError};

const NAME: &str = "blur";
const PARAM_NAMES: &[&str] = &["radius"];

/// Largest accepted radius in full-resolution pixels.
pub const MAX_RADIUS: f32 = 64.0;

/// Box blur operation.
#[derive(Debug, Clone, Copy, Default)]
pub struct Blur;

/// Committed blur state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BlurState {
    /// Radius in pixels at the pipeline's scale.
    pub radius: u32,
}

impl Operation for Blur {
    fn name(&self) -> &'static str {
        NAME
    }

    fn param_names(&self) -> &'static [&'static str] {
        PARAM_NAMES
    }

    fn default_params(&self) -> ParamBlock {
        ParamBlock::new(vec![2.0])
    }

    fn default_priority(&self) -> i32 {
        600
    }

    fn kind(&self) -> OperationKind {
        OperationKind::Spatial
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn commit(
        &self,
        params: &ParamBlock,
        ctx: &PipelineContext,
    ) -> Result<ExecutionState, CommitError> {
        let values = super::unpack::<1>(NAME, params)?;
        super::require_finite(NAME, PARAM_NAMES, &values)?;
        let [radius] = values;
        if !(0.0..=MAX_RADIUS).contains(&radius) {
            return Err(CommitError::InvalidParameters {
                module: NAME.to_string(),
                reason: format!("`radius` must be in [0, {MAX_RADIUS}], got {radius}"),
            });
        }
        let scaled = (f64::from(radius) * f64::from(ctx.scale)).round() as u32;
        ExecutionState::new(NAME, BlurState { radius: scaled })
    }

    fn halo(&self, state: &ExecutionState) -> u32 {
        state.payload::<BlurState>().map_or(0, |s| s.radius)
    }

    fn compute_input_region(&self, state: &ExecutionState, output: &Region) -> Region {
        output.expand(self.halo(state))
    }

    fn compute_output_region(&self, state: &ExecutionState, input: &Region) -> Region {
        let radius = self.halo(state);
        let inset = i32::try_from(radius).unwrap_or(i32::MAX);
        Region {
            x: input.x.saturating_add(inset),
            y: input.y.saturating_add(inset),
            width: input.width.saturating_sub(radius.saturating_mul(2)),
            height: input.height.saturating_sub(radius.saturating_mul(2)),
            scale: input.scale,
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn process(
        &self,
        state: &ExecutionState,
        input: &InputView<'_>,
        output: &mut OutputTile<'_>,
    ) -> Result<(), StageError> {
        let r = i64::from(state.payload::<BlurState>()?.radius);
        if r == 0 {
            output.fill(|x, y| input.pixel(x, y));
            return Ok(());
        }
        let norm = 1.0 / ((2 * r + 1) * (2 * r + 1)) as f32;
        output.fill(|x, y| {
            let mut sum: Pixel = [0.0; CHANNELS];
            for sy in y - r..=y + r {
                for sx in x - r..=x + r {
                    let p = input.pixel(sx, sy);
                    for (acc, v) in sum.iter_mut().zip(p) {
                        *acc += v;
                    }
                }
            }
            sum.map(|v| v * norm)
        });
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::buffer::PixelBuffer;
    use crate::commit::{PipelineId, PipelineKind};
    use crate::types::Dimensions;

    fn ctx(scale: f32) -> PipelineContext {
        PipelineContext {
            pipeline: PipelineId::next(),
            kind: PipelineKind::Preview,
            source: Dimensions::new(16, 16),
            scale,
        }
    }

    #[test]
    fn halo_follows_scale() {
        let params = ParamBlock::new(vec![8.0]);
        assert_eq!(Blur.halo(&Blur.commit(&params, &ctx(1.0)).unwrap()), 8);
        assert_eq!(Blur.halo(&Blur.commit(&params, &ctx(0.25)).unwrap()), 2);
    }

    #[test]
    fn regions_grow_by_the_radius() {
        let state = Blur.commit(&ParamBlock::new(vec![3.0]), &ctx(1.0)).unwrap();
        let output = Region::new(4, 5, 6, 2, 1.0);
        let input = Blur.compute_input_region(&state, &output);
        assert_eq!(input, Region::new(1, 2, 12, 8, 1.0));
        assert_eq!(Blur.compute_output_region(&state, &input), output);
    }

    #[test]
    fn radius_out_of_range_is_rejected() {
        for radius in [-1.0, 65.0, f32::NAN] {
            assert!(Blur.commit(&ParamBlock::new(vec![radius]), &ctx(1.0)).is_err());
        }
    }

    #[test]
    fn flat_image_stays_flat() {
        let state = Blur.commit(&ParamBlock::new(vec![2.0]), &ctx(1.0)).unwrap();
        let region = Region::new(0, 0, 5, 4, 1.0);
        let input = PixelBuffer::from_fn(5, 4, |_, _| [0.5, 0.25, 1.0]);
        let mut out = vec![0.0; region.pixel_count() * CHANNELS];
        let mut tile = OutputTile::new(region, &mut out).unwrap();
        Blur.process(&state, &input.view(region, region).unwrap(), &mut tile)
            .unwrap();
        for px in out.chunks_exact(CHANNELS) {
            assert!((px[0] - 0.5).abs() < 1e-6);
            assert!((px[1] - 0.25).abs() < 1e-6);
            assert!((px[2] - 1.0).abs() < 1e-6);
        }
    }
}
