//! Crop.
//!
//! The crop rectangle is given as fractions of the full image. Output
//! coordinates start at the crop origin, so the stage maps regions by a
//! pure translation and never resamples.

use serde::Serialize;

use crate::buffer::{InputView, OutputTile};
use crate::commit::PipelineContext;
use crate::operation::{ExecutionState, Operation, OperationKind, ParamBlock};
use crate::region::Region;
use crate::types::{CommitError, Dimensions, StageError};

const NAME: &str = "crop";
const PARAM_NAMES: &[&str] = &["left", "top", "right", "bottom"];

/// Crop operation.
#[derive(Debug, Clone, Copy, Default)]
pub struct Crop;

/// Committed crop state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CropState {
    /// Full-resolution crop origin.
    pub left: u32,
    /// Full-resolution crop origin.
    pub top: u32,
    /// Full-resolution crop size.
    pub width: u32,
    /// Full-resolution crop size.
    pub height: u32,
    /// Crop origin at the pipeline's scale.
    pub offset_x: i32,
    /// Crop origin at the pipeline's scale.
    pub offset_y: i32,
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn to_pixels(fraction: f32, extent: u32) -> u32 {
    (f64::from(fraction) * f64::from(extent)).round() as u32
}

#[allow(clippy::cast_possible_truncation)]
fn scaled_offset(pixels: u32, scale: f32) -> i32 {
    (f64::from(pixels) * f64::from(scale))
        .round()
        .min(f64::from(i32::MAX)) as i32
}

impl Operation for Crop {
    fn name(&self) -> &'static str {
        NAME
    }

    fn param_names(&self) -> &'static [&'static str] {
        PARAM_NAMES
    }

    fn default_params(&self) -> ParamBlock {
        ParamBlock::new(vec![0.0, 0.0, 1.0, 1.0])
    }

    fn default_priority(&self) -> i32 {
        400
    }

    fn kind(&self) -> OperationKind {
        OperationKind::Geometric
    }

    fn commit(
        &self,
        params: &ParamBlock,
        ctx: &PipelineContext,
    ) -> Result<ExecutionState, CommitError> {
        let values = super::unpack::<4>(NAME, params)?;
        super::require_finite(NAME, PARAM_NAMES, &values)?;
        let [left, top, right, bottom] = values;
        let ordered = |lo: f32, hi: f32| (0.0..=1.0).contains(&lo) && lo < hi && hi <= 1.0;
        if !ordered(left, right) || !ordered(top, bottom) {
            return Err(CommitError::InvalidParameters {
                module: NAME.to_string(),
                reason: format!(
                    "crop box ({left}, {top})..({right}, {bottom}) must satisfy \
                     0 <= left < right <= 1 and 0 <= top < bottom <= 1"
                ),
            });
        }
        let x0 = to_pixels(left, ctx.source.width);
        let y0 = to_pixels(top, ctx.source.height);
        let x1 = to_pixels(right, ctx.source.width);
        let y1 = to_pixels(bottom, ctx.source.height);
        ExecutionState::new(
            NAME,
            CropState {
                left: x0,
                top: y0,
                width: x1.saturating_sub(x0).max(1),
                height: y1.saturating_sub(y0).max(1),
                offset_x: scaled_offset(x0, ctx.scale),
                offset_y: scaled_offset(y0, ctx.scale),
            },
        )
    }

    fn compute_output_region(&self, state: &ExecutionState, input: &Region) -> Region {
        match state.payload::<CropState>() {
            Ok(crop) => input.translate(-crop.offset_x, -crop.offset_y),
            Err(_) => *input,
        }
    }

    fn compute_input_region(&self, state: &ExecutionState, output: &Region) -> Region {
        match state.payload::<CropState>() {
            Ok(crop) => output.translate(crop.offset_x, crop.offset_y),
            Err(_) => *output,
        }
    }

    fn output_dimensions(&self, state: &ExecutionState, input: Dimensions) -> Dimensions {
        match state.payload::<CropState>() {
            Ok(crop) => Dimensions::new(crop.width, crop.height),
            Err(_) => input,
        }
    }

    fn process(
        &self,
        state: &ExecutionState,
        input: &InputView<'_>,
        output: &mut OutputTile<'_>,
    ) -> Result<(), StageError> {
        let crop = state.payload::<CropState>()?;
        let dx = i64::from(crop.offset_x);
        let dy = i64::from(crop.offset_y);
        output.fill(|x, y| input.pixel(x + dx, y + dy));
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::commit::{PipelineId, PipelineKind};

    fn ctx(scale: f32) -> PipelineContext {
        PipelineContext {
            pipeline: PipelineId::next(),
            kind: PipelineKind::Export,
            source: Dimensions::new(200, 100),
            scale,
        }
    }

    #[test]
    fn commit_converts_fractions_to_pixels() {
        let state = Crop
            .commit(&ParamBlock::new(vec![0.25, 0.1, 0.75, 0.9]), &ctx(0.5))
            .unwrap();
        let crop = state.payload::<CropState>().unwrap();
        assert_eq!((crop.left, crop.top, crop.width, crop.height), (50, 10, 100, 80));
        assert_eq!((crop.offset_x, crop.offset_y), (25, 5));
        assert_eq!(
            Crop.output_dimensions(&state, Dimensions::new(200, 100)),
            Dimensions::new(100, 80)
        );
    }

    #[test]
    fn regions_are_inverse_translations() {
        let state = Crop
            .commit(&ParamBlock::new(vec![0.1, 0.2, 1.0, 1.0]), &ctx(1.0))
            .unwrap();
        let out = Region::new(0, 0, 40, 30, 1.0);
        let input = Crop.compute_input_region(&state, &out);
        assert_eq!(input, Region::new(20, 20, 40, 30, 1.0));
        assert_eq!(Crop.compute_output_region(&state, &input), out);
    }

    #[test]
    fn inverted_box_is_rejected() {
        for params in [
            vec![0.5, 0.0, 0.5, 1.0],
            vec![0.0, 0.8, 1.0, 0.2],
            vec![-0.1, 0.0, 1.0, 1.0],
            vec![0.0, 0.0, 1.5, 1.0],
        ] {
            assert!(matches!(
                Crop.commit(&ParamBlock::new(params), &ctx(1.0)),
                Err(CommitError::InvalidParameters { .. })
            ));
        }
    }
}
