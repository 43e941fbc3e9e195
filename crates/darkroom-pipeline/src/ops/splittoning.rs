//! Split toning.
//!
//! Carries shadow and highlight tint parameters through the commit
//! protocol. Pixel processing copies input to output unchanged.

use serde::Serialize;

use crate::buffer::{InputView, OutputTile};
use crate::commit::PipelineContext;
use crate::operation::{ExecutionState, Operation, ParamBlock};
use crate::types::{CommitError, StageError};

const NAME: &str = "splittoning";

const PARAM_NAMES: &[&str] = &[
    "shadow_red",
    "shadow_green",
    "shadow_blue",
    "shadow_saturation",
    "highlight_red",
    "highlight_green",
    "highlight_blue",
    "highlight_saturation",
    "balance",
];

/// Split toning operation.
#[derive(Debug, Clone, Copy, Default)]
pub struct SplitToning;

/// Committed split toning parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SplitToningState {
    /// Tint applied to shadows.
    pub shadow_color: [f32; 3],
    /// Strength of the shadow tint.
    pub shadow_saturation: f32,
    /// Tint applied to highlights.
    pub highlight_color: [f32; 3],
    /// Strength of the highlight tint.
    pub highlight_saturation: f32,
    /// Luminance that separates shadows from highlights.
    pub balance: f32,
}

impl Operation for SplitToning {
    fn name(&self) -> &'static str {
        NAME
    }

    fn param_names(&self) -> &'static [&'static str] {
        PARAM_NAMES
    }

    fn default_params(&self) -> ParamBlock {
        ParamBlock::new(vec![0.0, 0.0, 0.0, 0.0, 0.9, 0.9, 1.0, 1.0, 0.0])
    }

    fn default_priority(&self) -> i32 {
        970
    }

    fn default_enabled(&self) -> bool {
        false
    }

    fn commit(
        &self,
        params: &ParamBlock,
        _ctx: &PipelineContext,
    ) -> Result<ExecutionState, CommitError> {
        let values = super::unpack::<9>(NAME, params)?;
        super::require_finite(NAME, PARAM_NAMES, &values)?;
        let [sr, sg, sb, ss, hr, hg, hb, hs, balance] = values;
        ExecutionState::new(
            NAME,
            SplitToningState {
                shadow_color: [sr, sg, sb],
                shadow_saturation: ss,
                highlight_color: [hr, hg, hb],
                highlight_saturation: hs,
                balance,
            },
        )
    }

    fn process(
        &self,
        state: &ExecutionState,
        input: &InputView<'_>,
        output: &mut OutputTile<'_>,
    ) -> Result<(), StageError> {
        state.payload::<SplitToningState>()?;
        output.fill(|x, y| input.pixel(x, y));
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::buffer::PixelBuffer;
    use crate::commit::{PipelineId, PipelineKind};
    use crate::region::Region;
    use crate::types::Dimensions;

    #[test]
    fn commit_copies_every_field() {
        let ctx = PipelineContext {
            pipeline: PipelineId::next(),
            kind: PipelineKind::Preview,
            source: Dimensions::new(2, 2),
            scale: 1.0,
        };
        let params = ParamBlock::new(vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8, 0.9]);
        let state = SplitToning.commit(&params, &ctx).unwrap();
        let payload = state.payload::<SplitToningState>().unwrap();
        assert_eq!(payload.shadow_color, [0.1, 0.2, 0.3]);
        assert_eq!(payload.highlight_color, [0.5, 0.6, 0.7]);
        assert!((payload.balance - 0.9).abs() < f32::EPSILON);
    }

    #[test]
    fn non_finite_parameter_is_rejected() {
        let ctx = PipelineContext {
            pipeline: PipelineId::next(),
            kind: PipelineKind::Preview,
            source: Dimensions::new(2, 2),
            scale: 1.0,
        };
        for bad in [f32::NAN, f32::INFINITY] {
            let mut params = SplitToning.default_params();
            params.set(8, bad);
            let err = SplitToning.commit(&params, &ctx).unwrap_err();
            assert!(err.to_string().contains("balance"), "{err}");
        }
    }

    #[test]
    fn process_copies_pixels() {
        let ctx = PipelineContext {
            pipeline: PipelineId::next(),
            kind: PipelineKind::Export,
            source: Dimensions::new(2, 2),
            scale: 1.0,
        };
        let state = SplitToning.init_execution_state(&ctx).unwrap();
        let region = Region::new(0, 0, 2, 2, 1.0);
        let input = PixelBuffer::from_raw(
            2,
            2,
            vec![0.1, 0.2, 0.3, 1.0, -1.0, 0.5, 7.0, 8.0, 9.0, 0.0, f32::MAX, -0.0],
        )
        .unwrap();
        let mut out = vec![0.0; 12];
        let mut tile = OutputTile::new(region, &mut out).unwrap();
        SplitToning
            .process(&state, &input.view(region, region).unwrap(), &mut tile)
            .unwrap();
        let same = out
            .iter()
            .zip(input.as_slice())
            .all(|(a, b)| a.to_bits() == b.to_bits());
        assert!(same);
    }
}
