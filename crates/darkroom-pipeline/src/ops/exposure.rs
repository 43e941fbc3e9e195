//! Exposure and black level.

use serde::Serialize;

use crate::buffer::{InputView, OutputTile};
use crate::commit::PipelineContext;
use crate::operation::{ExecutionState, Operation, ParamBlock};
use crate::types::{CommitError, StageError};

const NAME: &str = "exposure";
const PARAM_NAMES: &[&str] = &["ev", "black"];

/// Exposure correction: `out = (in - black) * 2^ev`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Exposure;

/// Committed exposure state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ExposureState {
    /// Linear multiplier derived from `ev`.
    pub gain: f32,
    /// Black level subtracted before scaling.
    pub black: f32,
}

impl Operation for Exposure {
    fn name(&self) -> &'static str {
        NAME
    }

    fn param_names(&self) -> &'static [&'static str] {
        PARAM_NAMES
    }

    fn default_params(&self) -> ParamBlock {
        ParamBlock::new(vec![0.0, 0.0])
    }

    fn default_priority(&self) -> i32 {
        250
    }

    fn commit(
        &self,
        params: &ParamBlock,
        _ctx: &PipelineContext,
    ) -> Result<ExecutionState, CommitError> {
        let values = super::unpack::<2>(NAME, params)?;
        super::require_finite(NAME, PARAM_NAMES, &values)?;
        let [ev, black] = values;
        let gain = ev.exp2();
        if !gain.is_finite() {
            return Err(CommitError::InvalidParameters {
                module: NAME.to_string(),
                reason: format!("`ev` of {ev} overflows"),
            });
        }
        ExecutionState::new(NAME, ExposureState { gain, black })
    }

    fn process(
        &self,
        state: &ExecutionState,
        input: &InputView<'_>,
        output: &mut OutputTile<'_>,
    ) -> Result<(), StageError> {
        let &ExposureState { gain, black } = state.payload::<ExposureState>()?;
        output.fill(|x, y| input.pixel(x, y).map(|v| (v - black) * gain));
        Ok(())
    }
}
