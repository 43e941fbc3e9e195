//! Operations shipped with the pipeline.

use std::sync::Arc;

use crate::operation::Operation;
use crate::types::CommitError;

mod blur;
mod crop;
mod exposure;
mod splittoning;

pub use blur::{Blur, BlurState};
pub use crop::{Crop, CropState};
pub use exposure::{Exposure, ExposureState};
pub use splittoning::{SplitToning, SplitToningState};

/// The shipped operations, in registration order.
#[must_use]
pub fn builtins() -> Vec<Arc<dyn Operation>> {
    vec![
        Arc::new(Exposure),
        Arc::new(Crop),
        Arc::new(Blur),
        Arc::new(SplitToning),
    ]
}

/// Reject non-finite parameter values.
fn require_finite(module: &str, names: &[&str], values: &[f32]) -> Result<(), CommitError> {
    match names.iter().zip(values).find(|(_, v)| !v.is_finite()) {
        Some((name, value)) => Err(CommitError::InvalidParameters {
            module: module.to_string(),
            reason: format!("`{name}` must be finite, got {value}"),
        }),
        None => Ok(()),
    }
}

/// Pull a fixed-size parameter array out of a block.
fn unpack<const N: usize>(
    module: &str,
    params: &crate::operation::ParamBlock,
) -> Result<[f32; N], CommitError> {
    params.to_array::<N>().ok_or_else(|| CommitError::ParamSize {
        module: module.to_string(),
        expected: N,
        actual: params.len(),
    })
}
