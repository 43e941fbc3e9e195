//! The operation ABI: what every image operation provides to the
//! pipeline.
//!
//! An [`Operation`] is stateless: user-editable values live in a
//! [`ParamBlock`] owned by the module instance, and everything derived
//! for one pipeline lives in an [`ExecutionState`] produced by
//! [`Operation::commit`]. Pixel processing only ever reads both.

use std::any::{Any, type_name};
use std::fmt;
use std::hash::Hasher;

use serde::{Deserialize, Serialize};
use siphasher::sip::SipHasher13;

use crate::buffer::{InputView, OutputTile};
use crate::commit::PipelineContext;
use crate::region::Region;
use crate::types::{CommitError, Dimensions, StageError};

/// A fixed-size block of user-editable parameter values.
///
/// The size is fixed per module definition; the registry rejects
/// definitions whose default block disagrees with their parameter
/// names, and commit rejects blocks of the wrong size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParamBlock(Vec<f32>);

impl ParamBlock {
    /// Wrap parameter values.
    #[must_use]
    pub const fn new(values: Vec<f32>) -> Self {
        Self(values)
    }

    /// Number of values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if the block holds no values.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The value at `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<f32> {
        self.0.get(index).copied()
    }

    /// Overwrite the value at `index`. Returns `false` when out of range.
    pub fn set(&mut self, index: usize, value: f32) -> bool {
        self.0.get_mut(index).map(|slot| *slot = value).is_some()
    }

    /// All values.
    #[must_use]
    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    /// The block as a fixed-size array, or `None` when the length
    /// differs.
    #[must_use]
    pub fn to_array<const N: usize>(&self) -> Option<[f32; N]> {
        <[f32; N]>::try_from(self.0.as_slice()).ok()
    }
}

impl From<Vec<f32>> for ParamBlock {
    fn from(values: Vec<f32>) -> Self {
        Self(values)
    }
}

/// How an operation relates output pixels to input pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    /// Each output pixel depends only on the input pixel at the same
    /// position. Regions are unchanged.
    PointWise,
    /// Each output pixel depends on a neighbourhood of input pixels.
    /// Regions are unchanged; the stage declares a halo.
    Spatial,
    /// The operation changes the geometry of the view.
    Geometric,
}

/// Pipeline-bound data derived from parameters by [`Operation::commit`].
///
/// The payload is a typed value that only its module interprets. Its
/// canonical serialized form is kept alongside so two states can be
/// compared byte for byte and fingerprinted for cache keys.
pub struct ExecutionState {
    module: &'static str,
    payload: Box<dyn Any + Send + Sync>,
    encoded: Vec<u8>,
}

impl ExecutionState {
    /// Wrap a payload produced for `module`.
    ///
    /// # Errors
    ///
    /// Returns [`CommitError::Encode`] if the payload cannot be
    /// serialized.
    pub fn new<T>(module: &'static str, payload: T) -> Result<Self, CommitError>
    where
        T: Any + Send + Sync + Serialize,
    {
        let encoded = serde_json::to_vec(&payload).map_err(|source| CommitError::Encode {
            module: module.to_string(),
            source,
        })?;
        Ok(Self {
            module,
            payload: Box::new(payload),
            encoded,
        })
    }

    /// Name of the module that produced this state.
    #[must_use]
    pub const fn module(&self) -> &'static str {
        self.module
    }

    /// The typed payload.
    ///
    /// # Errors
    ///
    /// Returns [`StageError::StateMismatch`] if the payload is not a `T`.
    pub fn payload<T: Any>(&self) -> Result<&T, StageError> {
        self.payload
            .downcast_ref::<T>()
            .ok_or_else(|| StageError::StateMismatch {
                expected: type_name::<T>().to_string(),
                found: self.module.to_string(),
            })
    }

    /// Canonical serialized form of the payload.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.encoded
    }

    /// Stable 64-bit fingerprint of the module name and payload bytes.
    #[must_use]
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = SipHasher13::new_with_keys(0, 0);
        hasher.write(self.module.as_bytes());
        hasher.write_u8(0xff);
        hasher.write(&self.encoded);
        hasher.finish()
    }
}

impl fmt::Debug for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionState")
            .field("module", &self.module)
            .field("encoded", &String::from_utf8_lossy(&self.encoded))
            .finish_non_exhaustive()
    }
}

/// An image operation kind.
///
/// Implementations must be pure: [`commit`](Self::commit) derives state
/// only from its arguments, and [`process`](Self::process) is called
/// concurrently on disjoint tiles with shared read-only state.
pub trait Operation: Send + Sync {
    /// Unique module name.
    fn name(&self) -> &'static str;

    /// Names of the values in the parameter block, in order.
    fn param_names(&self) -> &'static [&'static str];

    /// Parameter block a fresh instance starts from.
    fn default_params(&self) -> ParamBlock;

    /// Position in the stack; lower runs first.
    fn default_priority(&self) -> i32;

    /// Whether new instances start enabled.
    fn default_enabled(&self) -> bool {
        true
    }

    /// Region behaviour of the operation.
    fn kind(&self) -> OperationKind {
        OperationKind::PointWise
    }

    /// Allocate the parameter block for a new instance.
    fn init(&self) -> ParamBlock {
        self.default_params()
    }

    /// Release an instance's parameter block.
    fn cleanup(&self, _params: &mut ParamBlock) {}

    /// Produce the execution state a pipeline slot starts with, before
    /// the instance's parameters are committed.
    ///
    /// # Errors
    ///
    /// Returns [`CommitError`] if the defaults cannot be committed.
    fn init_execution_state(&self, ctx: &PipelineContext) -> Result<ExecutionState, CommitError> {
        self.commit(&self.default_params(), ctx)
    }

    /// Release a pipeline slot's execution state.
    fn cleanup_execution_state(&self, state: ExecutionState) {
        drop(state);
    }

    /// Derive execution state from parameters for one pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`CommitError`] if the parameters are unusable.
    fn commit(
        &self,
        params: &ParamBlock,
        ctx: &PipelineContext,
    ) -> Result<ExecutionState, CommitError>;

    /// Region this stage produces from `input`.
    fn compute_output_region(&self, _state: &ExecutionState, input: &Region) -> Region {
        *input
    }

    /// Region this stage needs to produce `output`.
    fn compute_input_region(&self, _state: &ExecutionState, output: &Region) -> Region {
        *output
    }

    /// Extra rows and columns around a tile the stage reads.
    fn halo(&self, _state: &ExecutionState) -> u32 {
        0
    }

    /// Full-resolution size of the stage's output for a full-resolution
    /// input of `input` pixels.
    fn output_dimensions(&self, _state: &ExecutionState, input: Dimensions) -> Dimensions {
        input
    }

    /// Write every pixel of `output` from `input`.
    ///
    /// # Errors
    ///
    /// Returns [`StageError`] if `state` does not belong to this
    /// operation.
    fn process(
        &self,
        state: &ExecutionState,
        input: &InputView<'_>,
        output: &mut OutputTile<'_>,
    ) -> Result<(), StageError>;
}
