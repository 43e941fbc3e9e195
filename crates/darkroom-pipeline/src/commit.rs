//! The commit protocol: parameters to pipeline-bound execution state.
//!
//! [`commit`] is the only path that produces an [`ExecutionState`], and
//! [`StateArena`] is the only place one is stored. An arena belongs to a
//! single pipeline; its slots are indexed by stage position and released
//! through the owning operation when the arena is dropped, so every
//! teardown path (including errors and cancellation) cleans up.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::operation::{ExecutionState, ParamBlock};
use crate::registry::ModuleDefinition;
use crate::types::{CommitError, Dimensions};

/// Process-unique identifier of one assembled pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PipelineId(u64);

impl PipelineId {
    /// Allocate a fresh identifier.
    #[must_use]
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PipelineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pipe-{}", self.0)
    }
}

/// What a pipeline is assembled for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PipelineKind {
    /// Interactive, reduced-scale view.
    Preview,
    /// Full-resolution output.
    Export,
    /// Small fixed-size rendition.
    Thumbnail,
}

impl fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Preview => "preview",
            Self::Export => "export",
            Self::Thumbnail => "thumbnail",
        };
        f.write_str(name)
    }
}

/// Facts about the pipeline a commit is for.
///
/// Commit output may depend on these and on the parameters, nothing
/// else.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineContext {
    /// Pipeline being assembled.
    pub pipeline: PipelineId,
    /// Purpose of the pipeline.
    pub kind: PipelineKind,
    /// Full-resolution size of the source image.
    pub source: Dimensions,
    /// Scale the pipeline renders at.
    pub scale: f32,
}

/// Run `definition`'s commit step on `params`.
///
/// # Errors
///
/// Returns [`CommitError::ParamSize`] if `params` has the wrong number of
/// values, [`CommitError::ForeignState`] if the operation tagged its
/// state with another module name, or whatever the operation rejects.
pub fn commit(
    definition: &ModuleDefinition,
    params: &ParamBlock,
    ctx: &PipelineContext,
) -> Result<ExecutionState, CommitError> {
    if params.len() != definition.param_size() {
        return Err(CommitError::ParamSize {
            module: definition.name().to_string(),
            expected: definition.param_size(),
            actual: params.len(),
        });
    }
    let state = definition.operation().commit(params, ctx)?;
    if state.module() != definition.name() {
        return Err(CommitError::ForeignState {
            module: definition.name().to_string(),
            produced: state.module().to_string(),
        });
    }
    trace!(
        module = definition.name(),
        pipeline = %ctx.pipeline,
        bytes = state.as_bytes().len(),
        "committed",
    );
    Ok(state)
}

struct Slot {
    definition: Arc<ModuleDefinition>,
    state: Option<ExecutionState>,
}

/// Execution-state storage for one pipeline, indexed by stage position.
pub struct StateArena {
    pipeline: PipelineId,
    slots: Vec<Slot>,
}

impl StateArena {
    /// Create an empty arena for `pipeline`.
    #[must_use]
    pub const fn new(pipeline: PipelineId) -> Self {
        Self {
            pipeline,
            slots: Vec::new(),
        }
    }

    /// Pipeline the arena belongs to.
    #[must_use]
    pub const fn pipeline(&self) -> PipelineId {
        self.pipeline
    }

    /// Append a slot for `definition`, initialized through the
    /// operation's `init_execution_state`. Returns the slot index.
    ///
    /// The slot stays empty if initialization fails; the error is
    /// returned so the caller can disable the stage.
    pub fn push(
        &mut self,
        definition: Arc<ModuleDefinition>,
        ctx: &PipelineContext,
    ) -> (usize, Result<(), CommitError>) {
        let init = definition.operation().init_execution_state(ctx);
        let index = self.slots.len();
        let (state, result) = match init {
            Ok(state) => (Some(state), Ok(())),
            Err(e) => (None, Err(e)),
        };
        self.slots.push(Slot { definition, state });
        (index, result)
    }

    /// Commit `params` into slot `index`, releasing the previous state.
    ///
    /// On failure the slot is left empty.
    ///
    /// # Errors
    ///
    /// Returns the commit error.
    pub fn commit(
        &mut self,
        index: usize,
        params: &ParamBlock,
        ctx: &PipelineContext,
    ) -> Result<(), CommitError> {
        let Some(slot) = self.slots.get_mut(index) else {
            return Ok(());
        };
        let result = commit(&slot.definition, params, ctx);
        if let Some(previous) = slot.state.take() {
            slot.definition.operation().cleanup_execution_state(previous);
        }
        slot.state = Some(result?);
        Ok(())
    }

    /// State stored in slot `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&ExecutionState> {
        self.slots.get(index).and_then(|slot| slot.state.as_ref())
    }

    /// Number of slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns `true` if the arena has no slots.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl fmt::Debug for StateArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateArena")
            .field("pipeline", &self.pipeline)
            .field("slots", &self.slots.len())
            .finish()
    }
}

impl Drop for StateArena {
    fn drop(&mut self) {
        for slot in &mut self.slots {
            if let Some(state) = slot.state.take() {
                slot.definition.operation().cleanup_execution_state(state);
            }
        }
        trace!(pipeline = %self.pipeline, "released execution state");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::buffer::{InputView, OutputTile};
    use crate::operation::Operation;
    use crate::registry::ModuleRegistry;
    use crate::types::StageError;

    fn context() -> PipelineContext {
        PipelineContext {
            pipeline: PipelineId::next(),
            kind: PipelineKind::Export,
            source: Dimensions::new(64, 48),
            scale: 1.0,
        }
    }

    #[test]
    fn pipeline_ids_are_unique() {
        assert_ne!(PipelineId::next(), PipelineId::next());
    }

    #[test]
    fn commit_is_byte_identical_for_identical_inputs() {
        let registry = ModuleRegistry::with_builtins().unwrap();
        let ctx = context();
        for definition in registry.iter() {
            let params = definition.default_params().clone();
            let a = commit(definition, &params, &ctx).unwrap();
            let b = commit(definition, &params, &ctx).unwrap();
            assert_eq!(a.as_bytes(), b.as_bytes(), "{}", definition.name());
        }
    }

    #[test]
    fn commit_rejects_wrong_block_size() {
        let registry = ModuleRegistry::with_builtins().unwrap();
        let definition = registry.lookup("exposure").unwrap();
        let err = commit(definition, &ParamBlock::new(vec![1.0]), &context()).unwrap_err();
        assert!(matches!(
            err,
            CommitError::ParamSize {
                expected: 2,
                actual: 1,
                ..
            }
        ));
    }

    static RELEASED: AtomicUsize = AtomicUsize::new(0);

    struct Counting;

    impl Operation for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }
        fn param_names(&self) -> &'static [&'static str] {
            &["value"]
        }
        fn default_params(&self) -> ParamBlock {
            ParamBlock::new(vec![0.0])
        }
        fn default_priority(&self) -> i32 {
            0
        }
        fn cleanup_execution_state(&self, state: ExecutionState) {
            RELEASED.fetch_add(1, Ordering::SeqCst);
            drop(state);
        }
        fn commit(
            &self,
            params: &ParamBlock,
            _ctx: &PipelineContext,
        ) -> Result<ExecutionState, CommitError> {
            let value = params.get(0).unwrap_or_default();
            if value < 0.0 {
                return Err(CommitError::InvalidParameters {
                    module: "counting".to_string(),
                    reason: "negative".to_string(),
                });
            }
            ExecutionState::new("counting", value)
        }
        fn process(
            &self,
            _state: &ExecutionState,
            input: &InputView<'_>,
            output: &mut OutputTile<'_>,
        ) -> Result<(), StageError> {
            output.fill(|x, y| input.pixel(x, y));
            Ok(())
        }
    }

    #[test]
    fn arena_releases_every_state_on_drop() {
        let mut registry = ModuleRegistry::new();
        let definition = registry.register(Arc::new(Counting)).unwrap();
        let ctx = context();
        let before = RELEASED.load(Ordering::SeqCst);
        {
            let mut arena = StateArena::new(ctx.pipeline);
            let (a, init) = arena.push(Arc::clone(&definition), &ctx);
            init.unwrap();
            let (b, init) = arena.push(Arc::clone(&definition), &ctx);
            init.unwrap();
            // Recommit releases the init state.
            arena.commit(a, &ParamBlock::new(vec![2.0]), &ctx).unwrap();
            // A failed commit releases the old state and leaves the slot empty.
            assert!(arena.commit(b, &ParamBlock::new(vec![-1.0]), &ctx).is_err());
            assert!(arena.get(b).is_none());
            assert!(arena.get(a).is_some());
        }
        assert_eq!(RELEASED.load(Ordering::SeqCst) - before, 3);
    }
}
