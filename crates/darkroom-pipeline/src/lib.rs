//! darkroom-pipeline: non-destructive image-operation pipeline (sans-IO).
//!
//! A user's edits are an ordered stack of parameterized operations.
//! This crate replays that stack against in-memory pixel data to
//! produce a developed image at any requested region and scale:
//!
//! registry -> instances -> snapshot -> commit -> region planning ->
//! tiled execution.
//!
//! This crate has **no I/O dependencies** -- it operates on in-memory
//! float buffers and returns structured data. Image decoding, encoding
//! and durable metadata storage live in `darkroom-bench`.
//!
//! # Example
//!
//! ```
//! use darkroom_pipeline::{CancelToken, ContextBuilder, PixelBuffer, PipelineRequest};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut ctx = ContextBuilder::new("example.raw").build()?;
//! let exposure = ctx.edit(|s| s.add_module("exposure"))?;
//! ctx.edit(|s| s.set_param(exposure, "ev", 1.0))?;
//!
//! let source = PixelBuffer::from_fn(4, 4, |_, _| [0.25, 0.25, 0.25]);
//! let out = ctx.develop(&source, PipelineRequest::export(), &CancelToken::new())?;
//! assert_eq!(out.buffer.pixel(0, 0), Some([0.5, 0.5, 0.5]));
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod buffer;
pub mod commit;
pub mod context;
pub mod diagnostics;
pub mod history;
pub mod instance;
pub mod operation;
pub mod ops;
pub mod pipeline;
pub mod region;
pub mod registry;
pub mod session;
pub mod store;
pub mod tile;
pub mod types;

pub use backend::{BackendKind, ExecutionBackend};
pub use buffer::{CHANNELS, InputView, OutputTile, Pixel, PixelBuffer};
pub use commit::{PipelineContext, PipelineId, PipelineKind, StateArena, commit};
pub use context::{ContextBuilder, ContextError, DevelopContext, SharedStore};
pub use diagnostics::{Clock, PipelineDiagnostics, StageDiagnostics, StageStatus, SystemClock};
pub use history::{HistoryItem, HistoryStack, ParamState};
pub use instance::{EditStack, InstanceId, ModuleInstance, SnapshotEntry, StackSnapshot};
pub use operation::{ExecutionState, Operation, OperationKind, ParamBlock};
pub use pipeline::{CancelToken, Pipeline, PipelineOutput, PipelineRequest, Stage, Target};
pub use region::Region;
pub use registry::{ModuleDefinition, ModuleRegistry};
pub use session::{EditEvent, EditSession, SessionError, SessionEvent};
pub use store::{MemoryStore, MetadataStore, PersistedEdit, PersistedInstance, StoreError};
pub use tile::{TileExecutor, Tiling};
pub use types::{
    CommitError, Dimensions, EngineConfig, PipelineError, RegistryError, StageError,
};
