//! Pipeline assembly, region propagation, and execution.
//!
//! A [`Pipeline`] binds a [`StackSnapshot`] to one output request. It
//! is assembled in three steps:
//!
//! 1. **Commit.** Every snapshot entry gets a slot in the pipeline's
//!    own [`StateArena`]; a commit failure disables that stage for this
//!    pipeline only.
//! 2. **Plan backward.** Starting from the requested output region,
//!    each active stage reports the input region it needs, which becomes
//!    the previous stage's output region. What is left at the front is
//!    the region the source stage samples.
//! 3. **Verify forward.** Each active stage's output region, computed
//!    from its input region, must equal what the next stage expects.
//!    Any disagreement fails assembly before pixel work begins.
//!
//! [`Pipeline::run`] then samples the source, runs active stages in the
//! order chosen by the backend, and moves buffers from stage to stage.
//! Disabled stages are skipped without copying.

use std::hash::Hasher;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use siphasher::sip::SipHasher13;
use tracing::{debug, debug_span, info, warn};

use crate::backend::{BackendKind, ExecutionBackend, ScheduledStage};
use crate::buffer::{CHANNELS, OutputTile, Pixel, PixelBuffer};
use crate::commit::{PipelineContext, PipelineId, PipelineKind, StateArena};
use crate::diagnostics::{Clock, PipelineDiagnostics, StageDiagnostics, StageStatus};
use crate::instance::{InstanceId, StackSnapshot};
use crate::operation::{ExecutionState, ParamBlock};
use crate::region::Region;
use crate::registry::ModuleDefinition;
use crate::tile::TileExecutor;
use crate::types::{Dimensions, EngineConfig, PipelineError};

/// Module name reported for the source sampling stage.
pub const SOURCE_STAGE: &str = "source";

/// What part of the developed image a pipeline produces.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Target {
    /// The whole developed image at `scale`.
    Full {
        /// Scale relative to full resolution.
        scale: f32,
    },
    /// An explicit region of the developed image.
    Region(Region),
}

/// An output request: what a pipeline is for and what it produces.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PipelineRequest {
    /// Purpose of the pipeline.
    pub kind: PipelineKind,
    /// Requested output.
    pub target: Target,
}

impl PipelineRequest {
    /// Create a request.
    #[must_use]
    pub const fn new(kind: PipelineKind, target: Target) -> Self {
        Self { kind, target }
    }

    /// Whole-image preview at the configured preview scale.
    #[must_use]
    pub const fn preview(config: &EngineConfig) -> Self {
        Self::new(
            PipelineKind::Preview,
            Target::Full {
                scale: config.preview_scale,
            },
        )
    }

    /// Whole-image export at full resolution.
    #[must_use]
    pub const fn export() -> Self {
        Self::new(PipelineKind::Export, Target::Full { scale: 1.0 })
    }

    /// Whole-image thumbnail whose longest side is at most the
    /// configured thumbnail size for a source of `source` pixels.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn thumbnail(config: &EngineConfig, source: Dimensions) -> Self {
        let longest = source.longest_side().max(1);
        let scale = (f64::from(config.thumbnail_size) / f64::from(longest)).min(1.0) as f32;
        Self::new(PipelineKind::Thumbnail, Target::Full { scale })
    }
}

/// Cooperative cancellation flag shared between a pipeline run and its
/// requester.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// A fresh, uncancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Returns `true` once cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// One bound stage of an assembled pipeline.
#[derive(Debug, Clone)]
pub struct Stage {
    instance: InstanceId,
    definition: Arc<ModuleDefinition>,
    params: ParamBlock,
    version: u64,
    enabled: bool,
    commit_error: Option<String>,
    input_region: Region,
    output_region: Region,
}

impl Stage {
    /// Instance the stage was assembled from.
    #[must_use]
    pub const fn instance(&self) -> InstanceId {
        self.instance
    }

    /// Module name.
    #[must_use]
    pub fn module(&self) -> &'static str {
        self.definition.name()
    }

    /// Parameters the stage was committed with.
    #[must_use]
    pub const fn params(&self) -> &ParamBlock {
        &self.params
    }

    /// Instance version the stage was committed from.
    #[must_use]
    pub const fn version(&self) -> u64 {
        self.version
    }

    /// Returns `true` if the stage will process pixels.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.enabled && self.commit_error.is_none()
    }

    /// Region the stage reads.
    #[must_use]
    pub const fn input_region(&self) -> Region {
        self.input_region
    }

    /// Region the stage writes.
    #[must_use]
    pub const fn output_region(&self) -> Region {
        self.output_region
    }

    /// Why the stage does or does not run.
    #[must_use]
    pub fn status(&self) -> StageStatus {
        if !self.enabled {
            StageStatus::Disabled
        } else if let Some(reason) = &self.commit_error {
            StageStatus::CommitFailed {
                reason: reason.clone(),
            }
        } else {
            StageStatus::Ran
        }
    }
}

/// The developed buffer and what it took to produce it.
#[derive(Debug)]
pub struct PipelineOutput {
    /// Developed pixels covering `region`.
    pub buffer: PixelBuffer,
    /// Region of the developed image the buffer covers.
    pub region: Region,
    /// Per-stage diagnostics.
    pub diagnostics: PipelineDiagnostics,
}

/// An assembled pipeline for one output request.
#[derive(Debug)]
pub struct Pipeline {
    id: PipelineId,
    request: PipelineRequest,
    source: Dimensions,
    backend: BackendKind,
    scale: f32,
    stages: Vec<Stage>,
    arena: StateArena,
    source_region: Region,
    output_region: Region,
}

impl Pipeline {
    /// Assemble a pipeline for `request` from `snapshot`, for a source
    /// image of `source` pixels.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::RegionMismatch`] if the requested region
    /// is empty or the scale is unusable, or if stage regions do not
    /// line up. Commit failures do not fail assembly; they disable the
    /// affected stage.
    pub fn assemble(
        snapshot: &StackSnapshot,
        request: PipelineRequest,
        source: Dimensions,
        backend: BackendKind,
    ) -> Result<Self, PipelineError> {
        Self::assemble_with_id(PipelineId::next(), snapshot, request, source, backend)
    }

    fn assemble_with_id(
        id: PipelineId,
        snapshot: &StackSnapshot,
        request: PipelineRequest,
        source: Dimensions,
        backend: BackendKind,
    ) -> Result<Self, PipelineError> {
        let scale = match request.target {
            Target::Full { scale } => scale,
            Target::Region(region) => {
                if region.is_empty() {
                    return Err(PipelineError::RegionMismatch {
                        stage: "output".to_string(),
                        detail: format!("requested region {region} is empty"),
                    });
                }
                region.scale
            }
        };
        if !(scale.is_finite() && scale > 0.0) {
            return Err(PipelineError::RegionMismatch {
                stage: "output".to_string(),
                detail: format!("scale {scale} must be finite and positive"),
            });
        }
        if source.width == 0 || source.height == 0 {
            return Err(PipelineError::RegionMismatch {
                stage: SOURCE_STAGE.to_string(),
                detail: format!("source image is {}x{}", source.width, source.height),
            });
        }

        let ctx = PipelineContext {
            pipeline: id,
            kind: request.kind,
            source,
            scale,
        };
        let mut arena = StateArena::new(id);
        let mut stages = Vec::with_capacity(snapshot.len());
        for entry in snapshot.entries() {
            let (slot, init) = arena.push(Arc::clone(&entry.definition), &ctx);
            let committed = init.and_then(|()| arena.commit(slot, &entry.params, &ctx));
            let commit_error = committed.err().map(|e| {
                warn!(
                    pipeline = %id,
                    module = entry.definition.name(),
                    instance = %entry.instance,
                    error = %e,
                    "commit failed, stage disabled for this pipeline",
                );
                e.to_string()
            });
            stages.push(Stage {
                instance: entry.instance,
                definition: Arc::clone(&entry.definition),
                params: entry.params.clone(),
                version: entry.version,
                enabled: entry.enabled,
                commit_error,
                input_region: Region::new(0, 0, 0, 0, scale),
                output_region: Region::new(0, 0, 0, 0, scale),
            });
        }

        let mut pipeline = Self {
            id,
            request,
            source,
            backend,
            scale,
            stages,
            arena,
            source_region: Region::new(0, 0, 0, 0, scale),
            output_region: Region::new(0, 0, 0, 0, scale),
        };
        pipeline.plan()?;
        debug!(
            pipeline = %id,
            kind = %request.kind,
            stages = pipeline.stages.len(),
            active = pipeline.active_stages().count(),
            output = %pipeline.output_region,
            source = %pipeline.source_region,
            "assembled pipeline",
        );
        Ok(pipeline)
    }

    /// Bring the pipeline up to date with a newer snapshot of the same
    /// stack.
    ///
    /// Stages whose instance version changed are recommitted in place
    /// and regions are planned again. If instances were added, removed,
    /// or reordered, the pipeline is reassembled under the same
    /// identifier. Returns the number of stages recommitted.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::RegionMismatch`] if the new regions do
    /// not line up.
    pub fn sync(&mut self, snapshot: &StackSnapshot) -> Result<usize, PipelineError> {
        let same_shape = snapshot.len() == self.stages.len()
            && snapshot
                .entries()
                .iter()
                .zip(&self.stages)
                .all(|(entry, stage)| entry.instance == stage.instance);
        if !same_shape {
            let rebuilt = Self::assemble_with_id(
                self.id,
                snapshot,
                self.request,
                self.source,
                self.backend,
            )?;
            let count = rebuilt.stages.len();
            *self = rebuilt;
            return Ok(count);
        }

        let ctx = self.context();
        let mut recommitted = 0;
        for (index, (entry, stage)) in snapshot.entries().iter().zip(&mut self.stages).enumerate() {
            if entry.version == stage.version {
                continue;
            }
            stage.params = entry.params.clone();
            stage.enabled = entry.enabled;
            stage.version = entry.version;
            let result = self.arena.commit(index, &stage.params, &ctx);
            stage.commit_error = match result {
                Ok(()) => None,
                Err(e) => {
                    warn!(
                        pipeline = %ctx.pipeline,
                        module = stage.module(),
                        error = %e,
                        "recommit failed, stage disabled for this pipeline",
                    );
                    Some(e.to_string())
                }
            };
            recommitted += 1;
        }
        if recommitted > 0 {
            self.plan()?;
            debug!(pipeline = %self.id, recommitted, "synced pipeline");
        }
        Ok(recommitted)
    }

    fn context(&self) -> PipelineContext {
        PipelineContext {
            pipeline: self.id,
            kind: self.request.kind,
            source: self.source,
            scale: self.scale,
        }
    }

    fn active_stages(&self) -> impl Iterator<Item = (usize, &Stage, &ExecutionState)> {
        self.stages
            .iter()
            .enumerate()
            .filter(|(_, stage)| stage.is_active())
            .filter_map(|(index, stage)| self.arena.get(index).map(|state| (index, stage, state)))
    }

    /// Resolve the output region, walk backward to the source region,
    /// then verify the chain forward.
    fn plan(&mut self) -> Result<(), PipelineError> {
        let output = match self.request.target {
            Target::Region(region) => region,
            Target::Full { scale } => {
                let dims = self
                    .active_stages()
                    .fold(self.source, |dims, (_, stage, state)| {
                        stage.definition.operation().output_dimensions(state, dims)
                    });
                Region::full(dims, scale)
            }
        };
        if output.is_empty() {
            return Err(PipelineError::RegionMismatch {
                stage: "output".to_string(),
                detail: format!("requested region {output} is empty"),
            });
        }

        // Backward: each active stage asks for what it needs.
        let mut desired = output;
        let mut planned = vec![(desired, desired); self.stages.len()];
        for index in (0..self.stages.len()).rev() {
            let stage = &self.stages[index];
            let input = match self.arena.get(index) {
                Some(state) if stage.is_active() => stage
                    .definition
                    .operation()
                    .compute_input_region(state, &desired),
                _ => desired,
            };
            planned[index] = (input, desired);
            desired = input;
        }
        for (stage, (input, output)) in self.stages.iter_mut().zip(planned) {
            stage.input_region = input;
            stage.output_region = output;
        }
        self.source_region = desired;
        self.output_region = output;

        // Forward: every active stage must produce exactly what the next
        // one reads.
        let mut produced = self.source_region;
        if produced.is_empty() {
            return Err(PipelineError::RegionMismatch {
                stage: SOURCE_STAGE.to_string(),
                detail: format!("source region {produced} is empty"),
            });
        }
        for (_, stage, state) in self.active_stages() {
            if stage.input_region != produced {
                return Err(PipelineError::mismatch(
                    stage.module(),
                    &produced,
                    &stage.input_region,
                ));
            }
            let computed = stage
                .definition
                .operation()
                .compute_output_region(state, &stage.input_region);
            if computed != stage.output_region {
                return Err(PipelineError::mismatch(
                    stage.module(),
                    &stage.output_region,
                    &computed,
                ));
            }
            if computed.is_empty() {
                return Err(PipelineError::RegionMismatch {
                    stage: stage.module().to_string(),
                    detail: format!("produces empty region {computed}"),
                });
            }
            produced = computed;
        }
        if produced != self.output_region {
            return Err(PipelineError::mismatch("output", &self.output_region, &produced));
        }
        Ok(())
    }

    /// Develop `source` through the pipeline.
    ///
    /// Tiles already in flight when `cancel` fires run to completion;
    /// their output is then discarded.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::BufferSizeViolation`] if `source` is not
    /// the size the pipeline was assembled for,
    /// [`PipelineError::Cancelled`] if the run was abandoned, or
    /// [`PipelineError::Stage`] if a stage fails.
    pub fn run<C: Clock>(
        &self,
        source: &PixelBuffer,
        executor: &TileExecutor,
        cancel: &CancelToken,
        clock: &C,
    ) -> Result<PipelineOutput, PipelineError> {
        if source.dimensions() != self.source {
            return Err(PipelineError::BufferSizeViolation {
                expected: self.source.width as usize * self.source.height as usize * CHANNELS,
                actual: source.as_slice().len(),
            });
        }
        let span = debug_span!("pipeline", id = %self.id, kind = %self.request.kind);
        let _guard = span.enter();
        let run_start = clock.now();

        let mut diagnostics: Vec<StageDiagnostics> = self
            .stages
            .iter()
            .map(|stage| StageDiagnostics {
                module: stage.module().to_string(),
                instance: Some(stage.instance),
                status: stage.status(),
                duration: std::time::Duration::ZERO,
                tiles: 0,
                input_region: stage.input_region,
                output_region: stage.output_region,
            })
            .collect();

        check_cancel(cancel)?;
        let start = clock.now();
        let (mut buffer, tiles) = executor.fill(self.source_region, |tile, data| {
            let mut out = OutputTile::new(tile, data)?;
            out.fill(|x, y| sample_source(source, tile.scale, x, y));
            Ok(())
        })?;
        let source_diag = StageDiagnostics {
            module: SOURCE_STAGE.to_string(),
            instance: None,
            status: StageStatus::Ran,
            duration: clock.elapsed(&start),
            tiles,
            input_region: Region::full(self.source, 1.0),
            output_region: self.source_region,
        };
        debug!(region = %self.source_region, tiles, "sampled source");

        let scheduled: Vec<ScheduledStage<'_>> = self
            .active_stages()
            .map(|(index, stage, _)| ScheduledStage {
                index,
                module: stage.module(),
                input_region: stage.input_region,
                output_region: stage.output_region,
            })
            .collect();
        let order = self.backend.schedule(self.source_region, &scheduled)?;

        let mut region = self.source_region;
        for index in order {
            check_cancel(cancel)?;
            let (Some(stage), Some(state)) = (self.stages.get(index), self.arena.get(index)) else {
                continue;
            };
            if stage.input_region != region {
                return Err(PipelineError::mismatch(
                    stage.module(),
                    &region,
                    &stage.input_region,
                ));
            }
            let start = clock.now();
            let (next, tiles) = executor.run_stage(
                stage.definition.operation(),
                state,
                &buffer,
                stage.input_region,
                stage.output_region,
            )?;
            buffer = next;
            region = stage.output_region;
            if let Some(diag) = diagnostics.get_mut(index) {
                diag.duration = clock.elapsed(&start);
                diag.tiles = tiles;
            }
            debug!(module = stage.module(), instance = %stage.instance, tiles, "stage done");
        }

        if cancel.is_cancelled() {
            warn!(pipeline = %self.id, "pipeline cancelled, discarding output");
            return Err(PipelineError::Cancelled);
        }

        diagnostics.insert(0, source_diag);
        let diagnostics = PipelineDiagnostics {
            kind: self.request.kind,
            backend: self.backend,
            threads: executor.threads(),
            source: self.source,
            output: self.output_region,
            stages: diagnostics,
            total_duration: clock.elapsed(&run_start),
        };
        info!(
            pipeline = %self.id,
            output = %self.output_region,
            ms = diagnostics.total_duration.as_secs_f64() * 1000.0,
            "pipeline finished",
        );
        Ok(PipelineOutput {
            buffer,
            region,
            diagnostics,
        })
    }

    /// Stable key over image identity, output region, and every active
    /// stage's committed state.
    #[must_use]
    pub fn cache_key(&self, image: &str) -> u64 {
        let mut hasher = SipHasher13::new_with_keys(0, 0);
        hasher.write(image.as_bytes());
        hasher.write_u8(0xff);
        let r = self.output_region;
        hasher.write_i32(r.x);
        hasher.write_i32(r.y);
        hasher.write_u32(r.width);
        hasher.write_u32(r.height);
        hasher.write_u32(r.scale.to_bits());
        for (_, stage, state) in self.active_stages() {
            hasher.write(stage.module().as_bytes());
            hasher.write_u64(state.fingerprint());
        }
        hasher.finish()
    }

    /// Pipeline identifier.
    #[must_use]
    pub const fn id(&self) -> PipelineId {
        self.id
    }

    /// The request the pipeline was assembled for.
    #[must_use]
    pub const fn request(&self) -> PipelineRequest {
        self.request
    }

    /// Purpose of the pipeline.
    #[must_use]
    pub const fn kind(&self) -> PipelineKind {
        self.request.kind
    }

    /// Backend that schedules stages.
    #[must_use]
    pub const fn backend(&self) -> BackendKind {
        self.backend
    }

    /// Full-resolution size of the source image.
    #[must_use]
    pub const fn source_dimensions(&self) -> Dimensions {
        self.source
    }

    /// Region the source stage samples.
    #[must_use]
    pub const fn source_region(&self) -> Region {
        self.source_region
    }

    /// Region of the developed output.
    #[must_use]
    pub const fn output_region(&self) -> Region {
        self.output_region
    }

    /// All stages in execution order, active or not.
    #[must_use]
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Committed state of stage `index`.
    #[must_use]
    pub fn state(&self, index: usize) -> Option<&ExecutionState> {
        self.arena.get(index)
    }
}

fn check_cancel(cancel: &CancelToken) -> Result<(), PipelineError> {
    if cancel.is_cancelled() {
        Err(PipelineError::Cancelled)
    } else {
        Ok(())
    }
}

/// Sample the full-resolution `source` at pixel `(x, y)` of a view at
/// `scale`: box filter over the pixel's footprint when downscaling,
/// nearest neighbour otherwise. Addresses clamp to the image edge.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss
)]
fn sample_source(source: &PixelBuffer, scale: f32, x: i64, y: i64) -> Pixel {
    let max_x = i64::from(source.width()) - 1;
    let max_y = i64::from(source.height()) - 1;
    let inv = 1.0 / f64::from(scale);
    let at = |sx: i64, sy: i64| {
        let cx = sx.clamp(0, max_x) as u32;
        let cy = sy.clamp(0, max_y) as u32;
        source.pixel(cx, cy).unwrap_or([0.0; CHANNELS])
    };
    if scale >= 1.0 {
        let sx = ((x as f64 + 0.5) * inv).floor() as i64;
        let sy = ((y as f64 + 0.5) * inv).floor() as i64;
        return at(sx, sy);
    }
    let x0 = (x as f64 * inv).floor() as i64;
    let y0 = (y as f64 * inv).floor() as i64;
    let x1 = (((x + 1) as f64 * inv).floor() as i64).max(x0 + 1);
    let y1 = (((y + 1) as f64 * inv).floor() as i64).max(y0 + 1);
    let mut sum = [0.0_f32; CHANNELS];
    for sy in y0..y1 {
        for sx in x0..x1 {
            for (acc, v) in sum.iter_mut().zip(at(sx, sy)) {
                *acc += v;
            }
        }
    }
    let count = ((x1 - x0) * (y1 - y0)) as f32;
    sum.map(|v| v / count)
}
