//! Tiled parallel execution of one stage.
//!
//! A stage's output region is split into horizontal bands that map to
//! disjoint, contiguous slices of the output buffer. Bands run on the
//! executor's own `rayon` pool; the stage completes when every band
//! has. Each band reads through a window of the input expanded by the
//! stage's halo, so the result does not depend on how the region was
//! split.

use std::num::NonZeroUsize;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::buffer::{CHANNELS, OutputTile, PixelBuffer};
use crate::operation::{ExecutionState, Operation};
use crate::region::Region;
use crate::types::{EngineConfig, PipelineError};

/// How a stage's output region is split into tiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Tiling {
    /// Bands of a fixed number of rows (the last band may be shorter).
    RowBands {
        /// Rows per band.
        rows: u32,
    },
    /// A fixed number of bands of roughly equal height.
    Count(u32),
}

impl Tiling {
    /// Rows per band for a region `height` rows tall.
    #[must_use]
    pub fn rows_per_band(&self, height: u32) -> u32 {
        match *self {
            Self::RowBands { rows } => rows.max(1),
            Self::Count(n) => height.div_ceil(n.max(1)).max(1),
        }
    }
}

impl Default for Tiling {
    fn default() -> Self {
        Self::RowBands {
            rows: EngineConfig::DEFAULT_TILE_ROWS,
        }
    }
}

/// Runs stages tile by tile on a dedicated thread pool.
pub struct TileExecutor {
    pool: rayon::ThreadPool,
    tiling: Tiling,
    threads: usize,
}

impl TileExecutor {
    /// Build an executor with `threads` workers (`0` = hardware
    /// concurrency).
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Executor`] if the pool cannot be built.
    pub fn new(threads: usize, tiling: Tiling) -> Result<Self, PipelineError> {
        let threads = if threads == 0 {
            std::thread::available_parallelism().map_or(1, NonZeroUsize::get)
        } else {
            threads
        };
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("darkroom-tile-{i}"))
            .build()
            .map_err(|e| PipelineError::Executor(e.to_string()))?;
        Ok(Self {
            pool,
            tiling,
            threads,
        })
    }

    /// Build an executor from engine configuration.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] if the configuration is
    /// invalid, or [`PipelineError::Executor`] if the pool cannot be
    /// built.
    pub fn from_config(config: &EngineConfig) -> Result<Self, PipelineError> {
        config.validate()?;
        Self::new(
            config.threads,
            Tiling::RowBands {
                rows: config.tile_rows,
            },
        )
    }

    /// The same pool with a different tiling policy.
    #[must_use]
    pub const fn with_tiling(mut self, tiling: Tiling) -> Self {
        self.tiling = tiling;
        self
    }

    /// Current tiling policy.
    #[must_use]
    pub const fn tiling(&self) -> Tiling {
        self.tiling
    }

    /// Number of worker threads.
    #[must_use]
    pub const fn threads(&self) -> usize {
        self.threads
    }

    /// Allocate a buffer for `region` and let `f` fill each tile in
    /// parallel. Returns the buffer and the number of tiles.
    ///
    /// # Errors
    ///
    /// Returns the first error any tile reported. Other tiles still run
    /// to completion or are skipped; the buffer is discarded.
    pub fn fill<F>(&self, region: Region, f: F) -> Result<(PixelBuffer, usize), PipelineError>
    where
        F: Fn(Region, &mut [f32]) -> Result<(), PipelineError> + Sync,
    {
        let mut buffer = PixelBuffer::new(region.width, region.height);
        let rows = self.tiling.rows_per_band(region.height);
        let chunk = rows as usize * region.width as usize * CHANNELS;
        if chunk == 0 || region.is_empty() {
            return Ok((buffer, 0));
        }
        let tiles = buffer.as_slice().len().div_ceil(chunk);
        self.pool.install(|| {
            buffer
                .as_mut_slice()
                .par_chunks_mut(chunk)
                .enumerate()
                .try_for_each(|(index, data)| {
                    let offset = u32::try_from(index)
                        .unwrap_or(u32::MAX)
                        .saturating_mul(rows);
                    f(region.band(offset, rows), data)
                })
        })?;
        Ok((buffer, tiles))
    }

    /// Run `operation` over `output_region`, reading `input`, which
    /// covers `input_region`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::BufferSizeViolation`] if `input` does not
    /// match `input_region`, or [`PipelineError::Stage`] if processing
    /// fails.
    pub fn run_stage(
        &self,
        operation: &dyn Operation,
        state: &ExecutionState,
        input: &PixelBuffer,
        input_region: Region,
        output_region: Region,
    ) -> Result<(PixelBuffer, usize), PipelineError> {
        let halo = operation.halo(state);
        self.fill(output_region, |tile, data| {
            let window = operation
                .compute_input_region(state, &tile)
                .expand(halo)
                .intersect(&input_region)
                .unwrap_or(input_region);
            let view = input.view(input_region, window)?;
            let mut out = OutputTile::new(tile, data)?;
            trace!(module = operation.name(), %tile, %window, "tile");
            operation
                .process(state, &view, &mut out)
                .map_err(|source| PipelineError::Stage {
                    module: operation.name().to_string(),
                    source,
                })
        })
    }
}

impl std::fmt::Debug for TileExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileExecutor")
            .field("tiling", &self.tiling)
            .field("threads", &self.threads)
            .finish_non_exhaustive()
    }
}
