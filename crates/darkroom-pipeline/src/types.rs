//! Shared types for the darkroom pipeline: dimensions, engine
//! configuration, and the error taxonomy.

use serde::{Deserialize, Serialize};

use crate::backend::BackendKind;
use crate::region::Region;

/// Image dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dimensions {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Dimensions {
    /// Create new dimensions.
    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// The longer of the two sides.
    #[must_use]
    pub const fn longest_side(&self) -> u32 {
        if self.width > self.height {
            self.width
        } else {
            self.height
        }
    }
}

/// Configuration for the execution engine.
///
/// All fields have defaults; [`EngineConfig::validate`] checks the
/// invariants the executor and request builders rely on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker threads for the tile executor. `0` sizes the pool to the
    /// available hardware concurrency.
    pub threads: usize,

    /// Rows per tile band. Smaller bands balance work better across
    /// workers; larger bands reduce halo overhead for spatial stages.
    pub tile_rows: u32,

    /// Which execution backend drives the stages.
    pub backend: BackendKind,

    /// Scale of interactive preview pipelines relative to full
    /// resolution, in `(0.0, 1.0]`.
    pub preview_scale: f32,

    /// Longest side of thumbnail output in pixels.
    pub thumbnail_size: u32,
}

impl EngineConfig {
    /// Default worker count (auto).
    pub const DEFAULT_THREADS: usize = 0;
    /// Default rows per tile band.
    pub const DEFAULT_TILE_ROWS: u32 = 64;
    /// Default preview scale.
    pub const DEFAULT_PREVIEW_SCALE: f32 = 0.25;
    /// Default thumbnail size.
    pub const DEFAULT_THUMBNAIL_SIZE: u32 = 256;

    /// Check the configuration invariants.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] when `tile_rows` or
    /// `thumbnail_size` is zero, or `preview_scale` is outside
    /// `(0.0, 1.0]`.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.tile_rows == 0 {
            return Err(PipelineError::InvalidConfig(
                "tile_rows must be at least 1".to_string(),
            ));
        }
        if !(self.preview_scale > 0.0 && self.preview_scale <= 1.0) {
            return Err(PipelineError::InvalidConfig(format!(
                "preview_scale must be in (0, 1], got {}",
                self.preview_scale
            )));
        }
        if self.thumbnail_size == 0 {
            return Err(PipelineError::InvalidConfig(
                "thumbnail_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            threads: Self::DEFAULT_THREADS,
            tile_rows: Self::DEFAULT_TILE_ROWS,
            backend: BackendKind::default(),
            preview_scale: Self::DEFAULT_PREVIEW_SCALE,
            thumbnail_size: Self::DEFAULT_THUMBNAIL_SIZE,
        }
    }
}

/// Errors raised by the module registry.
///
/// These are fatal to the requested registration or instantiation, and
/// fatal to startup when raised while registering the built-in set.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    /// No module with this name is registered.
    #[error("unknown module `{0}`")]
    UnknownModule(String),

    /// A module with this name is already registered.
    #[error("module `{0}` is already registered")]
    DuplicateModule(String),

    /// The definition's default parameter block does not match its
    /// declared parameter names.
    #[error("module `{module}` declares {names} parameters but its default block has {values}")]
    InvalidDefinition {
        /// Module name.
        module: String,
        /// Number of declared parameter names.
        names: usize,
        /// Number of values in the default block.
        values: usize,
    },
}

/// A module's commit step could not produce execution state.
///
/// The owning stage is disabled for that pipeline; the pipeline still
/// runs the remaining stages.
#[derive(Debug, thiserror::Error)]
pub enum CommitError {
    /// The parameter values are outside what the module accepts.
    #[error("invalid parameters for `{module}`: {reason}")]
    InvalidParameters {
        /// Module name.
        module: String,
        /// Human-readable reason.
        reason: String,
    },

    /// The parameter block has the wrong number of values.
    #[error("parameter block for `{module}` has {actual} values, expected {expected}")]
    ParamSize {
        /// Module name.
        module: String,
        /// Size declared by the module definition.
        expected: usize,
        /// Size of the block that was passed.
        actual: usize,
    },

    /// The state was produced by a different module than the one
    /// being committed.
    #[error("module `{module}` produced state tagged `{produced}`")]
    ForeignState {
        /// Module being committed.
        module: String,
        /// Tag on the produced state.
        produced: String,
    },

    /// The state payload could not be canonically encoded.
    #[error("failed to encode state for `{module}`: {source}")]
    Encode {
        /// Module name.
        module: String,
        /// Underlying serialization error.
        source: serde_json::Error,
    },
}

/// Errors raised inside a stage's pixel processing.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StageError {
    /// The execution state handed to the stage belongs to another
    /// module kind.
    #[error("execution state for `{found}` passed to `{expected}`")]
    StateMismatch {
        /// Module that received the state.
        expected: String,
        /// Module that produced it.
        found: String,
    },
}

/// Errors that can occur while assembling or running a pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// A stage's regions do not line up with its neighbours, or the
    /// requested region is unusable. Raised before any pixel work runs.
    #[error("region mismatch at `{stage}`: {detail}")]
    RegionMismatch {
        /// Stage (module name) or `output` for the requested region.
        stage: String,
        /// What did not match.
        detail: String,
    },

    /// A buffer did not have the size its region requires.
    #[error("buffer size violation: expected {expected} values, got {actual}")]
    BufferSizeViolation {
        /// Expected number of `f32` values.
        expected: usize,
        /// Actual number of `f32` values.
        actual: usize,
    },

    /// A stage failed while processing pixels.
    #[error("stage `{module}` failed: {source}")]
    Stage {
        /// Module name.
        module: String,
        /// Underlying stage error.
        source: StageError,
    },

    /// The pipeline was abandoned; its output was discarded.
    #[error("pipeline was cancelled")]
    Cancelled,

    /// Engine configuration is invalid.
    #[error("invalid engine configuration: {0}")]
    InvalidConfig(String),

    /// The executor could not be set up or failed to schedule work.
    #[error("executor error: {0}")]
    Executor(String),
}

impl PipelineError {
    /// Build a [`PipelineError::RegionMismatch`] for two regions that
    /// should have been equal.
    #[must_use]
    pub fn mismatch(stage: &str, expected: &Region, actual: &Region) -> Self {
        Self::RegionMismatch {
            stage: stage.to_string(),
            detail: format!("expected {expected}, got {actual}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.threads, 0);
        assert_eq!(config.tile_rows, 64);
        assert_eq!(config.backend, BackendKind::Direct);
        assert!((config.preview_scale - 0.25).abs() < f32::EPSILON);
        assert_eq!(config.thumbnail_size, 256);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_tile_rows_is_invalid() {
        let config = EngineConfig {
            tile_rows: 0,
            ..EngineConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(PipelineError::InvalidConfig(_))
        ));
    }

    #[test]
    fn preview_scale_bounds() {
        for scale in [0.0, -0.5, 1.5, f32::NAN] {
            let config = EngineConfig {
                preview_scale: scale,
                ..EngineConfig::default()
            };
            assert!(config.validate().is_err(), "scale {scale} accepted");
        }
        let config = EngineConfig {
            preview_scale: 1.0,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn engine_config_partial_json_uses_defaults() {
        let config: EngineConfig = serde_json::from_str(r#"{"tile_rows": 8}"#).unwrap();
        assert_eq!(config.tile_rows, 8);
        assert_eq!(config.thumbnail_size, EngineConfig::DEFAULT_THUMBNAIL_SIZE);
    }

    #[test]
    fn region_mismatch_display() {
        let err = PipelineError::mismatch(
            "crop",
            &Region::new(0, 0, 4, 4, 1.0),
            &Region::new(1, 0, 4, 4, 1.0),
        );
        assert_eq!(
            err.to_string(),
            "region mismatch at `crop`: expected 4x4@(0,0) scale 1, got 4x4@(1,0) scale 1",
        );
    }

    #[test]
    fn longest_side() {
        assert_eq!(Dimensions::new(3, 9).longest_side(), 9);
        assert_eq!(Dimensions::new(12, 9).longest_side(), 12);
    }

    #[test]
    fn registry_error_display() {
        assert_eq!(
            RegistryError::UnknownModule("vignette".to_string()).to_string(),
            "unknown module `vignette`",
        );
        assert_eq!(
            RegistryError::DuplicateModule("exposure".to_string()).to_string(),
            "module `exposure` is already registered",
        );
    }
}
