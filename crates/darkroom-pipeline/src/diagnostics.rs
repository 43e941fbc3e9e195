//! Pipeline diagnostics: timing, tile counts, and regions for each stage.
//!
//! Every call to [`Pipeline::run`](crate::Pipeline::run) collects
//! diagnostics alongside the developed buffer. Time is read through the
//! injectable [`Clock`] trait; [`SystemClock`] captures timestamps via
//! the `web-time` crate, which uses `performance.now()` on WASM and
//! `std::time::Instant` on native.
//!
//! Durations are serialized as fractional seconds (`f64`) for JSON
//! compatibility, since `std::time::Duration` does not implement serde
//! traits.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::BackendKind;
use crate::commit::PipelineKind;
use crate::instance::InstanceId;
use crate::region::Region;
use crate::types::Dimensions;

/// Source of timestamps for diagnostics.
pub trait Clock {
    /// Opaque point in time.
    type Instant;

    /// The current instant.
    fn now(&self) -> Self::Instant;

    /// Time elapsed since `since`.
    fn elapsed(&self, since: &Self::Instant) -> Duration;
}

/// [`Clock`] backed by [`web_time::Instant`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    type Instant = web_time::Instant;

    fn now(&self) -> web_time::Instant {
        web_time::Instant::now()
    }

    fn elapsed(&self, since: &web_time::Instant) -> Duration {
        since.elapsed()
    }
}

/// Serde support for `std::time::Duration` as fractional seconds.
mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    /// Serialize a `Duration` as fractional seconds (`f64`).
    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        duration.as_secs_f64().serialize(serializer)
    }

    /// Deserialize a `Duration` from fractional seconds (`f64`).
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(|_| {
            serde::de::Error::custom(
                "duration seconds must be finite, non-negative, and representable as a Duration",
            )
        })
    }
}

/// What happened to a stage during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageStatus {
    /// The stage processed pixels.
    Ran,
    /// The instance is disabled; the buffer passed through.
    Disabled,
    /// Commit failed; the stage was skipped for this pipeline.
    CommitFailed {
        /// Commit error message.
        reason: String,
    },
}

/// Diagnostics for a single stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDiagnostics {
    /// Module name, or `source` for the sampling stage.
    pub module: String,
    /// Instance the stage was assembled from (`None` for the source).
    pub instance: Option<InstanceId>,
    /// Outcome.
    pub status: StageStatus,
    /// Wall-clock duration (seconds).
    #[serde(with = "duration_serde")]
    pub duration: Duration,
    /// Number of tiles the stage was split into.
    pub tiles: usize,
    /// Region read.
    pub input_region: Region,
    /// Region written.
    pub output_region: Region,
}

/// Diagnostics collected from a single pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDiagnostics {
    /// Purpose of the pipeline.
    pub kind: PipelineKind,
    /// Backend that scheduled the stages.
    pub backend: BackendKind,
    /// Worker threads in the executor.
    pub threads: usize,
    /// Full-resolution size of the source image.
    pub source: Dimensions,
    /// Region of the developed output.
    pub output: Region,
    /// Per-stage diagnostics, source first, in pipeline order.
    pub stages: Vec<StageDiagnostics>,
    /// Total wall-clock duration of the run (seconds).
    #[serde(with = "duration_serde")]
    pub total_duration: Duration,
}

impl PipelineDiagnostics {
    /// Stages that processed pixels.
    pub fn ran(&self) -> impl Iterator<Item = &StageDiagnostics> {
        self.stages.iter().filter(|s| s.status == StageStatus::Ran)
    }

    /// Format diagnostics as a human-readable report.
    #[must_use]
    pub fn report(&self) -> String {
        let mut lines = Vec::new();

        lines.push(format!("Pipeline Diagnostics Report\n{}", "=".repeat(60)));
        lines.push(format!(
            "Kind: {}  |  Backend: {:?}  |  Threads: {}",
            self.kind, self.backend, self.threads,
        ));
        lines.push(format!(
            "Source: {}x{}  |  Output: {}",
            self.source.width, self.source.height, self.output,
        ));
        lines.push(format!(
            "Total duration: {:.3}ms",
            duration_ms(self.total_duration),
        ));
        lines.push(String::new());

        lines.push(format!(
            "{:<16} {:>10} {:>9} {:>6}  {}",
            "Stage", "Duration", "% Total", "Tiles", "Details"
        ));
        lines.push("-".repeat(80));

        let total_ms = duration_ms(self.total_duration);
        for stage in &self.stages {
            let ms = duration_ms(stage.duration);
            let pct = if total_ms > 0.0 {
                ms / total_ms * 100.0
            } else {
                0.0
            };
            let name = stage.instance.map_or_else(
                || stage.module.clone(),
                |id| format!("{} {id}", stage.module),
            );
            lines.push(format!(
                "{name:<16} {ms:>8.3}ms {pct:>8.1}% {:>6}  {}",
                stage.tiles,
                format_details(stage),
            ));
        }

        lines.join("\n")
    }
}

/// Convert a `Duration` to milliseconds as `f64`.
fn duration_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

fn format_details(stage: &StageDiagnostics) -> String {
    match &stage.status {
        StageStatus::Ran => {
            if stage.input_region == stage.output_region {
                format!("{}", stage.output_region)
            } else {
                format!("{} -> {}", stage.input_region, stage.output_region)
            }
        }
        StageStatus::Disabled => "disabled".to_string(),
        StageStatus::CommitFailed { reason } => format!("skipped: {reason}"),
    }
}
