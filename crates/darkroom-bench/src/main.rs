//! darkroom-bench: develop an image through the pipeline and report
//! per-stage diagnostics.
//!
//! Applies a list of edits to an image's session, runs a preview,
//! export, or thumbnail pipeline, and prints timing and region details
//! for every stage. Useful for:
//!
//! - Checking that tiling and backend choice do not change output
//! - Measuring per-stage durations to identify bottlenecks
//! - Inspecting how each stage maps regions back to the source
//!
//! # Usage
//!
//! ```text
//! cargo run --release --bin darkroom-bench -- [OPTIONS] [IMAGE_PATH]
//! ```

#![allow(clippy::print_stdout, clippy::print_stderr)]

mod logging;
mod store;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::str::FromStr;

use clap::{Parser, ValueEnum};
use darkroom_pipeline::{
    BackendKind, CancelToken, ContextBuilder, ContextError, DevelopContext, Dimensions,
    EngineConfig, PipelineDiagnostics, PipelineRequest, PixelBuffer,
};
use tracing::info;

use crate::store::JsonFileStore;

/// Develop an image through the darkroom pipeline and print diagnostics.
///
/// Either an image file or `--synthetic WIDTHxHEIGHT` provides the
/// source pixels.
#[derive(Parser)]
#[command(name = "darkroom-bench", version)]
struct Cli {
    /// Path to the input image (PNG, JPEG, TIFF, WebP).
    #[arg(required_unless_present = "synthetic")]
    image_path: Option<PathBuf>,

    /// Use a generated gradient of this size instead of an image file.
    #[arg(long, value_name = "WIDTHxHEIGHT", conflicts_with = "image_path")]
    synthetic: Option<Size>,

    /// Edit to apply, as `module.param=value`. Repeatable. The module is
    /// added to the stack if no instance of it exists yet.
    #[arg(long = "edit", value_name = "MODULE.PARAM=VALUE")]
    edits: Vec<ParamEdit>,

    /// Module to enable. Repeatable.
    #[arg(long = "enable", value_name = "MODULE")]
    enable: Vec<String>,

    /// Module to disable. Repeatable.
    #[arg(long = "disable", value_name = "MODULE")]
    disable: Vec<String>,

    /// Which pipeline to run.
    #[arg(long, value_enum, default_value_t = Kind::Export)]
    kind: Kind,

    /// Execution backend.
    #[arg(long, value_enum, default_value_t = Backend::Direct)]
    backend: Backend,

    /// Tile executor threads (0 = available parallelism).
    #[arg(long, default_value_t = EngineConfig::DEFAULT_THREADS)]
    threads: usize,

    /// Rows per tile band.
    #[arg(
        long,
        default_value_t = EngineConfig::DEFAULT_TILE_ROWS,
        value_parser = clap::builder::RangedU64ValueParser::<u32>::new().range(1..),
    )]
    tile_rows: u32,

    /// Preview scale relative to full resolution.
    #[arg(long, default_value_t = EngineConfig::DEFAULT_PREVIEW_SCALE)]
    preview_scale: f32,

    /// Longest thumbnail side in pixels.
    #[arg(long, default_value_t = EngineConfig::DEFAULT_THUMBNAIL_SIZE)]
    thumbnail_size: u32,

    /// Full engine config as a JSON string.
    ///
    /// When provided, the individual engine flags are ignored.
    #[arg(long)]
    config_json: Option<String>,

    /// Persist the edit session in this JSON file and resume from it.
    #[arg(long)]
    session: Option<PathBuf>,

    /// Write the developed image (8-bit PNG) to this path.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Number of runs for averaging.
    #[arg(
        long,
        default_value_t = 1,
        value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..),
    )]
    runs: usize,

    /// Output diagnostics as JSON instead of a human-readable report.
    #[arg(long)]
    json: bool,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// Pipeline kind selection.
#[derive(Clone, Copy, ValueEnum)]
enum Kind {
    /// Reduced-scale interactive preview.
    Preview,
    /// Full-resolution export.
    Export,
    /// Small thumbnail.
    Thumbnail,
}

/// Execution backend selection.
#[derive(Clone, Copy, ValueEnum)]
enum Backend {
    /// Run stages in priority order.
    Direct,
    /// Schedule stages through an operator graph.
    Graph,
}

/// `WIDTHxHEIGHT`.
#[derive(Debug, Clone, Copy)]
struct Size(Dimensions);

impl FromStr for Size {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s
            .split_once(['x', 'X'])
            .ok_or_else(|| format!("expected WIDTHxHEIGHT, got `{s}`"))?;
        let parse = |v: &str| {
            v.trim()
                .parse::<u32>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| format!("invalid dimension `{v}`"))
        };
        Ok(Self(Dimensions::new(parse(w)?, parse(h)?)))
    }
}

/// `module.param=value`.
#[derive(Debug, Clone, PartialEq)]
struct ParamEdit {
    module: String,
    param: String,
    value: f32,
}

impl FromStr for ParamEdit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (target, value) = s
            .split_once('=')
            .ok_or_else(|| format!("expected MODULE.PARAM=VALUE, got `{s}`"))?;
        let (module, param) = target
            .split_once('.')
            .ok_or_else(|| format!("expected MODULE.PARAM, got `{target}`"))?;
        let value = value
            .trim()
            .parse::<f32>()
            .map_err(|e| format!("invalid value `{value}`: {e}"))?;
        Ok(Self {
            module: module.trim().to_string(),
            param: param.trim().to_string(),
            value,
        })
    }
}

/// Errors surfaced to the user.
#[derive(Debug, thiserror::Error)]
enum BenchError {
    #[error("error parsing --config-json: {0}")]
    ConfigJson(#[source] serde_json::Error),

    #[error("error reading {path}: {source}")]
    Decode {
        path: PathBuf,
        source: image::ImageError,
    },

    #[error("error writing {path}: {source}")]
    Encode {
        path: PathBuf,
        source: image::ImageError,
    },

    #[error("error serializing diagnostics: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error("developed image has an invalid buffer")]
    Buffer,
}

/// Build an [`EngineConfig`] from CLI arguments.
///
/// If `--config-json` is provided, the JSON is parsed directly and the
/// individual engine flags are ignored.
fn config_from_cli(cli: &Cli) -> Result<EngineConfig, BenchError> {
    if let Some(ref json) = cli.config_json {
        return serde_json::from_str(json).map_err(BenchError::ConfigJson);
    }

    Ok(EngineConfig {
        threads: cli.threads,
        tile_rows: cli.tile_rows,
        backend: match cli.backend {
            Backend::Direct => BackendKind::Direct,
            Backend::Graph => BackendKind::Graph,
        },
        preview_scale: cli.preview_scale,
        thumbnail_size: cli.thumbnail_size,
    })
}

fn load_source(cli: &Cli) -> Result<(String, PixelBuffer), BenchError> {
    if let Some(Size(dims)) = cli.synthetic {
        let name = format!("synthetic-{}x{}", dims.width, dims.height);
        return Ok((name, gradient(dims)));
    }
    // Clap guarantees one of the two is present.
    let path = cli.image_path.clone().unwrap_or_default();
    let decoded = image::open(&path).map_err(|source| BenchError::Decode {
        path: path.clone(),
        source,
    })?;
    let rgb = decoded.to_rgb32f();
    let (width, height) = rgb.dimensions();
    let buffer = PixelBuffer::from_raw(width, height, rgb.into_raw())
        .map_err(|e| BenchError::Context(e.into()))?;
    Ok((path.display().to_string(), buffer))
}

#[allow(clippy::cast_precision_loss)]
fn gradient(dims: Dimensions) -> PixelBuffer {
    let (w, h) = (dims.width as f32, dims.height as f32);
    PixelBuffer::from_fn(dims.width, dims.height, |x, y| {
        let fx = x as f32 / w;
        let fy = y as f32 / h;
        [fx, fy, 1.0 - 0.5 * (fx + fy)]
    })
}

fn build_context(
    cli: &Cli,
    image: &str,
    config: EngineConfig,
) -> Result<DevelopContext, BenchError> {
    let builder = ContextBuilder::new(image).config(config);
    let builder = match cli.session {
        Some(ref path) => {
            let store = JsonFileStore::open(path).map_err(ContextError::from)?;
            eprintln!("Session: {}", store.path().display());
            builder.store(store)
        }
        None => builder,
    };
    let mut ctx = builder.build()?;

    for edit in &cli.edits {
        let id = instance_for(&mut ctx, &edit.module)?;
        ctx.edit(|s| s.set_param(id, &edit.param, edit.value))?;
    }
    for module in &cli.enable {
        let id = instance_for(&mut ctx, module)?;
        ctx.edit(|s| s.set_enabled(id, true))?;
    }
    for module in &cli.disable {
        let id = instance_for(&mut ctx, module)?;
        ctx.edit(|s| s.set_enabled(id, false))?;
    }
    Ok(ctx)
}

/// The first instance of `module`, adding one if the stack has none.
fn instance_for(
    ctx: &mut DevelopContext,
    module: &str,
) -> Result<darkroom_pipeline::InstanceId, ContextError> {
    let existing = ctx
        .session()
        .stack()
        .iter()
        .find(|i| i.name() == module)
        .map(darkroom_pipeline::ModuleInstance::id);
    match existing {
        Some(id) => Ok(id),
        None => ctx.edit(|s| s.add_module(module)),
    }
}

fn write_png(path: &Path, buffer: PixelBuffer) -> Result<(), BenchError> {
    let (width, height) = (buffer.width(), buffer.height());
    let rgb = image::Rgb32FImage::from_raw(width, height, buffer.into_raw())
        .ok_or(BenchError::Buffer)?;
    image::DynamicImage::ImageRgb32F(rgb)
        .to_rgb8()
        .save(path)
        .map_err(|source| BenchError::Encode {
            path: path.to_path_buf(),
            source,
        })
}

fn run(cli: &Cli) -> Result<(), BenchError> {
    let config = config_from_cli(cli)?;
    let (image, source) = load_source(cli)?;
    let ctx = build_context(cli, &image, config)?;

    let request = match cli.kind {
        Kind::Preview => ctx.preview_request(),
        Kind::Export => PipelineRequest::export(),
        Kind::Thumbnail => ctx.thumbnail_request(source.dimensions()),
    };

    eprintln!(
        "Image: {image} ({}x{})",
        source.width(),
        source.height()
    );
    eprintln!("Config: {:#?}", ctx.config());
    eprintln!("Stack:");
    for instance in ctx.session().stack().ordered() {
        eprintln!(
            "  {:<14} {:>5} {:<8} {:?}",
            instance.name(),
            instance.priority(),
            if instance.enabled() { "on" } else { "off" },
            instance.params().as_slice(),
        );
    }
    eprintln!("Runs: {}", cli.runs);
    eprintln!();

    let cancel = CancelToken::new();
    let mut all_diagnostics = Vec::with_capacity(cli.runs);

    for run in 0..cli.runs {
        if cli.runs > 1 {
            eprintln!("--- Run {}/{} ---", run + 1, cli.runs);
        }

        let output = ctx.develop(&source, request, &cancel).map_err(ContextError::from)?;
        if cli.json {
            println!("{}", serde_json::to_string_pretty(&output.diagnostics)?);
        } else {
            println!("{}", output.diagnostics.report());
        }

        // Write the image on the first run only.
        if run == 0
            && let Some(ref path) = cli.output
        {
            write_png(path, output.buffer)?;
            info!(path = %path.display(), "wrote developed image");
            eprintln!("Image written to {}", path.display());
        }

        all_diagnostics.push(output.diagnostics);

        if cli.runs > 1 {
            eprintln!();
        }
    }

    if cli.runs > 1 {
        print_multi_run_summary(&all_diagnostics);
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = logging::init_logging(cli.verbose) {
        eprintln!("Error initializing logging: {e}");
        return ExitCode::FAILURE;
    }

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}

/// Print aggregated statistics across multiple runs.
#[allow(clippy::cast_precision_loss)]
fn print_multi_run_summary(all_diagnostics: &[PipelineDiagnostics]) {
    println!();
    println!(
        "Summary ({} runs)\n{}",
        all_diagnostics.len(),
        "=".repeat(60),
    );

    if all_diagnostics.is_empty() {
        println!("Warning: no diagnostics to summarize");
        return;
    }

    let durations: Vec<f64> = all_diagnostics
        .iter()
        .map(|d| d.total_duration.as_secs_f64() * 1000.0)
        .collect();

    let min = durations.iter().copied().reduce(f64::min).unwrap_or(0.0);
    let max = durations.iter().copied().reduce(f64::max).unwrap_or(0.0);
    let mean = durations.iter().sum::<f64>() / durations.len() as f64;

    println!("Total duration: min={min:.3}ms  mean={mean:.3}ms  max={max:.3}ms");

    // Per-stage means, keyed by position so repeated modules stay apart.
    let mut per_stage: BTreeMap<usize, (String, Vec<f64>)> = BTreeMap::new();
    for diagnostics in all_diagnostics {
        for (index, stage) in diagnostics.ran().enumerate() {
            per_stage
                .entry(index)
                .or_insert_with(|| (stage.module.clone(), Vec::new()))
                .1
                .push(stage.duration.as_secs_f64() * 1000.0);
        }
    }

    println!();
    println!("{:<24} {:>12}", "Stage", "Mean (ms)");
    println!("{}", "-".repeat(40));
    for (name, stage_durations) in per_stage.values() {
        let stage_mean = stage_durations.iter().sum::<f64>() / stage_durations.len() as f64;
        println!("{name:<24} {stage_mean:>10.3}ms");
    }
}
