//! Integration tests: region, tiling, and determinism properties of
//! assembled pipelines.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::cast_precision_loss)]

use std::sync::Arc;

use darkroom_pipeline::{
    BackendKind, CHANNELS, CancelToken, Dimensions, EditSession, ModuleRegistry, OperationKind,
    OutputTile, ParamBlock, Pipeline, PipelineContext, PipelineError, PipelineId, PipelineKind,
    PipelineRequest, PixelBuffer, Region, StackSnapshot, SystemClock, Target, TileExecutor, Tiling,
    commit,
};
use proptest::prelude::*;

fn registry() -> Arc<ModuleRegistry> {
    Arc::new(ModuleRegistry::with_builtins().unwrap())
}

fn gradient(width: u32, height: u32) -> PixelBuffer {
    PixelBuffer::from_fn(width, height, |x, y| {
        let fx = x as f32 / width as f32;
        let fy = y as f32 / height as f32;
        [fx, fy, (fx * fy).sqrt()]
    })
}

fn context(source: Dimensions, scale: f32) -> PipelineContext {
    PipelineContext {
        pipeline: PipelineId::next(),
        kind: PipelineKind::Export,
        source,
        scale,
    }
}

fn develop(
    snapshot: &StackSnapshot,
    source: &PixelBuffer,
    request: PipelineRequest,
    backend: BackendKind,
    tiling: Tiling,
) -> PixelBuffer {
    let pipeline = Pipeline::assemble(snapshot, request, source.dimensions(), backend).unwrap();
    let executor = TileExecutor::new(4, tiling).unwrap();
    pipeline
        .run(source, &executor, &CancelToken::new(), &SystemClock)
        .unwrap()
        .buffer
}

fn develop_default(
    snapshot: &StackSnapshot,
    source: &PixelBuffer,
    request: PipelineRequest,
) -> PixelBuffer {
    develop(snapshot, source, request, BackendKind::Direct, Tiling::default())
}

fn bits(buffer: &PixelBuffer) -> Vec<u32> {
    buffer.as_slice().iter().map(|v| v.to_bits()).collect()
}

/// A session with every shipped operation enabled and set away from its
/// defaults.
fn busy_session() -> EditSession {
    let mut session = EditSession::new("busy.raw", registry());
    let exposure = session.add_module("exposure").unwrap();
    let crop = session.add_module("crop").unwrap();
    let blur = session.add_module("blur").unwrap();
    let split = session.add_module("splittoning").unwrap();
    session.set_param(exposure, "ev", 0.7).unwrap();
    session.set_param(exposure, "black", 0.02).unwrap();
    session.set_param(crop, "left", 0.1).unwrap();
    session.set_param(crop, "top", 0.2).unwrap();
    session.set_param(crop, "right", 0.95).unwrap();
    session.set_param(blur, "radius", 3.0).unwrap();
    session.set_enabled(split, true).unwrap();
    session
}

fn region_strategy() -> impl Strategy<Value = Region> {
    (
        -1000i32..1000,
        -1000i32..1000,
        0u32..500,
        0u32..500,
        0.05f32..4.0,
    )
        .prop_map(|(x, y, w, h, s)| Region::new(x, y, w, h, s))
}

proptest! {
    #[test]
    fn region_geometry_inverts_per_kind(region in region_strategy()) {
        let registry = registry();
        let ctx = context(Dimensions::new(640, 480), region.scale);
        for definition in registry.iter() {
            let op = definition.operation();
            let state = op.commit(definition.default_params(), &ctx).unwrap();
            match op.kind() {
                OperationKind::PointWise => {
                    prop_assert_eq!(op.compute_output_region(&state, &region), region);
                    prop_assert_eq!(op.compute_input_region(&state, &region), region);
                }
                OperationKind::Spatial => {
                    let input = op.compute_input_region(&state, &region);
                    prop_assert_eq!(input, region.expand(op.halo(&state)));
                    prop_assert_eq!(op.compute_output_region(&state, &input), region);
                }
                OperationKind::Geometric => {}
            }
        }
    }

    #[test]
    fn process_writes_exactly_the_tile(
        width in 1u32..24,
        height in 1u32..24,
        dx in -4i32..4,
        dy in -4i32..4,
        w in 1u32..24,
        h in 1u32..24,
    ) {
        let registry = registry();
        let source = Dimensions::new(width, height);
        let ctx = context(source, 1.0);
        // Regions inside the image, straddling its edges, and outside it.
        let region = Region::new(dx, dy, w, h, 1.0);
        for definition in registry.iter() {
            let op = definition.operation();
            let state = op.commit(definition.default_params(), &ctx).unwrap();
            let in_region = op.compute_input_region(&state, &region);
            let input = gradient(in_region.width, in_region.height);
            let view = input.view(in_region, in_region).unwrap();

            let len = region.pixel_count() * CHANNELS;
            let guard = 7;
            let mut data = vec![f32::NAN; len + 2 * guard];
            data[..guard].fill(-42.0);
            data[guard + len..].fill(-42.0);
            let mut tile = OutputTile::new(region, &mut data[guard..guard + len]).unwrap();
            op.process(&state, &view, &mut tile).unwrap();

            prop_assert!(data[..guard].iter().all(|v| *v == -42.0));
            prop_assert!(data[guard + len..].iter().all(|v| *v == -42.0));
            prop_assert!(data[guard..guard + len].iter().all(|v| !v.is_nan()));
        }
    }

    #[test]
    fn commit_is_pure(
        ev in -4.0f32..4.0,
        black in -0.1f32..0.1,
        left in 0.0f32..0.4,
        right in 0.6f32..1.0,
        radius in 0.0f32..20.0,
        scale in 0.1f32..2.0,
    ) {
        let registry = registry();
        let blocks = [
            ("exposure", vec![ev, black]),
            ("crop", vec![left, left, right, right]),
            ("blur", vec![radius]),
            ("splittoning", vec![ev, black, left, right, radius, scale, ev, black, left]),
        ];
        let source = Dimensions::new(300, 200);
        for (name, values) in blocks {
            let definition = registry.lookup(name).unwrap();
            let params = ParamBlock::new(values);
            // Different pipelines, same inputs otherwise.
            let a = commit(definition, &params, &context(source, scale)).unwrap();
            let b = commit(definition, &params, &context(source, scale)).unwrap();
            prop_assert_eq!(a.as_bytes(), b.as_bytes());
            prop_assert_eq!(a.fingerprint(), b.fingerprint());
        }
    }
}

#[test]
fn one_tile_and_eight_tiles_are_bit_identical() {
    let session = busy_session();
    let snapshot = session.snapshot();
    let source = gradient(37, 29);
    for request in [
        PipelineRequest::export(),
        PipelineRequest::new(PipelineKind::Preview, Target::Full { scale: 0.5 }),
    ] {
        let one = develop(&snapshot, &source, request, BackendKind::Direct, Tiling::Count(1));
        let eight = develop(&snapshot, &source, request, BackendKind::Direct, Tiling::Count(8));
        let rows = develop(
            &snapshot,
            &source,
            request,
            BackendKind::Direct,
            Tiling::RowBands { rows: 1 },
        );
        assert_eq!(bits(&one), bits(&eight));
        assert_eq!(bits(&one), bits(&rows));
    }
}

#[test]
fn graph_backend_matches_direct_backend() {
    let session = busy_session();
    let snapshot = session.snapshot();
    let source = gradient(23, 31);
    let request = PipelineRequest::export();
    let direct = develop(&snapshot, &source, request, BackendKind::Direct, Tiling::Count(3));
    let graph = develop(&snapshot, &source, request, BackendKind::Graph, Tiling::Count(3));
    assert_eq!(bits(&direct), bits(&graph));
}

#[test]
fn disabling_an_instance_equals_removing_it() {
    let mut disabled = busy_session();
    let mut removed = busy_session();
    let blur = disabled
        .stack()
        .iter()
        .find(|i| i.name() == "blur")
        .unwrap()
        .id();
    disabled.set_enabled(blur, false).unwrap();
    removed.remove_module(blur).unwrap();

    let source = gradient(20, 16);
    let request = PipelineRequest::export();
    let a = develop(&disabled.snapshot(), &source, request, BackendKind::Direct, Tiling::default());
    let b = develop(&removed.snapshot(), &source, request, BackendKind::Direct, Tiling::default());
    assert_eq!(bits(&a), bits(&b));
}

#[test]
fn two_by_two_through_identity_stage_is_bit_identical() {
    let mut session = EditSession::new("tiny.raw", registry());
    let split = session.add_module("splittoning").unwrap();
    session.set_enabled(split, true).unwrap();
    let source = PixelBuffer::from_raw(
        2,
        2,
        vec![0.1, 0.2, 0.3, -0.5, 1.5, 0.0, 1e-30, 3.0e8, 0.7, 0.25, 0.5, 0.75],
    )
    .unwrap();
    let pipeline = Pipeline::assemble(
        &session.snapshot(),
        PipelineRequest::export(),
        source.dimensions(),
        BackendKind::Direct,
    )
    .unwrap();
    assert!(pipeline.stages()[0].is_active());
    let executor = TileExecutor::new(2, Tiling::Count(2)).unwrap();
    let out = pipeline
        .run(&source, &executor, &CancelToken::new(), &SystemClock)
        .unwrap();
    assert_eq!(bits(&out.buffer), bits(&source));
    assert_eq!(out.diagnostics.ran().count(), 2);
}

#[test]
fn empty_requested_region_is_a_region_mismatch() {
    let session = busy_session();
    let err = Pipeline::assemble(
        &session.snapshot(),
        PipelineRequest::new(
            PipelineKind::Preview,
            Target::Region(Region::new(5, 5, 0, 0, 1.0)),
        ),
        Dimensions::new(10, 10),
        BackendKind::Direct,
    )
    .unwrap_err();
    assert!(matches!(err, PipelineError::RegionMismatch { .. }), "{err}");
}

#[test]
fn region_request_matches_crop_of_full_output() {
    let session = busy_session();
    let snapshot = session.snapshot();
    let source = gradient(40, 30);
    let full = develop(
        &snapshot,
        &source,
        PipelineRequest::export(),
        BackendKind::Direct,
        Tiling::default(),
    );
    let window = Region::new(4, 3, 10, 8, 1.0);
    let part = develop(
        &snapshot,
        &source,
        PipelineRequest::new(PipelineKind::Preview, Target::Region(window)),
        BackendKind::Direct,
        Tiling::default(),
    );
    assert_eq!(part.dimensions(), Dimensions::new(10, 8));
    for y in 0..window.height {
        for x in 0..window.width {
            let expected = full.pixel(x + 4, y + 3).unwrap();
            assert_eq!(part.pixel(x, y).unwrap(), expected, "pixel ({x}, {y})");
        }
    }
}

#[test]
fn blurred_region_at_image_corner_matches_full_output() {
    let mut session = EditSession::new("corner.raw", registry());
    let blur = session.add_module("blur").unwrap();
    session.set_param(blur, "radius", 2.0).unwrap();
    let snapshot = session.snapshot();
    let source = gradient(20, 20);
    let full = develop_default(&snapshot, &source, PipelineRequest::export());
    for window in [Region::new(5, 5, 6, 6, 1.0), Region::new(0, 0, 3, 4, 1.0)] {
        let request = PipelineRequest::new(PipelineKind::Preview, Target::Region(window));
        let part = develop_default(&snapshot, &source, request);
        let (left, top) = (u32::try_from(window.x).unwrap(), u32::try_from(window.y).unwrap());
        for y in 0..window.height {
            for x in 0..window.width {
                let expected = full.pixel(x + left, y + top);
                assert_eq!(part.pixel(x, y), expected, "pixel ({x}, {y}) of {window}");
            }
        }
    }
}

#[test]
fn pipelines_do_not_observe_later_edits() {
    let mut session = busy_session();
    let source = gradient(16, 12);
    let request = PipelineRequest::export();
    let before = develop_default(&session.snapshot(), &source, request);

    let pipeline = Pipeline::assemble(
        &session.snapshot(),
        request,
        source.dimensions(),
        BackendKind::Direct,
    )
    .unwrap();
    let exposure = session
        .stack()
        .iter()
        .find(|i| i.name() == "exposure")
        .unwrap()
        .id();
    session.set_param(exposure, "ev", -2.0).unwrap();

    let executor = TileExecutor::new(2, Tiling::default()).unwrap();
    let out = pipeline
        .run(&source, &executor, &CancelToken::new(), &SystemClock)
        .unwrap();
    assert_eq!(bits(&out.buffer), bits(&before));

    let after = develop_default(&session.snapshot(), &source, request);
    assert_ne!(bits(&after), bits(&before));
}

#[test]
fn concurrent_pipelines_are_independent() {
    let session = busy_session();
    let source = gradient(32, 24);
    let config = darkroom_pipeline::EngineConfig::default();
    let requests = [
        PipelineRequest::preview(&config),
        PipelineRequest::export(),
        PipelineRequest::thumbnail(&config, source.dimensions()),
    ];
    let expected: Vec<Vec<u32>> = requests
        .iter()
        .map(|r| bits(&develop_default(&session.snapshot(), &source, *r)))
        .collect();

    let executor = TileExecutor::new(4, Tiling::Count(4)).unwrap();
    let results: Vec<Vec<u32>> = std::thread::scope(|scope| {
        let handles: Vec<_> = requests
            .iter()
            .map(|request| {
                let snapshot = session.snapshot();
                let executor = &executor;
                let source = &source;
                scope.spawn(move || {
                    let pipeline = Pipeline::assemble(
                        &snapshot,
                        *request,
                        source.dimensions(),
                        BackendKind::Graph,
                    )
                    .unwrap();
                    let out = pipeline
                        .run(source, executor, &CancelToken::new(), &SystemClock)
                        .unwrap();
                    bits(&out.buffer)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    assert_eq!(results, expected);
}
