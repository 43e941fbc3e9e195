//! Execution backends: how an assembled pipeline's stages are scheduled.
//!
//! This module defines the [`ExecutionBackend`] trait and the
//! [`BackendKind`] enum that selects an implementation at assembly
//! time. Both backends honor the same contract: given the active stages
//! in priority order with their planned regions, produce the order in
//! which the executor runs them. Pixel work is the same either way, so
//! output is identical.

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::region::Region;
use crate::types::PipelineError;

/// Available execution backends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendKind {
    /// Run active stages one after another in priority order.
    #[default]
    Direct,

    /// Build a dataflow graph from the source through every active
    /// stage to the sink, check every edge's region, and run stages in
    /// topological order.
    Graph,
}

/// An active stage as seen by a backend.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledStage<'a> {
    /// Position of the stage in the pipeline.
    pub index: usize,
    /// Module name.
    pub module: &'a str,
    /// Region the stage reads.
    pub input_region: Region,
    /// Region the stage writes.
    pub output_region: Region,
}

/// Trait for execution backends.
pub trait ExecutionBackend {
    /// Order in which to run `stages`, given that the source stage
    /// produces `source`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError`] if the stages cannot be scheduled.
    fn schedule(
        &self,
        source: Region,
        stages: &[ScheduledStage<'_>],
    ) -> Result<Vec<usize>, PipelineError>;
}

impl ExecutionBackend for BackendKind {
    fn schedule(
        &self,
        source: Region,
        stages: &[ScheduledStage<'_>],
    ) -> Result<Vec<usize>, PipelineError> {
        match *self {
            Self::Direct => Ok(schedule_direct(stages)),
            Self::Graph => schedule_graph(source, stages),
        }
    }
}

fn schedule_direct(stages: &[ScheduledStage<'_>]) -> Vec<usize> {
    stages.iter().map(|s| s.index).collect()
}

#[derive(Debug, Clone, Copy)]
enum Node {
    Source,
    Stage(usize),
    Sink,
}

fn schedule_graph(
    source: Region,
    stages: &[ScheduledStage<'_>],
) -> Result<Vec<usize>, PipelineError> {
    let mut graph: DiGraph<Node, Region> = DiGraph::new();
    let mut producer: NodeIndex = graph.add_node(Node::Source);
    let mut produced = source;
    for stage in stages {
        if stage.input_region != produced {
            return Err(PipelineError::mismatch(
                stage.module,
                &produced,
                &stage.input_region,
            ));
        }
        let node = graph.add_node(Node::Stage(stage.index));
        graph.add_edge(producer, node, produced);
        producer = node;
        produced = stage.output_region;
    }
    let sink = graph.add_node(Node::Sink);
    graph.add_edge(producer, sink, produced);

    let order = toposort(&graph, None).map_err(|cycle| {
        PipelineError::Executor(format!(
            "stage graph has a cycle at node {}",
            cycle.node_id().index()
        ))
    })?;
    debug!(
        nodes = graph.node_count(),
        edges = graph.edge_count(),
        "scheduled stage graph"
    );
    Ok(order
        .into_iter()
        .filter_map(|n| match graph[n] {
            Node::Stage(index) => Some(index),
            Node::Source | Node::Sink => None,
        })
        .collect())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn stage(index: usize, input: Region, output: Region) -> ScheduledStage<'static> {
        ScheduledStage {
            index,
            module: "test",
            input_region: input,
            output_region: output,
        }
    }

    #[test]
    fn default_is_direct() {
        assert_eq!(BackendKind::default(), BackendKind::Direct);
    }

    #[test]
    fn backends_agree_on_order() {
        let a = Region::new(0, 0, 8, 8, 1.0);
        let b = Region::new(-2, -2, 8, 8, 1.0);
        let stages = [stage(0, a, a), stage(2, a, b), stage(5, b, b)];
        let direct = BackendKind::Direct.schedule(a, &stages).unwrap();
        let graph = BackendKind::Graph.schedule(a, &stages).unwrap();
        assert_eq!(direct, [0, 2, 5]);
        assert_eq!(graph, direct);
    }

    #[test]
    fn graph_rejects_broken_chain() {
        let a = Region::new(0, 0, 8, 8, 1.0);
        let b = Region::new(1, 0, 8, 8, 1.0);
        let stages = [stage(0, a, a), stage(1, b, b)];
        assert!(matches!(
            BackendKind::Graph.schedule(a, &stages),
            Err(PipelineError::RegionMismatch { .. })
        ));
    }

    #[test]
    fn empty_pipeline_schedules_nothing() {
        let a = Region::new(0, 0, 1, 1, 1.0);
        assert!(BackendKind::Graph.schedule(a, &[]).unwrap().is_empty());
        assert!(BackendKind::Direct.schedule(a, &[]).unwrap().is_empty());
    }

    #[test]
    fn serde_names() {
        assert_eq!(
            serde_json::to_string(&BackendKind::Graph).unwrap(),
            "\"Graph\""
        );
    }
}
