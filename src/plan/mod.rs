//! Graph resolution and execution planning.
//!
//! [`build_plan`] validates a job's graph (acyclic, fully wired, every key
//! bound), applies subgraph selection, and produces an [`ExecutionPlan`]:
//! topologically ordered steps with every input source and io-manager key
//! resolved up front. The plan is built once per run and never mutated.
//!
//! Ordering is deterministic: Kahn's algorithm with ties broken by node
//! declaration order.

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Bfs, Reversed};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tracing::debug;

use crate::core::errors::{FlowError, Result};
use crate::graph::{GraphDefinition, JobDefinition, NodeDefinition, RetryPolicy};
use crate::io_manager::AddressingMode;

/// The addressable unit of dependency resolution: one output of one step.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepOutputHandle {
    pub step_key: String,
    pub output_name: String,
}

impl StepOutputHandle {
    pub fn new(step_key: impl Into<String>, output_name: impl Into<String>) -> Self {
        Self {
            step_key: step_key.into(),
            output_name: output_name.into(),
        }
    }
}

/// Where a step input's value comes from at execution time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StepInputSource {
    /// Output of an upstream step in this plan.
    Upstream {
        handle: StepOutputHandle,
        io_manager_key: String,
        /// Asset key of the upstream output, when declared. Needed for
        /// asset-identity managers to derive the storage key.
        asset_key: Option<String>,
    },
    /// Literal root value from the input's declared default.
    Literal(Value),
    /// Previously materialized asset, loaded by identity. Used when
    /// selection excludes the producer but the output declares an asset key.
    Asset {
        asset_key: String,
        io_manager_key: String,
    },
}

/// A resolved input of an execution step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedInput {
    pub name: String,
    pub source: StepInputSource,
}

/// A resolved output of an execution step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedOutput {
    pub name: String,
    pub io_manager_key: String,
    pub asset_key: Option<String>,
}

/// One schedulable unit: a node with all sources, keys and retry policy
/// resolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStep {
    /// Step key; equal to the node name.
    pub key: String,
    pub inputs: Vec<PlannedInput>,
    pub outputs: Vec<PlannedOutput>,
    pub resource_keys: Vec<String>,
    pub retry_policy: Option<RetryPolicy>,
    /// Keys of upstream steps present in this plan, deduplicated.
    pub upstream_steps: Vec<String>,
}

/// Topologically ordered, immutable set of steps for one run.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    job_name: String,
    steps: Vec<ExecutionStep>,
    index: HashMap<String, usize>,
}

impl ExecutionPlan {
    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    /// Steps in topological order.
    pub fn steps(&self) -> &[ExecutionStep] {
        &self.steps
    }

    pub fn step(&self, key: &str) -> Option<&ExecutionStep> {
        self.index.get(key).map(|i| &self.steps[*i])
    }

    pub fn position(&self, key: &str) -> Option<usize> {
        self.index.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// How a requested node set expands into the executed subgraph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionScope {
    /// Only the named nodes.
    Exact,
    /// Named nodes plus all ancestors.
    Upstream,
    /// Named nodes plus all descendants.
    Downstream,
    /// Every node weakly connected to a named node.
    AllConnected,
}

/// A pre-resolved set of node identities plus an expansion operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpSelection {
    pub names: Vec<String>,
    pub scope: SelectionScope,
}

impl OpSelection {
    pub fn new<I, S>(names: I, scope: SelectionScope) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
            scope,
        }
    }

    pub fn exact<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(names, SelectionScope::Exact)
    }

    pub fn upstream<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(names, SelectionScope::Upstream)
    }

    pub fn downstream<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(names, SelectionScope::Downstream)
    }

    pub fn all_connected<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(names, SelectionScope::AllConnected)
    }
}

/// Build a validated execution plan for `job`.
///
/// Validation order: acyclicity, then selection expansion, then input
/// satisfiability and binding resolution on the induced subgraph.
pub fn build_plan(
    job: &JobDefinition,
    selection: Option<&OpSelection>,
) -> Result<ExecutionPlan> {
    let graph = job.graph();
    let dag = build_digraph(graph);

    check_acyclic(graph, &dag)?;

    let selected = resolve_selection(graph, &dag, selection)?;
    let order = topo_order(&dag, &selected);

    let mut steps = Vec::with_capacity(order.len());
    let mut index = HashMap::new();
    for idx in order {
        let node = &graph.nodes()[idx];
        let step = plan_step(job, graph, node, &selected)?;
        debug!(step = %step.key, upstream = ?step.upstream_steps, "planned step");
        index.insert(step.key.clone(), steps.len());
        steps.push(step);
    }

    Ok(ExecutionPlan {
        job_name: job.name().to_string(),
        steps,
        index,
    })
}

/// Petgraph view of the node graph; node weight = declaration index.
fn build_digraph(graph: &GraphDefinition) -> DiGraph<usize, ()> {
    let mut dag = DiGraph::new();
    let indices: Vec<NodeIndex> = (0..graph.nodes().len()).map(|i| dag.add_node(i)).collect();

    let mut seen = HashSet::new();
    for edge in graph.edges() {
        let producer = graph.node_position(&edge.producer).expect("validated");
        let consumer = graph.node_position(&edge.consumer).expect("validated");
        // One structural edge per node pair even when several wires exist.
        if seen.insert((producer, consumer)) {
            dag.add_edge(indices[producer], indices[consumer], ());
        }
    }
    dag
}

fn check_acyclic(graph: &GraphDefinition, dag: &DiGraph<usize, ()>) -> Result<()> {
    if !petgraph::algo::is_cyclic_directed(dag) {
        return Ok(());
    }
    let cycle = find_cycle(dag);
    Err(FlowError::cycle(
        cycle
            .into_iter()
            .map(|idx| graph.nodes()[dag[idx]].name().to_string())
            .collect(),
    ))
}

/// Walk the graph depth-first until an edge back into the active stack is
/// found, then return the cycle's node sequence with the entry node
/// repeated at the end.
fn find_cycle(dag: &DiGraph<usize, ()>) -> Vec<NodeIndex> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        White,
        Gray,
        Black,
    }

    let mut marks = vec![Mark::White; dag.node_count()];
    let mut stack: Vec<NodeIndex> = Vec::new();

    fn visit(
        dag: &DiGraph<usize, ()>,
        node: NodeIndex,
        marks: &mut Vec<Mark>,
        stack: &mut Vec<NodeIndex>,
    ) -> Option<Vec<NodeIndex>> {
        marks[node.index()] = Mark::Gray;
        stack.push(node);
        for next in dag.neighbors_directed(node, Direction::Outgoing) {
            match marks[next.index()] {
                Mark::Gray => {
                    let start = stack.iter().position(|n| *n == next).unwrap();
                    let mut cycle: Vec<NodeIndex> = stack[start..].to_vec();
                    cycle.push(next);
                    return Some(cycle);
                }
                Mark::White => {
                    if let Some(cycle) = visit(dag, next, marks, stack) {
                        return Some(cycle);
                    }
                }
                Mark::Black => {}
            }
        }
        stack.pop();
        marks[node.index()] = Mark::Black;
        None
    }

    for start in dag.node_indices() {
        if marks[start.index()] == Mark::White {
            if let Some(cycle) = visit(dag, start, &mut marks, &mut stack) {
                return cycle;
            }
        }
    }
    unreachable!("cyclic graph must contain a findable cycle")
}

/// Expand a selection into the induced set of declaration indices.
fn resolve_selection(
    graph: &GraphDefinition,
    dag: &DiGraph<usize, ()>,
    selection: Option<&OpSelection>,
) -> Result<HashSet<usize>> {
    let Some(selection) = selection else {
        return Ok((0..graph.nodes().len()).collect());
    };

    if selection.names.is_empty() {
        return Err(FlowError::selection("selection names no nodes"));
    }

    let mut seeds = Vec::new();
    for name in &selection.names {
        let idx = graph.node_position(name).ok_or_else(|| {
            FlowError::selection(format!("unknown node '{}' in selection", name))
        })?;
        seeds.push(NodeIndex::new(idx));
    }

    let mut selected: HashSet<usize> = seeds.iter().map(|n| n.index()).collect();
    match selection.scope {
        SelectionScope::Exact => {}
        SelectionScope::Upstream => {
            let reversed = Reversed(dag);
            for seed in &seeds {
                let mut bfs = Bfs::new(reversed, *seed);
                while let Some(node) = bfs.next(reversed) {
                    selected.insert(node.index());
                }
            }
        }
        SelectionScope::Downstream => {
            for seed in &seeds {
                let mut bfs = Bfs::new(dag, *seed);
                while let Some(node) = bfs.next(dag) {
                    selected.insert(node.index());
                }
            }
        }
        SelectionScope::AllConnected => {
            // Closure over edges in both directions.
            let mut frontier: Vec<NodeIndex> = seeds.clone();
            while let Some(node) = frontier.pop() {
                for next in dag
                    .neighbors_directed(node, Direction::Outgoing)
                    .chain(dag.neighbors_directed(node, Direction::Incoming))
                {
                    if selected.insert(next.index()) {
                        frontier.push(next);
                    }
                }
            }
        }
    }

    Ok(selected)
}

/// Kahn's algorithm over the induced subgraph, ties broken by declaration
/// order.
fn topo_order(dag: &DiGraph<usize, ()>, selected: &HashSet<usize>) -> Vec<usize> {
    let mut in_degree: HashMap<usize, usize> = selected.iter().map(|i| (*i, 0)).collect();
    for edge_idx in dag.edge_indices() {
        let (a, b) = dag.edge_endpoints(edge_idx).unwrap();
        if selected.contains(&a.index()) && selected.contains(&b.index()) {
            *in_degree.get_mut(&b.index()).unwrap() += 1;
        }
    }

    let mut ready: Vec<usize> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(i, _)| *i)
        .collect();
    ready.sort_unstable();

    let mut order = Vec::with_capacity(selected.len());
    while !ready.is_empty() {
        let idx = ready.remove(0);
        order.push(idx);
        for next in dag.neighbors_directed(NodeIndex::new(idx), Direction::Outgoing) {
            if let Some(degree) = in_degree.get_mut(&next.index()) {
                *degree -= 1;
                if *degree == 0 {
                    let pos = ready.binary_search(&next.index()).unwrap_or_else(|p| p);
                    ready.insert(pos, next.index());
                }
            }
        }
    }
    order
}

/// Resolve one node into an execution step, validating input sources, type
/// compatibility and key bindings.
fn plan_step(
    job: &JobDefinition,
    graph: &GraphDefinition,
    node: &NodeDefinition,
    selected: &HashSet<usize>,
) -> Result<ExecutionStep> {
    let mut inputs = Vec::with_capacity(node.inputs().len());
    let mut upstream_steps: Vec<String> = Vec::new();

    for input in node.inputs() {
        let wire = graph
            .edges()
            .iter()
            .find(|e| e.consumer == node.name() && e.input == input.name);

        let source = match wire {
            Some(edge) => {
                let producer = graph.node(&edge.producer).expect("validated");
                let output = producer.output(&edge.output).expect("validated");

                if !input.dtype.accepts(&output.dtype) {
                    return Err(FlowError::unresolved_input(
                        node.name(),
                        &input.name,
                        format!(
                            "output '{}.{}' has type {:?}, incompatible with declared type {:?}",
                            edge.producer, edge.output, output.dtype, input.dtype
                        ),
                    ));
                }

                let producer_idx = graph.node_position(&edge.producer).expect("validated");
                if selected.contains(&producer_idx) {
                    let io_manager_key = resolve_input_manager(job, node, input, output)?;
                    if !upstream_steps.contains(&edge.producer) {
                        upstream_steps.push(edge.producer.clone());
                    }
                    StepInputSource::Upstream {
                        handle: StepOutputHandle::new(&edge.producer, &edge.output),
                        io_manager_key,
                        asset_key: output.asset_key.clone(),
                    }
                } else if let Some(asset_key) = &output.asset_key {
                    // Producer trimmed by selection; load the last
                    // materialization of its asset instead.
                    let io_manager_key = resolve_input_manager(job, node, input, output)?;
                    let def = job.io_managers().get(&io_manager_key).expect("resolved");
                    if def.mode() != AddressingMode::AssetIdentity {
                        return Err(FlowError::unresolved_input(
                            node.name(),
                            &input.name,
                            format!(
                                "producer '{}' is excluded by selection and manager '{}' \
                                 does not use asset-identity addressing",
                                edge.producer, io_manager_key
                            ),
                        ));
                    }
                    StepInputSource::Asset {
                        asset_key: asset_key.clone(),
                        io_manager_key,
                    }
                } else if let Some(default) = &input.default {
                    StepInputSource::Literal(default.clone())
                } else {
                    return Err(FlowError::unresolved_input(
                        node.name(),
                        &input.name,
                        format!(
                            "producer '{}' is excluded by selection and output '{}' \
                             declares no asset key",
                            edge.producer, edge.output
                        ),
                    ));
                }
            }
            None => match &input.default {
                Some(default) => StepInputSource::Literal(default.clone()),
                None => {
                    return Err(FlowError::unresolved_input(
                        node.name(),
                        &input.name,
                        "not wired to any upstream output and no literal default",
                    ));
                }
            },
        };

        inputs.push(PlannedInput {
            name: input.name.clone(),
            source,
        });
    }

    let mut outputs = Vec::with_capacity(node.outputs().len());
    for output in node.outputs() {
        let io_manager_key = output
            .io_manager_key
            .clone()
            .unwrap_or_else(|| job.default_io_manager_key().to_string());
        let def = job.io_managers().get(&io_manager_key).ok_or_else(|| {
            FlowError::unresolved_resource(
                io_manager_key.clone(),
                format!("output '{}' of node '{}'", output.name, node.name()),
            )
        })?;
        if def.mode() == AddressingMode::AssetIdentity && output.asset_key.is_none() {
            return Err(FlowError::invalid_graph(format!(
                "output '{}' of node '{}' is handled by asset-identity manager '{}' \
                 but declares no asset key",
                output.name,
                node.name(),
                io_manager_key
            )));
        }
        outputs.push(PlannedOutput {
            name: output.name.clone(),
            io_manager_key,
            asset_key: output.asset_key.clone(),
        });
    }

    for key in node.required_resource_keys() {
        if !job.resources().contains_key(key) {
            return Err(FlowError::unresolved_resource(
                key.clone(),
                format!("node '{}'", node.name()),
            ));
        }
    }

    Ok(ExecutionStep {
        key: node.name().to_string(),
        inputs,
        outputs,
        resource_keys: node.required_resource_keys().to_vec(),
        retry_policy: node.retry_policy().cloned(),
        upstream_steps,
    })
}

/// Manager key priority for an input: explicit input key, explicit key on
/// the producing output, then the job default.
fn resolve_input_manager(
    job: &JobDefinition,
    node: &NodeDefinition,
    input: &crate::graph::InputDef,
    output: &crate::graph::OutputDef,
) -> Result<String> {
    let key = input
        .io_manager_key
        .clone()
        .or_else(|| output.io_manager_key.clone())
        .unwrap_or_else(|| job.default_io_manager_key().to_string());
    if !job.io_managers().contains_key(&key) {
        return Err(FlowError::unresolved_resource(
            key,
            format!("input '{}' of node '{}'", input.name, node.name()),
        ));
    }
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{InputDef, NodeDefinition, OpOutputs, ValueType};
    use serde_json::json;

    fn source_node(name: &str) -> NodeDefinition {
        NodeDefinition::builder(name)
            .compute_fn(|_ctx| Box::pin(async { Ok(OpOutputs::of(json!(1))) }))
            .build()
            .unwrap()
    }

    fn consumer_node(name: &str) -> NodeDefinition {
        NodeDefinition::builder(name)
            .input(InputDef::new("value", ValueType::Any))
            .compute_fn(|_ctx| Box::pin(async { Ok(OpOutputs::of(json!(2))) }))
            .build()
            .unwrap()
    }

    fn diamond_job() -> JobDefinition {
        // a -> b, a -> c, b -> d, c -> d (d takes two inputs)
        let d = NodeDefinition::builder("d")
            .input(InputDef::new("left", ValueType::Any))
            .input(InputDef::new("right", ValueType::Any))
            .compute_fn(|_ctx| Box::pin(async { Ok(OpOutputs::of(json!(3))) }))
            .build()
            .unwrap();
        let graph = GraphDefinition::builder("diamond")
            .add_node(source_node("a"))
            .add_node(consumer_node("b"))
            .add_node(consumer_node("c"))
            .add_node(d)
            .wire_default("a", "b", "value")
            .wire_default("a", "c", "value")
            .wire_default("b", "d", "left")
            .wire_default("c", "d", "right")
            .build()
            .unwrap();
        JobDefinition::builder("diamond_job", graph).build().unwrap()
    }

    #[test]
    fn test_topological_order_with_declaration_tiebreak() {
        let plan = build_plan(&diamond_job(), None).unwrap();
        let keys: Vec<&str> = plan.steps().iter().map(|s| s.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_cycle_detection_names_sequence() {
        let graph = GraphDefinition::builder("cyclic")
            .add_node(consumer_node("x"))
            .add_node(consumer_node("y"))
            .wire_default("x", "y", "value")
            .wire_default("y", "x", "value")
            .build()
            .unwrap();
        let job = JobDefinition::builder("cyclic_job", graph).build().unwrap();

        let err = build_plan(&job, None).unwrap_err();
        match err {
            FlowError::GraphCycle { cycle } => {
                assert!(cycle.len() >= 3);
                assert_eq!(cycle.first(), cycle.last());
                assert!(cycle.contains(&"x".to_string()));
                assert!(cycle.contains(&"y".to_string()));
            }
            other => panic!("expected cycle error, got {other:?}"),
        }
    }

    #[test]
    fn test_unwired_input_without_default_fails() {
        let graph = GraphDefinition::builder("g")
            .add_node(consumer_node("lonely"))
            .build()
            .unwrap();
        let job = JobDefinition::builder("j", graph).build().unwrap();

        let err = build_plan(&job, None).unwrap_err();
        assert!(matches!(err, FlowError::UnresolvedInput { .. }));
    }

    #[test]
    fn test_literal_default_satisfies_root_input() {
        let node = NodeDefinition::builder("with_default")
            .input(InputDef::new("n", ValueType::Int).with_default(json!(5)))
            .compute_fn(|_ctx| Box::pin(async { Ok(OpOutputs::of(json!(5))) }))
            .build()
            .unwrap();
        let graph = GraphDefinition::builder("g").add_node(node).build().unwrap();
        let job = JobDefinition::builder("j", graph).build().unwrap();

        let plan = build_plan(&job, None).unwrap();
        let step = plan.step("with_default").unwrap();
        assert!(matches!(
            step.inputs[0].source,
            StepInputSource::Literal(_)
        ));
    }

    #[test]
    fn test_type_mismatch_rejected() {
        let producer = NodeDefinition::builder("p")
            .output(crate::graph::OutputDef::new("out", ValueType::String))
            .compute_fn(|_ctx| Box::pin(async { Ok(OpOutputs::new().with("out", json!("s"))) }))
            .build()
            .unwrap();
        let consumer = NodeDefinition::builder("c")
            .input(InputDef::new("n", ValueType::Int))
            .compute_fn(|_ctx| Box::pin(async { Ok(OpOutputs::of(json!(0))) }))
            .build()
            .unwrap();
        let graph = GraphDefinition::builder("g")
            .add_node(producer)
            .add_node(consumer)
            .wire("p", "out", "c", "n")
            .build()
            .unwrap();
        let job = JobDefinition::builder("j", graph).build().unwrap();

        let err = build_plan(&job, None).unwrap_err();
        assert!(matches!(err, FlowError::UnresolvedInput { .. }));
        assert!(err.to_string().contains("incompatible"));
    }

    #[test]
    fn test_missing_io_manager_key_rejected() {
        let node = NodeDefinition::builder("n")
            .output(crate::graph::OutputDef::new("out", ValueType::Any).with_io_manager_key("warehouse"))
            .compute_fn(|_ctx| Box::pin(async { Ok(OpOutputs::new().with("out", json!(1))) }))
            .build()
            .unwrap();
        let graph = GraphDefinition::builder("g").add_node(node).build().unwrap();
        let job = JobDefinition::builder("j", graph).build().unwrap();

        let err = build_plan(&job, None).unwrap_err();
        assert!(matches!(err, FlowError::UnresolvedResource { .. }));
    }

    #[test]
    fn test_missing_resource_key_rejected() {
        let node = NodeDefinition::builder("n")
            .require_resource("db")
            .compute_fn(|_ctx| Box::pin(async { Ok(OpOutputs::of(json!(1))) }))
            .build()
            .unwrap();
        let graph = GraphDefinition::builder("g").add_node(node).build().unwrap();
        let job = JobDefinition::builder("j", graph).build().unwrap();

        let err = build_plan(&job, None).unwrap_err();
        assert!(matches!(err, FlowError::UnresolvedResource { .. }));
    }

    #[test]
    fn test_upstream_selection_pulls_ancestors() {
        let plan = build_plan(
            &diamond_job(),
            Some(&OpSelection::upstream(["d"])),
        )
        .unwrap();
        let keys: Vec<&str> = plan.steps().iter().map(|s| s.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_downstream_selection_with_defaults() {
        // chain: a -> b -> c, where b and c carry literal defaults so they
        // stay plannable when their producers are trimmed away
        let b = NodeDefinition::builder("b")
            .input(InputDef::new("value", ValueType::Any).with_default(json!(0)))
            .compute_fn(|_ctx| Box::pin(async { Ok(OpOutputs::of(json!(2))) }))
            .build()
            .unwrap();
        let c = NodeDefinition::builder("c")
            .input(InputDef::new("value", ValueType::Any).with_default(json!(0)))
            .compute_fn(|_ctx| Box::pin(async { Ok(OpOutputs::of(json!(3))) }))
            .build()
            .unwrap();
        let graph = GraphDefinition::builder("chain")
            .add_node(source_node("a"))
            .add_node(b)
            .add_node(c)
            .wire_default("a", "b", "value")
            .wire_default("b", "c", "value")
            .build()
            .unwrap();
        let job = JobDefinition::builder("chain_job", graph).build().unwrap();

        let plan = build_plan(&job, Some(&OpSelection::downstream(["b"]))).unwrap();
        let keys: Vec<&str> = plan.steps().iter().map(|s| s.key.as_str()).collect();
        assert_eq!(keys, vec!["b", "c"]);

        // b's trimmed upstream wire falls back to the literal default
        let step = plan.step("b").unwrap();
        assert!(matches!(step.inputs[0].source, StepInputSource::Literal(_)));
        // c's producer b is still in the plan, so it stays an upstream wire
        let step = plan.step("c").unwrap();
        assert!(matches!(step.inputs[0].source, StepInputSource::Upstream { .. }));
    }

    #[test]
    fn test_exact_selection_excludes_others() {
        let plan = build_plan(&diamond_job(), Some(&OpSelection::exact(["a"]))).unwrap();
        let keys: Vec<&str> = plan.steps().iter().map(|s| s.key.as_str()).collect();
        assert_eq!(keys, vec!["a"]);
        assert!(plan.step("b").is_none());
    }

    #[test]
    fn test_unknown_selection_name_rejected() {
        let err = build_plan(&diamond_job(), Some(&OpSelection::exact(["nope"]))).unwrap_err();
        assert!(matches!(err, FlowError::Selection { .. }));
    }
}
