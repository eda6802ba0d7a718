//! Declarative definitions: nodes, graphs and jobs.
//!
//! Definitions are built through explicit builders and are immutable after
//! construction. A [`GraphDefinition`] owns its nodes and dependency edges;
//! a [`JobDefinition`] binds a graph to concrete resource and io-manager
//! definitions, ready to execute. There is no process-wide registry: a job
//! is an explicit value handed to [`execute`](crate::engine::execute).

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use crate::core::errors::{FlowError, Result};
use crate::engine::OpContext;
use crate::io_manager::{AddressingMode, IoManagerDefinition};
use crate::resources::ResourceDefinition;

/// Output name used when a node declares no outputs explicitly.
pub const DEFAULT_OUTPUT: &str = "result";

/// Io-manager key used when a job does not bind one explicitly.
pub const DEFAULT_IO_MANAGER_KEY: &str = "io_manager";

/// Declared type of an input or output. Wiring is compatible when both
/// sides match exactly or either side is `Any`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Any,
    Bool,
    Int,
    Float,
    String,
    Json,
}

impl ValueType {
    pub fn accepts(&self, producer: &ValueType) -> bool {
        matches!(self, ValueType::Any)
            || matches!(producer, ValueType::Any)
            || self == producer
    }
}

/// Backoff shape between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    None,
    Linear,
    Exponential,
}

/// Reattempt rule for a failing step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay: Duration,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            delay: Duration::from_secs(1),
            backoff: Backoff::None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Wait before retry number `attempt` (1-based). Saturates at
    /// `Duration::MAX` instead of overflowing.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::None => Duration::ZERO,
            Backoff::Linear => self.delay.checked_mul(attempt).unwrap_or(Duration::MAX),
            Backoff::Exponential => self
                .delay
                .checked_mul(2u32.saturating_pow(attempt))
                .unwrap_or(Duration::MAX),
        }
    }
}

/// A declared node input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputDef {
    pub name: String,
    pub dtype: ValueType,
    /// Explicit manager for loading this input; overrides the job default.
    pub io_manager_key: Option<String>,
    /// Literal value used when the input is not wired to an upstream output.
    pub default: Option<Value>,
}

impl InputDef {
    pub fn new(name: impl Into<String>, dtype: ValueType) -> Self {
        Self {
            name: name.into(),
            dtype,
            io_manager_key: None,
            default: None,
        }
    }

    pub fn with_io_manager_key(mut self, key: impl Into<String>) -> Self {
        self.io_manager_key = Some(key.into());
        self
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }
}

/// A declared node output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputDef {
    pub name: String,
    pub dtype: ValueType,
    /// Explicit manager for handling this output; overrides the job default.
    pub io_manager_key: Option<String>,
    /// Stable logical identity, required for asset-identity addressing.
    pub asset_key: Option<String>,
}

impl OutputDef {
    pub fn new(name: impl Into<String>, dtype: ValueType) -> Self {
        Self {
            name: name.into(),
            dtype,
            io_manager_key: None,
            asset_key: None,
        }
    }

    pub fn with_io_manager_key(mut self, key: impl Into<String>) -> Self {
        self.io_manager_key = Some(key.into());
        self
    }

    pub fn with_asset_key(mut self, key: impl Into<String>) -> Self {
        self.asset_key = Some(key.into());
        self
    }
}

/// Values produced by one compute call, keyed by declared output name.
#[derive(Debug, Clone, Default)]
pub struct OpOutputs {
    values: HashMap<String, Value>,
}

impl OpOutputs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Single unnamed result, stored under [`DEFAULT_OUTPUT`].
    pub fn of(value: Value) -> Self {
        Self::new().with(DEFAULT_OUTPUT, value)
    }

    pub fn with(mut self, name: impl Into<String>, value: Value) -> Self {
        self.values.insert(name.into(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub(crate) fn into_map(self) -> HashMap<String, Value> {
        self.values
    }
}

/// A node's computation. Pure with respect to engine state: read inputs and
/// resources from the context, return outputs.
#[async_trait::async_trait]
pub trait OpCompute: Send + Sync {
    async fn compute(&self, ctx: &OpContext) -> anyhow::Result<OpOutputs>;
}

type ComputeFn =
    dyn for<'a> Fn(&'a OpContext) -> BoxFuture<'a, anyhow::Result<OpOutputs>> + Send + Sync;

/// Adapter turning a closure into an [`OpCompute`].
pub struct FnCompute {
    func: Box<ComputeFn>,
}

impl FnCompute {
    pub fn new<F>(func: F) -> Self
    where
        F: for<'a> Fn(&'a OpContext) -> BoxFuture<'a, anyhow::Result<OpOutputs>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            func: Box::new(func),
        }
    }
}

#[async_trait::async_trait]
impl OpCompute for FnCompute {
    async fn compute(&self, ctx: &OpContext) -> anyhow::Result<OpOutputs> {
        (self.func)(ctx).await
    }
}

/// A single unit of computation with typed inputs and outputs.
#[derive(Clone)]
pub struct NodeDefinition {
    name: String,
    compute: Arc<dyn OpCompute>,
    inputs: Vec<InputDef>,
    outputs: Vec<OutputDef>,
    required_resource_keys: Vec<String>,
    retry_policy: Option<RetryPolicy>,
    description: Option<String>,
}

impl NodeDefinition {
    pub fn builder(name: impl Into<String>) -> NodeBuilder {
        NodeBuilder {
            name: name.into(),
            compute: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
            required_resource_keys: Vec::new(),
            retry_policy: None,
            description: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn compute(&self) -> &Arc<dyn OpCompute> {
        &self.compute
    }

    pub fn inputs(&self) -> &[InputDef] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[OutputDef] {
        &self.outputs
    }

    pub fn input(&self, name: &str) -> Option<&InputDef> {
        self.inputs.iter().find(|i| i.name == name)
    }

    pub fn output(&self, name: &str) -> Option<&OutputDef> {
        self.outputs.iter().find(|o| o.name == name)
    }

    pub fn required_resource_keys(&self) -> &[String] {
        &self.required_resource_keys
    }

    pub fn retry_policy(&self) -> Option<&RetryPolicy> {
        self.retry_policy.as_ref()
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }
}

pub struct NodeBuilder {
    name: String,
    compute: Option<Arc<dyn OpCompute>>,
    inputs: Vec<InputDef>,
    outputs: Vec<OutputDef>,
    required_resource_keys: Vec<String>,
    retry_policy: Option<RetryPolicy>,
    description: Option<String>,
}

impl NodeBuilder {
    pub fn compute(mut self, compute: Arc<dyn OpCompute>) -> Self {
        self.compute = Some(compute);
        self
    }

    /// Sugar for closure-based nodes.
    pub fn compute_fn<F>(self, func: F) -> Self
    where
        F: for<'a> Fn(&'a OpContext) -> BoxFuture<'a, anyhow::Result<OpOutputs>>
            + Send
            + Sync
            + 'static,
    {
        self.compute(Arc::new(FnCompute::new(func)))
    }

    pub fn input(mut self, input: InputDef) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn output(mut self, output: OutputDef) -> Self {
        self.outputs.push(output);
        self
    }

    pub fn require_resource(mut self, key: impl Into<String>) -> Self {
        self.required_resource_keys.push(key.into());
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn build(self) -> Result<NodeDefinition> {
        let compute = self.compute.ok_or_else(|| {
            FlowError::invalid_graph(format!("node '{}' has no compute", self.name))
        })?;

        let mut seen = HashSet::new();
        for input in &self.inputs {
            if !seen.insert(input.name.as_str()) {
                return Err(FlowError::invalid_graph(format!(
                    "node '{}' declares input '{}' twice",
                    self.name, input.name
                )));
            }
        }
        let mut outputs = self.outputs;
        if outputs.is_empty() {
            outputs.push(OutputDef::new(DEFAULT_OUTPUT, ValueType::Any));
        }
        let mut seen = HashSet::new();
        for output in &outputs {
            if !seen.insert(output.name.as_str()) {
                return Err(FlowError::invalid_graph(format!(
                    "node '{}' declares output '{}' twice",
                    self.name, output.name
                )));
            }
        }

        Ok(NodeDefinition {
            name: self.name,
            compute,
            inputs: self.inputs,
            outputs,
            required_resource_keys: self.required_resource_keys,
            retry_policy: self.retry_policy,
            description: self.description,
        })
    }
}

/// One dependency wire: producer output feeds consumer input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub producer: String,
    pub output: String,
    pub consumer: String,
    pub input: String,
}

/// A dependency-wired collection of nodes. Referenced, never mutated, by
/// downstream components.
#[derive(Clone)]
pub struct GraphDefinition {
    name: String,
    nodes: Vec<NodeDefinition>,
    edges: Vec<DependencyEdge>,
    node_index: HashMap<String, usize>,
}

impl std::fmt::Debug for GraphDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphDefinition")
            .field("name", &self.name)
            .field(
                "nodes",
                &self.nodes.iter().map(|n| n.name.as_str()).collect::<Vec<_>>(),
            )
            .field("edges", &self.edges)
            .finish()
    }
}

impl GraphDefinition {
    pub fn builder(name: impl Into<String>) -> GraphBuilder {
        GraphBuilder {
            name: name.into(),
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Nodes in declaration order.
    pub fn nodes(&self) -> &[NodeDefinition] {
        &self.nodes
    }

    pub fn edges(&self) -> &[DependencyEdge] {
        &self.edges
    }

    pub fn node(&self, name: &str) -> Option<&NodeDefinition> {
        self.node_index.get(name).map(|i| &self.nodes[*i])
    }

    pub fn node_position(&self, name: &str) -> Option<usize> {
        self.node_index.get(name).copied()
    }
}

pub struct GraphBuilder {
    name: String,
    nodes: Vec<NodeDefinition>,
    edges: Vec<DependencyEdge>,
}

impl GraphBuilder {
    pub fn add_node(mut self, node: NodeDefinition) -> Self {
        self.nodes.push(node);
        self
    }

    /// Wire `producer`'s named output into `consumer`'s named input.
    pub fn wire(
        mut self,
        producer: impl Into<String>,
        output: impl Into<String>,
        consumer: impl Into<String>,
        input: impl Into<String>,
    ) -> Self {
        self.edges.push(DependencyEdge {
            producer: producer.into(),
            output: output.into(),
            consumer: consumer.into(),
            input: input.into(),
        });
        self
    }

    /// Wire `producer`'s default output into `consumer`'s named input.
    pub fn wire_default(
        self,
        producer: impl Into<String>,
        consumer: impl Into<String>,
        input: impl Into<String>,
    ) -> Self {
        self.wire(producer, DEFAULT_OUTPUT, consumer, input)
    }

    pub fn build(self) -> Result<GraphDefinition> {
        let mut node_index = HashMap::new();
        for (i, node) in self.nodes.iter().enumerate() {
            if node_index.insert(node.name().to_string(), i).is_some() {
                return Err(FlowError::invalid_graph(format!(
                    "graph '{}' contains two nodes named '{}'",
                    self.name,
                    node.name()
                )));
            }
        }

        let mut wired_inputs = HashSet::new();
        for edge in &self.edges {
            let producer = self
                .nodes
                .get(*node_index.get(&edge.producer).ok_or_else(|| {
                    FlowError::invalid_graph(format!(
                        "edge references unknown producer '{}'",
                        edge.producer
                    ))
                })?)
                .unwrap();
            let consumer = self
                .nodes
                .get(*node_index.get(&edge.consumer).ok_or_else(|| {
                    FlowError::invalid_graph(format!(
                        "edge references unknown consumer '{}'",
                        edge.consumer
                    ))
                })?)
                .unwrap();

            if producer.output(&edge.output).is_none() {
                return Err(FlowError::invalid_graph(format!(
                    "node '{}' has no output '{}'",
                    edge.producer, edge.output
                )));
            }
            if consumer.input(&edge.input).is_none() {
                return Err(FlowError::invalid_graph(format!(
                    "node '{}' has no input '{}'",
                    edge.consumer, edge.input
                )));
            }
            if !wired_inputs.insert((edge.consumer.clone(), edge.input.clone())) {
                return Err(FlowError::invalid_graph(format!(
                    "input '{}' of node '{}' is wired more than once",
                    edge.input, edge.consumer
                )));
            }
        }

        Ok(GraphDefinition {
            name: self.name,
            nodes: self.nodes,
            edges: self.edges,
            node_index,
        })
    }
}

/// A graph bound to concrete resource and io-manager definitions, ready to
/// execute.
#[derive(Clone)]
pub struct JobDefinition {
    name: String,
    graph: Arc<GraphDefinition>,
    resources: HashMap<String, ResourceDefinition>,
    io_managers: HashMap<String, IoManagerDefinition>,
    default_io_manager_key: String,
    tags: HashMap<String, String>,
}

impl JobDefinition {
    pub fn builder(name: impl Into<String>, graph: GraphDefinition) -> JobBuilder {
        JobBuilder {
            name: name.into(),
            graph,
            resources: HashMap::new(),
            io_managers: HashMap::new(),
            default_io_manager_key: None,
            tags: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn graph(&self) -> &GraphDefinition {
        &self.graph
    }

    pub fn resources(&self) -> &HashMap<String, ResourceDefinition> {
        &self.resources
    }

    pub fn io_managers(&self) -> &HashMap<String, IoManagerDefinition> {
        &self.io_managers
    }

    pub fn default_io_manager_key(&self) -> &str {
        &self.default_io_manager_key
    }

    pub fn tags(&self) -> &HashMap<String, String> {
        &self.tags
    }
}

pub struct JobBuilder {
    name: String,
    graph: GraphDefinition,
    resources: HashMap<String, ResourceDefinition>,
    io_managers: HashMap<String, IoManagerDefinition>,
    default_io_manager_key: Option<String>,
    tags: HashMap<String, String>,
}

impl JobBuilder {
    pub fn resource(mut self, key: impl Into<String>, def: ResourceDefinition) -> Self {
        self.resources.insert(key.into(), def);
        self
    }

    pub fn io_manager(mut self, key: impl Into<String>, def: IoManagerDefinition) -> Self {
        self.io_managers.insert(key.into(), def);
        self
    }

    pub fn default_io_manager_key(mut self, key: impl Into<String>) -> Self {
        self.default_io_manager_key = Some(key.into());
        self
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> Result<JobDefinition> {
        for key in self.io_managers.keys() {
            if self.resources.contains_key(key) {
                return Err(FlowError::invalid_graph(format!(
                    "key '{}' is bound as both a resource and an io manager",
                    key
                )));
            }
        }

        let default_key = self
            .default_io_manager_key
            .unwrap_or_else(|| DEFAULT_IO_MANAGER_KEY.to_string());

        let mut io_managers = self.io_managers;
        if !io_managers.contains_key(&default_key) {
            if default_key != DEFAULT_IO_MANAGER_KEY {
                return Err(FlowError::invalid_graph(format!(
                    "default io manager key '{}' has no binding",
                    default_key
                )));
            }
            // Unconfigured jobs fall back to per-run in-memory persistence.
            io_managers.insert(
                default_key.clone(),
                IoManagerDefinition::in_memory(AddressingMode::PerRun),
            );
        }

        Ok(JobDefinition {
            name: self.name,
            graph: Arc::new(self.graph),
            resources: self.resources,
            io_managers,
            default_io_manager_key: default_key,
            tags: self.tags,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn noop_node(name: &str) -> NodeDefinition {
        NodeDefinition::builder(name)
            .compute_fn(|_ctx| Box::pin(async { Ok(OpOutputs::of(json!(null))) }))
            .build()
            .unwrap()
    }

    #[test]
    fn test_default_output_added() {
        let node = noop_node("a");
        assert_eq!(node.outputs().len(), 1);
        assert_eq!(node.outputs()[0].name, DEFAULT_OUTPUT);
    }

    #[test]
    fn test_duplicate_node_names_rejected() {
        let err = GraphDefinition::builder("g")
            .add_node(noop_node("a"))
            .add_node(noop_node("a"))
            .build()
            .unwrap_err();
        assert!(matches!(err, FlowError::InvalidGraph { .. }));
    }

    #[test]
    fn test_edge_validation() {
        let err = GraphDefinition::builder("g")
            .add_node(noop_node("a"))
            .wire_default("a", "missing", "x")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("unknown consumer"));
    }

    #[test]
    fn test_double_wire_rejected() {
        let consumer = NodeDefinition::builder("b")
            .input(InputDef::new("x", ValueType::Any))
            .compute_fn(|_ctx| Box::pin(async { Ok(OpOutputs::new()) }))
            .build()
            .unwrap();
        let err = GraphDefinition::builder("g")
            .add_node(noop_node("a"))
            .add_node(consumer)
            .wire_default("a", "b", "x")
            .wire_default("a", "b", "x")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("wired more than once"));
    }

    #[test]
    fn test_job_gets_default_io_manager() {
        let graph = GraphDefinition::builder("g")
            .add_node(noop_node("a"))
            .build()
            .unwrap();
        let job = JobDefinition::builder("j", graph).build().unwrap();
        assert_eq!(job.default_io_manager_key(), DEFAULT_IO_MANAGER_KEY);
        assert!(job.io_managers().contains_key(DEFAULT_IO_MANAGER_KEY));
    }

    #[test]
    fn test_retry_delays() {
        let policy = RetryPolicy::new(3)
            .with_delay(Duration::from_millis(100))
            .with_backoff(Backoff::Exponential);
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));

        let linear = RetryPolicy::new(3)
            .with_delay(Duration::from_millis(100))
            .with_backoff(Backoff::Linear);
        assert_eq!(linear.delay_for(2), Duration::from_millis(200));

        let none = RetryPolicy::new(3).with_backoff(Backoff::None);
        assert_eq!(none.delay_for(2), Duration::ZERO);
    }

    #[test]
    fn test_retry_delay_saturates_instead_of_overflowing() {
        let exponential = RetryPolicy::new(40)
            .with_delay(Duration::from_secs(u64::MAX / 2))
            .with_backoff(Backoff::Exponential);
        assert_eq!(exponential.delay_for(30), Duration::MAX);

        let linear = RetryPolicy::new(5)
            .with_delay(Duration::MAX)
            .with_backoff(Backoff::Linear);
        assert_eq!(linear.delay_for(3), Duration::MAX);
    }

    #[test]
    fn test_value_type_compatibility() {
        assert!(ValueType::Any.accepts(&ValueType::Int));
        assert!(ValueType::Int.accepts(&ValueType::Any));
        assert!(ValueType::Int.accepts(&ValueType::Int));
        assert!(!ValueType::Int.accepts(&ValueType::String));
    }
}
