//! Opflow - a dependency-graph execution engine.
//!
//! Given a declarative graph of computation nodes with typed inputs and
//! outputs, bound resources, and pluggable io managers, opflow builds a
//! validated execution plan, runs it honoring dependency order and retry
//! policy, and emits an ordered event stream describing what happened.
//!
//! ```no_run
//! use opflow::{
//!     execute, GraphDefinition, JobDefinition, NodeDefinition, OpOutputs, RunConfig,
//! };
//! use serde_json::json;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let node = NodeDefinition::builder("hello")
//!     .compute_fn(|_ctx| Box::pin(async { Ok(OpOutputs::of(json!("world"))) }))
//!     .build()?;
//! let graph = GraphDefinition::builder("demo").add_node(node).build()?;
//! let job = JobDefinition::builder("demo_job", graph).build()?;
//!
//! let result = execute(&job, RunConfig::new()).await?;
//! println!("{:?}", result.status);
//! # Ok(())
//! # }
//! ```

// Core infrastructure modules
pub mod core;

// Engine components, leaf-first
pub mod events;
pub mod graph;
pub mod io_manager;
pub mod plan;
pub mod resources;

pub mod engine;

// Re-exports for convenience
pub use core::config::RunConfig;
pub use core::errors::{FlowError, Result};
pub use engine::{
    execute, execute_with_options, CancelHandle, CancelSignal, ExecuteOptions, OpContext,
    RunResult, RunStatus,
};
pub use events::{BufferingEventSink, EventRecord, EventSink, FlowEventType, LoggingEventSink};
pub use graph::{
    Backoff, DependencyEdge, FnCompute, GraphDefinition, InputDef, JobDefinition, NodeDefinition,
    OpCompute, OpOutputs, OutputDef, RetryPolicy, ValueType, DEFAULT_IO_MANAGER_KEY,
    DEFAULT_OUTPUT,
};
pub use io_manager::{
    AddressingMode, FsIoManager, InMemIoManager, InputContext, IoManager, IoManagerDefinition,
    OutputContext,
};
pub use plan::{
    build_plan, ExecutionPlan, ExecutionStep, OpSelection, PlannedInput, PlannedOutput,
    SelectionScope, StepInputSource, StepOutputHandle,
};
pub use resources::{ResourceDefinition, ResourceInitContext, ResourceInstance, ResourceRegistry};
