//! Step scheduler: walks an execution plan, dispatching eligible steps
//! concurrently under a bounded semaphore, applying retry policy and
//! driving resource and io-manager calls.
//!
//! Eligible steps are spawned as tasks; outcomes come back on a channel and
//! unlock dependents. A dependency edge is never violated: a consumer's
//! STEP_START cannot precede its producer's terminal success, because the
//! consumer is only spawned once every upstream step has succeeded.
//! Failures skip transitive dependents and fail the run without aborting
//! sibling branches.

pub mod context;

pub use context::OpContext;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, info, warn};

use crate::core::config::RunConfig;
use crate::core::errors::Result;
use crate::events::{EventLog, EventRecord, EventSink, FlowEventType};
use crate::graph::JobDefinition;
use crate::io_manager::{InputContext, OutputContext};
use crate::plan::{build_plan, ExecutionStep, OpSelection, StepInputSource};
use crate::resources::ResourceRegistry;

/// Terminal status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Success,
    Failure,
    Canceled,
}

/// Outcome of one run: status plus the complete ordered event log.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub run_id: String,
    pub status: RunStatus,
    pub events: Vec<EventRecord>,
}

impl RunResult {
    pub fn events_of_type(&self, event_type: FlowEventType) -> Vec<&EventRecord> {
        self.events
            .iter()
            .filter(|e| e.event_type == event_type)
            .collect()
    }

    pub fn step_events(&self, step_key: &str) -> Vec<&EventRecord> {
        self.events
            .iter()
            .filter(|e| e.step_key.as_deref() == Some(step_key))
            .collect()
    }

    /// Sequence number of the first matching event, if any.
    pub fn sequence_of(&self, step_key: &str, event_type: FlowEventType) -> Option<u64> {
        self.events
            .iter()
            .find(|e| e.step_key.as_deref() == Some(step_key) && e.event_type == event_type)
            .map(|e| e.sequence)
    }
}

/// Receiver side of a run-level cancel signal.
pub type CancelSignal = watch::Receiver<bool>;

/// Sender side of a run-level cancel signal. Cancelling stops scheduling of
/// new steps immediately; in-flight steps finish (retry backoff waits are
/// interrupted) and unstarted steps are marked canceled.
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn new() -> (Self, CancelSignal) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, rx)
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Knobs for one execution.
pub struct ExecuteOptions {
    pub selection: Option<OpSelection>,
    /// Upper bound on concurrently running steps.
    pub max_concurrent_steps: usize,
    /// Fixed run id; generated when absent.
    pub run_id: Option<String>,
    /// Observer receiving each event as it is appended.
    pub event_sink: Option<Arc<dyn EventSink>>,
    pub cancel: Option<CancelSignal>,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            selection: None,
            max_concurrent_steps: 8,
            run_id: None,
            event_sink: None,
            cancel: None,
        }
    }
}

/// Execute `job` with default options.
///
/// Structural errors (cycles, unresolved inputs or keys, bad selections)
/// and resource initialization failures return `Err` before any step runs.
/// Step failures are reported through [`RunResult::status`] and the event
/// log; they never surface as `Err`.
pub async fn execute(job: &JobDefinition, run_config: RunConfig) -> Result<RunResult> {
    execute_with_options(job, run_config, ExecuteOptions::default()).await
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Canceled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptResult {
    Succeeded,
    Failed,
    Canceled,
}

struct StepOutcome {
    step_key: String,
    result: AttemptResult,
}

pub async fn execute_with_options(
    job: &JobDefinition,
    run_config: RunConfig,
    options: ExecuteOptions,
) -> Result<RunResult> {
    let plan = build_plan(job, options.selection.as_ref())?;
    let registry = Arc::new(ResourceRegistry::build(job, &run_config)?);

    let run_id = options.run_id.unwrap_or_else(cuid2::create_id);
    let log = Arc::new(EventLog::new(run_id.clone(), options.event_sink));
    info!(run_id = %run_id, job = %job.name(), steps = plan.len(), "starting run");
    log.append(
        None,
        FlowEventType::RunStart,
        json!({"job": job.name(), "step_count": plan.len()}),
    );

    // Scheduler bookkeeping, all keyed by step key.
    let mut states: HashMap<String, StepState> = plan
        .steps()
        .iter()
        .map(|s| (s.key.clone(), StepState::Pending))
        .collect();
    let mut remaining_deps: HashMap<String, usize> = plan
        .steps()
        .iter()
        .map(|s| (s.key.clone(), s.upstream_steps.len()))
        .collect();
    let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
    for step in plan.steps() {
        for upstream in &step.upstream_steps {
            dependents
                .entry(upstream.clone())
                .or_default()
                .push(step.key.clone());
        }
    }

    let mut ready: Vec<String> = plan
        .steps()
        .iter()
        .filter(|s| s.upstream_steps.is_empty())
        .map(|s| s.key.clone())
        .collect();

    let semaphore = Arc::new(Semaphore::new(options.max_concurrent_steps.max(1)));
    let (tx, mut rx) = mpsc::unbounded_channel::<StepOutcome>();

    let mut cancel = options.cancel;
    let mut canceled = cancel
        .as_ref()
        .map(|rx| *rx.borrow())
        .unwrap_or(false);
    let mut active: usize = 0;

    loop {
        if !canceled {
            for key in std::mem::take(&mut ready) {
                states.insert(key.clone(), StepState::Running);
                active += 1;
                spawn_step(
                    plan.step(&key).expect("planned").clone(),
                    job,
                    &run_config,
                    registry.clone(),
                    log.clone(),
                    run_id.clone(),
                    semaphore.clone(),
                    cancel.clone(),
                    tx.clone(),
                );
            }
        }

        if active == 0 {
            break;
        }

        tokio::select! {
            outcome = rx.recv() => {
                let outcome = outcome.expect("outcome channel held open by scheduler");
                active -= 1;
                debug!(step = %outcome.step_key, result = ?outcome.result, "step finished");
                match outcome.result {
                    AttemptResult::Succeeded => {
                        states.insert(outcome.step_key.clone(), StepState::Succeeded);
                        let mut unlocked = Vec::new();
                        if let Some(children) = dependents.get(&outcome.step_key) {
                            for child in children {
                                let deps = remaining_deps.get_mut(child).expect("planned");
                                *deps -= 1;
                                if *deps == 0 && states[child] == StepState::Pending {
                                    unlocked.push(child.clone());
                                }
                            }
                        }
                        // Deterministic launch order for sibling steps.
                        unlocked.sort_by_key(|k| plan.position(k));
                        ready.extend(unlocked);
                    }
                    AttemptResult::Failed => {
                        states.insert(outcome.step_key.clone(), StepState::Failed);
                        skip_dependents(&outcome.step_key, &dependents, &mut states, &log);
                    }
                    AttemptResult::Canceled => {
                        // A canceled attempt implies the run-level signal
                        // fired; the select arm below may not have observed
                        // it yet.
                        canceled = true;
                        states.insert(outcome.step_key.clone(), StepState::Canceled);
                        log.append(
                            Some(&outcome.step_key),
                            FlowEventType::StepCanceled,
                            json!({"reason": "run canceled during retry backoff"}),
                        );
                        skip_dependents(&outcome.step_key, &dependents, &mut states, &log);
                    }
                }
            }
            _ = cancel_requested(&mut cancel), if !canceled => {
                info!(run_id = %run_id, "cancel signal received");
                canceled = true;
            }
        }
    }

    // Steps never scheduled: canceled runs mark them CANCELED.
    for step in plan.steps() {
        if states[&step.key] == StepState::Pending {
            if canceled {
                states.insert(step.key.clone(), StepState::Canceled);
                log.append(
                    Some(&step.key),
                    FlowEventType::StepCanceled,
                    json!({"reason": "run canceled before step started"}),
                );
            } else {
                // Unreachable with a valid plan; record it rather than hang.
                warn!(step = %step.key, "step never became eligible");
                states.insert(step.key.clone(), StepState::Skipped);
                log.append(
                    Some(&step.key),
                    FlowEventType::StepSkipped,
                    json!({"reason": "never became eligible"}),
                );
            }
        }
    }

    let failed = states.values().filter(|s| **s == StepState::Failed).count();
    let succeeded = states
        .values()
        .filter(|s| **s == StepState::Succeeded)
        .count();
    let status = if canceled {
        RunStatus::Canceled
    } else if failed > 0 {
        RunStatus::Failure
    } else {
        RunStatus::Success
    };

    let summary = json!({
        "succeeded": succeeded,
        "failed": failed,
        "skipped": states.values().filter(|s| **s == StepState::Skipped).count(),
        "canceled": states.values().filter(|s| **s == StepState::Canceled).count(),
    });
    let terminal = match status {
        RunStatus::Success => FlowEventType::RunSuccess,
        RunStatus::Failure => FlowEventType::RunFailure,
        RunStatus::Canceled => FlowEventType::RunCanceled,
    };
    log.append(None, terminal, summary);
    info!(run_id = %run_id, status = ?status, "run finished");

    Ok(RunResult {
        run_id,
        status,
        events: log.records(),
    })
}

/// Resolves only when cancellation is requested; pends forever otherwise.
async fn cancel_requested(cancel: &mut Option<CancelSignal>) {
    match cancel {
        Some(rx) => loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                // Sender dropped without cancelling; never resolves.
                futures::future::pending::<()>().await;
            }
        },
        None => futures::future::pending().await,
    }
}

/// Transitively mark pending dependents of a failed or canceled step.
fn skip_dependents(
    origin: &str,
    dependents: &HashMap<String, Vec<String>>,
    states: &mut HashMap<String, StepState>,
    log: &EventLog,
) {
    let mut frontier = vec![origin.to_string()];
    while let Some(key) = frontier.pop() {
        if let Some(children) = dependents.get(&key) {
            for child in children {
                if states[child] == StepState::Pending {
                    states.insert(child.clone(), StepState::Skipped);
                    log.append(
                        Some(child),
                        FlowEventType::StepSkipped,
                        json!({"reason": "upstream_failure", "upstream_step": key}),
                    );
                    frontier.push(child.clone());
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_step(
    step: ExecutionStep,
    job: &JobDefinition,
    run_config: &RunConfig,
    registry: Arc<ResourceRegistry>,
    log: Arc<EventLog>,
    run_id: String,
    semaphore: Arc<Semaphore>,
    cancel: Option<CancelSignal>,
    tx: mpsc::UnboundedSender<StepOutcome>,
) {
    let node = job
        .graph()
        .node(&step.key)
        .expect("plan step references a graph node");
    let compute = node.compute().clone();
    let node_config = run_config.op_config(&step.key).cloned();

    tokio::spawn(async move {
        let _permit = semaphore
            .acquire_owned()
            .await
            .expect("semaphore never closed");

        // Exclusive resources serialize their steps. Locks are taken in
        // sorted key order so overlapping requirement sets cannot deadlock.
        let mut exclusive_keys: Vec<&String> = step
            .resource_keys
            .iter()
            .filter(|k| registry.exclusive_lock(k).is_some())
            .collect();
        exclusive_keys.sort_unstable();
        let mut guards = Vec::with_capacity(exclusive_keys.len());
        for key in exclusive_keys {
            let lock = registry.exclusive_lock(key).expect("filtered above");
            guards.push(lock.lock_owned().await);
        }

        let result = run_step(
            &step,
            compute,
            registry,
            &log,
            &run_id,
            node_config,
            cancel,
        )
        .await;

        let _ = tx.send(StepOutcome {
            step_key: step.key,
            result,
        });
    });
}

/// Drive one step through its attempts, retrying per policy. Each attempt
/// repeats the full subsequence: inputs are re-resolved, never cached
/// across attempts.
#[allow(clippy::too_many_arguments)]
async fn run_step(
    step: &ExecutionStep,
    compute: Arc<dyn crate::graph::OpCompute>,
    registry: Arc<ResourceRegistry>,
    log: &Arc<EventLog>,
    run_id: &str,
    node_config: Option<Value>,
    cancel: Option<CancelSignal>,
) -> AttemptResult {
    let max_retries = step.retry_policy.as_ref().map(|p| p.max_retries).unwrap_or(0);
    let mut attempt: u32 = 0;

    loop {
        log.append(
            Some(&step.key),
            FlowEventType::StepStart,
            json!({"attempt": attempt}),
        );

        // A panicking compute must not unwind past the outcome channel;
        // contained here it becomes an ordinary attempt error.
        let attempt_future = run_attempt(
            step,
            &compute,
            &registry,
            log,
            run_id,
            node_config.clone(),
            attempt,
        );
        let outcome = match AssertUnwindSafe(attempt_future).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => Err(anyhow::anyhow!(
                "compute panicked: {}",
                panic_message(&panic)
            )),
        };

        match outcome {
            Ok(()) => {
                log.append(
                    Some(&step.key),
                    FlowEventType::StepSuccess,
                    json!({"attempt": attempt}),
                );
                return AttemptResult::Succeeded;
            }
            Err(err) => {
                warn!(step = %step.key, attempt, error = %err, "step attempt failed");
                if attempt < max_retries {
                    let policy = step.retry_policy.as_ref().expect("max_retries > 0");
                    attempt += 1;
                    let delay = policy.delay_for(attempt);
                    log.append(
                        Some(&step.key),
                        FlowEventType::StepUpForRetry,
                        json!({
                            "error": format!("{err:#}"),
                            "next_attempt": attempt,
                            "delay_ms": delay.as_millis() as u64,
                        }),
                    );
                    if !sleep_unless_canceled(delay, cancel.clone()).await {
                        return AttemptResult::Canceled;
                    }
                } else {
                    log.append(
                        Some(&step.key),
                        FlowEventType::StepFailure,
                        json!({
                            "error": format!("{err:#}"),
                            "attempts": attempt + 1,
                        }),
                    );
                    return AttemptResult::Failed;
                }
            }
        }
    }
}

/// One attempt: resolve inputs, invoke compute, handle outputs.
#[allow(clippy::too_many_arguments)]
async fn run_attempt(
    step: &ExecutionStep,
    compute: &Arc<dyn crate::graph::OpCompute>,
    registry: &Arc<ResourceRegistry>,
    log: &Arc<EventLog>,
    run_id: &str,
    node_config: Option<Value>,
    attempt: u32,
) -> anyhow::Result<()> {
    let mut inputs = HashMap::with_capacity(step.inputs.len());
    for input in &step.inputs {
        let (value, source, manager_key) = match &input.source {
            StepInputSource::Literal(value) => (value.clone(), "literal", None),
            StepInputSource::Upstream {
                handle,
                io_manager_key,
                asset_key,
            } => {
                // Upstream values are persisted by handle_output before the
                // producer succeeds, so within-run edges load through the
                // resolved manager too.
                let manager = registry
                    .io_manager(io_manager_key)
                    .map_err(|e| anyhow::anyhow!("{}", e))?;
                let ctx = InputContext {
                    run_id,
                    step_key: &step.key,
                    input_name: &input.name,
                    upstream: Some((&handle.step_key, &handle.output_name)),
                    asset_key: asset_key.as_deref(),
                };
                let value = manager.load_input(&ctx).await.map_err(|e| {
                    anyhow::anyhow!(
                        "io manager '{}' failed loading input '{}': {:#}",
                        io_manager_key,
                        input.name,
                        e
                    )
                })?;
                (value, "io_manager", Some(io_manager_key.as_str()))
            }
            StepInputSource::Asset {
                asset_key,
                io_manager_key,
            } => {
                let manager = registry
                    .io_manager(io_manager_key)
                    .map_err(|e| anyhow::anyhow!("{}", e))?;
                let ctx = InputContext {
                    run_id,
                    step_key: &step.key,
                    input_name: &input.name,
                    upstream: None,
                    asset_key: Some(asset_key),
                };
                let value = manager.load_input(&ctx).await.map_err(|e| {
                    anyhow::anyhow!(
                        "io manager '{}' failed loading asset '{}': {:#}",
                        io_manager_key,
                        asset_key,
                        e
                    )
                })?;
                (value, "io_manager", Some(io_manager_key.as_str()))
            }
        };

        log.append(
            Some(&step.key),
            FlowEventType::LoadedInput,
            json!({
                "input": input.name,
                "source": source,
                "manager_key": manager_key,
                "attempt": attempt,
            }),
        );
        inputs.insert(input.name.clone(), value);
    }

    let ctx = OpContext::new(
        run_id.to_string(),
        step.key.clone(),
        attempt,
        node_config,
        inputs,
        registry.clone(),
        step.resource_keys.clone(),
        log.clone(),
    );
    let outputs = compute.compute(&ctx).await?;
    let mut produced = outputs.into_map();

    for output in &step.outputs {
        let value = produced.remove(&output.name).ok_or_else(|| {
            anyhow::anyhow!(
                "compute did not produce declared output '{}'",
                output.name
            )
        })?;
        log.append(
            Some(&step.key),
            FlowEventType::StepOutput,
            json!({"output": output.name, "attempt": attempt}),
        );

        let manager = registry
            .io_manager(&output.io_manager_key)
            .map_err(|e| anyhow::anyhow!("{}", e))?;
        let octx = OutputContext {
            run_id,
            step_key: &step.key,
            output_name: &output.name,
            asset_key: output.asset_key.as_deref(),
        };
        manager.handle_output(&octx, &value).await.map_err(|e| {
            anyhow::anyhow!(
                "io manager '{}' failed handling output '{}': {:#}",
                output.io_manager_key,
                output.name,
                e
            )
        })?;
        log.append(
            Some(&step.key),
            FlowEventType::HandledOutput,
            json!({
                "output": output.name,
                "manager_key": output.io_manager_key,
                "attempt": attempt,
            }),
        );
    }

    if !produced.is_empty() {
        let undeclared: Vec<String> = produced.into_keys().collect();
        anyhow::bail!("compute produced undeclared outputs: {:?}", undeclared);
    }

    Ok(())
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

/// Sleep out a retry delay, racing the cancel signal. Returns false when
/// the wait was interrupted by cancellation.
async fn sleep_unless_canceled(
    delay: std::time::Duration,
    mut cancel: Option<CancelSignal>,
) -> bool {
    if delay.is_zero() {
        return !cancel.as_ref().map(|rx| *rx.borrow()).unwrap_or(false);
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = cancel_requested(&mut cancel) => false,
    }
}
