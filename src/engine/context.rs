//! Execution context handed to op compute calls.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

use crate::events::{EventLog, FlowEventType};
use crate::resources::ResourceRegistry;

/// Per-attempt context passed by reference into compute. Carries resolved
/// inputs, the node's config bag, injected resources and the event log for
/// user-emitted materialization/expectation events. No ambient lookup: this
/// value is the only channel between a compute call and the engine.
pub struct OpContext {
    run_id: String,
    step_key: String,
    attempt: u32,
    config: Option<Value>,
    inputs: HashMap<String, Value>,
    registry: Arc<ResourceRegistry>,
    resource_keys: Vec<String>,
    log: Arc<EventLog>,
}

impl OpContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        run_id: String,
        step_key: String,
        attempt: u32,
        config: Option<Value>,
        inputs: HashMap<String, Value>,
        registry: Arc<ResourceRegistry>,
        resource_keys: Vec<String>,
        log: Arc<EventLog>,
    ) -> Self {
        Self {
            run_id,
            step_key,
            attempt,
            config,
            inputs,
            registry,
            resource_keys,
            log,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn step_key(&self) -> &str {
        &self.step_key
    }

    /// 0 for the first attempt, incremented per retry.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// This node's config bag from the run config.
    pub fn config(&self) -> Option<&Value> {
        self.config.as_ref()
    }

    pub fn config_as<T: serde::de::DeserializeOwned>(&self) -> anyhow::Result<T> {
        let value = self
            .config
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("no config provided for node '{}'", self.step_key))?;
        serde_json::from_value(value.clone())
            .map_err(|e| anyhow::anyhow!("bad config for node '{}': {}", self.step_key, e))
    }

    /// Raw resolved input value.
    pub fn input(&self, name: &str) -> anyhow::Result<&Value> {
        self.inputs
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("input '{}' not found on step '{}'", name, self.step_key))
    }

    /// Resolved input, deserialized.
    pub fn input_as<T: serde::de::DeserializeOwned>(&self, name: &str) -> anyhow::Result<T> {
        let value = self.input(name)?;
        serde_json::from_value(value.clone())
            .map_err(|e| anyhow::anyhow!("failed to deserialize input '{}': {}", name, e))
    }

    /// Injected resource instance, downcast to its concrete type. Only keys
    /// the node declared via `require_resource` are reachable.
    pub fn resource<T: std::any::Any + Send + Sync>(&self, key: &str) -> anyhow::Result<Arc<T>> {
        if !self.resource_keys.iter().any(|k| k == key) {
            anyhow::bail!(
                "step '{}' does not declare resource key '{}'",
                self.step_key,
                key
            );
        }
        self.registry
            .get::<T>(key)
            .map_err(|e| anyhow::anyhow!("{}", e))
    }

    /// Record a materialization of a stable asset from inside compute.
    pub fn log_asset_materialization(&self, asset_key: &str, metadata: Value) {
        self.log.append(
            Some(&self.step_key),
            FlowEventType::AssetMaterialization,
            json!({
                "asset_key": asset_key,
                "metadata": metadata,
                "attempt": self.attempt,
            }),
        );
    }

    /// Record a data-quality expectation result from inside compute.
    pub fn log_expectation_result(&self, label: &str, success: bool, metadata: Value) {
        self.log.append(
            Some(&self.step_key),
            FlowEventType::ExpectationResult,
            json!({
                "label": label,
                "success": success,
                "metadata": metadata,
                "attempt": self.attempt,
            }),
        );
    }
}
