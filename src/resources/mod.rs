//! Resource definitions and the per-run resource registry.
//!
//! Resources are constructed dependencies (clients, connections, settings)
//! injected into op compute calls and io managers. They form their own small
//! DAG: a definition may declare dependencies on other resource keys, and
//! the registry instantiates every key exactly once per run in dependency
//! order, threading already-built instances into each factory. Any factory
//! failure is fatal for the run before a single step starts.

use serde_json::Value;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::core::config::RunConfig;
use crate::core::errors::{FlowError, Result};
use crate::graph::JobDefinition;
use crate::io_manager::IoManager;

/// A built resource, stored type-erased and recovered via downcast.
pub type ResourceInstance = Arc<dyn Any + Send + Sync>;

/// Context handed to a resource factory: its config bag from the run config
/// and the already-built instances of its declared dependencies.
pub struct ResourceInitContext<'a> {
    key: &'a str,
    config: Option<&'a Value>,
    dependency_keys: &'a [String],
    built: &'a HashMap<String, ResourceInstance>,
}

impl<'a> ResourceInitContext<'a> {
    pub fn key(&self) -> &str {
        self.key
    }

    pub fn config(&self) -> Option<&Value> {
        self.config
    }

    /// Deserialize this resource's config bag.
    pub fn config_as<T: serde::de::DeserializeOwned>(&self) -> anyhow::Result<T> {
        let value = self
            .config
            .ok_or_else(|| anyhow::anyhow!("no config provided for resource '{}'", self.key))?;
        serde_json::from_value(value.clone())
            .map_err(|e| anyhow::anyhow!("bad config for resource '{}': {}", self.key, e))
    }

    /// Fetch a declared dependency instance, downcast to its concrete type.
    pub fn resource<T: Any + Send + Sync>(&self, key: &str) -> anyhow::Result<Arc<T>> {
        if !self.dependency_keys.iter().any(|k| k == key) {
            anyhow::bail!(
                "resource '{}' does not declare a dependency on '{}'",
                self.key,
                key
            );
        }
        let instance = self
            .built
            .get(key)
            .ok_or_else(|| anyhow::anyhow!("dependency resource '{}' not built", key))?;
        instance
            .clone()
            .downcast::<T>()
            .map_err(|_| anyhow::anyhow!("resource '{}' has a different concrete type", key))
    }
}

type ResourceFactory =
    Arc<dyn Fn(&ResourceInitContext<'_>) -> anyhow::Result<ResourceInstance> + Send + Sync>;

/// Factory for one resource key: config + dependency instances in, instance
/// out. Immutable after construction.
#[derive(Clone)]
pub struct ResourceDefinition {
    factory: ResourceFactory,
    dependency_keys: Vec<String>,
    exclusive: bool,
    description: Option<String>,
}

impl ResourceDefinition {
    pub fn new<T, F>(factory: F) -> Self
    where
        T: Any + Send + Sync,
        F: Fn(&ResourceInitContext<'_>) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        Self {
            factory: Arc::new(move |ctx| {
                let instance = factory(ctx)?;
                Ok(Arc::new(instance) as ResourceInstance)
            }),
            dependency_keys: Vec::new(),
            exclusive: false,
            description: None,
        }
    }

    /// A resource that is just a pre-built value, cloned into the run.
    pub fn from_value<T: Any + Send + Sync + Clone>(value: T) -> Self {
        Self::new(move |_ctx| Ok(value.clone()))
    }

    /// Declare dependencies on other resource keys.
    pub fn with_dependencies<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependency_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Mark this resource exclusive: the engine serializes all steps that
    /// require its key, never running two of them concurrently.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn dependency_keys(&self) -> &[String] {
        &self.dependency_keys
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub(crate) fn instantiate(
        &self,
        ctx: &ResourceInitContext<'_>,
    ) -> anyhow::Result<ResourceInstance> {
        (self.factory)(ctx)
    }
}

/// Per-run registry of built resource and io-manager instances.
///
/// Built once at the start of a run, before any step is scheduled, then
/// shared read-only across concurrently executing steps.
pub struct ResourceRegistry {
    instances: HashMap<String, ResourceInstance>,
    io_managers: HashMap<String, Arc<dyn IoManager>>,
    exclusive_locks: HashMap<String, Arc<Mutex<()>>>,
}

impl std::fmt::Debug for ResourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceRegistry")
            .field("instances", &self.instances.keys().collect::<Vec<_>>())
            .field("io_managers", &self.io_managers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ResourceRegistry {
    /// Instantiate every resource and io-manager binding of `job` exactly
    /// once, in topological order of the resource dependency graph.
    ///
    /// Fails fast: a missing dependency key, a dependency cycle, or a
    /// factory error aborts with no partial registry.
    pub fn build(job: &JobDefinition, run_config: &RunConfig) -> Result<Self> {
        let order = dependency_order(job)?;

        let mut instances: HashMap<String, ResourceInstance> = HashMap::new();
        let mut io_managers: HashMap<String, Arc<dyn IoManager>> = HashMap::new();
        let mut exclusive_locks = HashMap::new();

        for key in &order {
            let config = run_config.resource_config(key);
            if let Some(def) = job.resources().get(key) {
                let ctx = ResourceInitContext {
                    key,
                    config,
                    dependency_keys: def.dependency_keys(),
                    built: &instances,
                };
                let instance = def
                    .instantiate(&ctx)
                    .map_err(|e| FlowError::resource_init(key.clone(), e))?;
                debug!(key = %key, "initialized resource");
                instances.insert(key.clone(), instance);
                if def.is_exclusive() {
                    exclusive_locks.insert(key.clone(), Arc::new(Mutex::new(())));
                }
            } else if let Some(def) = job.io_managers().get(key) {
                let ctx = ResourceInitContext {
                    key,
                    config,
                    dependency_keys: def.dependency_keys(),
                    built: &instances,
                };
                let manager = def
                    .instantiate(&ctx)
                    .map_err(|e| FlowError::resource_init(key.clone(), e))?;
                debug!(key = %key, mode = ?def.mode(), "initialized io manager");
                io_managers.insert(key.clone(), manager);
            }
        }

        Ok(Self {
            instances,
            io_managers,
            exclusive_locks,
        })
    }

    /// Fetch a built resource, downcast to its concrete type.
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Result<Arc<T>> {
        let instance = self
            .instances
            .get(key)
            .ok_or_else(|| FlowError::unresolved_resource(key, "resource lookup"))?;
        instance.clone().downcast::<T>().map_err(|_| {
            FlowError::internal(format!(
                "resource '{}' is not of the requested concrete type",
                key
            ))
        })
    }

    pub fn io_manager(&self, key: &str) -> Result<Arc<dyn IoManager>> {
        self.io_managers
            .get(key)
            .cloned()
            .ok_or_else(|| FlowError::unresolved_resource(key, "io manager lookup"))
    }

    /// The serialization mutex for an exclusive resource key, if any.
    pub fn exclusive_lock(&self, key: &str) -> Option<Arc<Mutex<()>>> {
        self.exclusive_locks.get(key).cloned()
    }

    pub fn has_instance(&self, key: &str) -> bool {
        self.instances.contains_key(key)
    }
}

/// Topologically sort the union of resource and io-manager keys by declared
/// dependencies. Dependencies come before dependents; ties resolve in sorted
/// key order for determinism.
fn dependency_order(job: &JobDefinition) -> Result<Vec<String>> {
    let mut deps: HashMap<&str, &[String]> = HashMap::new();
    for (key, def) in job.resources() {
        deps.insert(key.as_str(), def.dependency_keys());
    }
    for (key, def) in job.io_managers() {
        deps.insert(key.as_str(), def.dependency_keys());
    }

    for (key, dep_keys) in &deps {
        for dep in dep_keys.iter() {
            if !deps.contains_key(dep.as_str()) {
                return Err(FlowError::unresolved_resource(
                    dep.clone(),
                    format!("resource '{}'", key),
                ));
            }
        }
    }

    // Kahn's algorithm over the key set.
    let mut in_degree: HashMap<&str, usize> =
        deps.keys().map(|k| (*k, 0)).collect();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for (key, dep_keys) in &deps {
        for dep in dep_keys.iter() {
            *in_degree.get_mut(key).unwrap() += 1;
            dependents.entry(dep.as_str()).or_default().push(key);
        }
    }

    let mut ready: Vec<&str> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(k, _)| *k)
        .collect();
    ready.sort_unstable();

    let mut order = Vec::with_capacity(deps.len());
    while let Some(key) = ready.first().copied() {
        ready.remove(0);
        order.push(key.to_string());
        if let Some(children) = dependents.get(key) {
            for child in children {
                let degree = in_degree.get_mut(child).unwrap();
                *degree -= 1;
                if *degree == 0 {
                    let pos = ready.binary_search(child).unwrap_or_else(|p| p);
                    ready.insert(pos, child);
                }
            }
        }
    }

    if order.len() != deps.len() {
        let mut remaining: Vec<String> = in_degree
            .iter()
            .filter(|(_, d)| **d > 0)
            .map(|(k, _)| k.to_string())
            .collect();
        remaining.sort_unstable();
        return Err(FlowError::cycle(remaining));
    }

    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Settings {
        prefix: String,
    }

    struct Client {
        url: String,
    }

    fn job_with_resources(
        resources: Vec<(&str, ResourceDefinition)>,
    ) -> JobDefinition {
        let graph = crate::graph::GraphDefinition::builder("g").build().unwrap();
        let mut builder = JobDefinition::builder("j", graph);
        for (key, def) in resources {
            builder = builder.resource(key, def);
        }
        builder.build().unwrap()
    }

    #[test]
    fn test_dependency_threading() {
        let job = job_with_resources(vec![
            (
                "settings",
                ResourceDefinition::new(|_ctx| {
                    Ok(Settings {
                        prefix: "postgres".to_string(),
                    })
                }),
            ),
            (
                "client",
                ResourceDefinition::new(|ctx: &ResourceInitContext<'_>| {
                    let settings = ctx.resource::<Settings>("settings")?;
                    Ok(Client {
                        url: format!("{}://db", settings.prefix),
                    })
                })
                .with_dependencies(["settings"]),
            ),
        ]);

        let registry = ResourceRegistry::build(&job, &RunConfig::new()).unwrap();
        let client = registry.get::<Client>("client").unwrap();
        assert_eq!(client.url, "postgres://db");
    }

    #[test]
    fn test_missing_dependency_fails_fast() {
        let job = job_with_resources(vec![(
            "client",
            ResourceDefinition::new(|_ctx| Ok(())).with_dependencies(["settings"]),
        )]);

        let err = ResourceRegistry::build(&job, &RunConfig::new()).unwrap_err();
        assert!(matches!(err, FlowError::UnresolvedResource { .. }));
    }

    #[test]
    fn test_dependency_cycle_fails_fast() {
        let job = job_with_resources(vec![
            (
                "a",
                ResourceDefinition::new(|_ctx| Ok(())).with_dependencies(["b"]),
            ),
            (
                "b",
                ResourceDefinition::new(|_ctx| Ok(())).with_dependencies(["a"]),
            ),
        ]);

        let err = ResourceRegistry::build(&job, &RunConfig::new()).unwrap_err();
        assert!(matches!(err, FlowError::GraphCycle { .. }));
    }

    #[test]
    fn test_factory_failure_is_resource_init() {
        let job = job_with_resources(vec![(
            "broken",
            ResourceDefinition::new(|_ctx| -> anyhow::Result<()> {
                anyhow::bail!("connection refused")
            }),
        )]);

        let err = ResourceRegistry::build(&job, &RunConfig::new()).unwrap_err();
        assert_eq!(err.category(), "resource_init");
    }

    #[test]
    fn test_config_reaches_factory() {
        let job = job_with_resources(vec![(
            "settings",
            ResourceDefinition::new(|ctx: &ResourceInitContext<'_>| {
                let prefix: String = ctx
                    .config()
                    .and_then(|c| c.get("prefix"))
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| "default".to_string());
                Ok(Settings { prefix })
            }),
        )]);

        let config = RunConfig::new()
            .with_resource_config("settings", serde_json::json!({"prefix": "custom"}));
        let registry = ResourceRegistry::build(&job, &config).unwrap();
        assert_eq!(registry.get::<Settings>("settings").unwrap().prefix, "custom");
    }

    #[test]
    fn test_exclusive_lock_present() {
        let job = job_with_resources(vec![
            ("plain", ResourceDefinition::from_value(1u32)),
            ("serial", ResourceDefinition::from_value(2u32).exclusive()),
        ]);

        let registry = ResourceRegistry::build(&job, &RunConfig::new()).unwrap();
        assert!(registry.exclusive_lock("serial").is_some());
        assert!(registry.exclusive_lock("plain").is_none());
    }
}
