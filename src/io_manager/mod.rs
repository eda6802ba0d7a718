//! I/O managers: resources specialized to persist step outputs and load
//! step inputs.
//!
//! Each manager instance commits to one [`AddressingMode`] at definition
//! time and never mixes modes:
//!
//! - `PerRun` keys a value by `run_id/step_key/output_name`; values from
//!   different runs never collide or overwrite each other.
//! - `AssetIdentity` keys a value by the output's stable asset key; each
//!   materialization overwrites the previous one.
//!
//! `handle_output` is an idempotent overwrite in both modes, so a retried
//! step re-handling its outputs is safe.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::resources::ResourceInitContext;

/// How a manager derives storage keys. Fixed per manager definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressingMode {
    /// `run_id/step_key/output_name`; never overwritten across runs.
    PerRun,
    /// Stable logical asset key; overwritten on each materialization.
    AssetIdentity,
}

/// Identity of an output being handled.
pub struct OutputContext<'a> {
    pub run_id: &'a str,
    pub step_key: &'a str,
    pub output_name: &'a str,
    pub asset_key: Option<&'a str>,
}

impl OutputContext<'_> {
    /// Storage key under the given addressing mode.
    pub fn storage_key(&self, mode: AddressingMode) -> anyhow::Result<String> {
        match mode {
            AddressingMode::PerRun => Ok(format!(
                "{}/{}/{}",
                self.run_id, self.step_key, self.output_name
            )),
            AddressingMode::AssetIdentity => {
                let asset_key = self.asset_key.ok_or_else(|| {
                    anyhow::anyhow!(
                        "output '{}' of step '{}' has no asset key for asset-identity addressing",
                        self.output_name,
                        self.step_key
                    )
                })?;
                Ok(format!("asset/{}", asset_key))
            }
        }
    }
}

/// Identity of an input being loaded: the upstream handle it refers to, or
/// a bare asset identity when the producer is not part of this run.
pub struct InputContext<'a> {
    pub run_id: &'a str,
    pub step_key: &'a str,
    pub input_name: &'a str,
    /// `(upstream step key, upstream output name)` when the value was
    /// produced by a step.
    pub upstream: Option<(&'a str, &'a str)>,
    pub asset_key: Option<&'a str>,
}

impl InputContext<'_> {
    /// Storage key under the given addressing mode.
    pub fn storage_key(&self, mode: AddressingMode) -> anyhow::Result<String> {
        match mode {
            AddressingMode::PerRun => {
                let (step, output) = self.upstream.ok_or_else(|| {
                    anyhow::anyhow!(
                        "input '{}' of step '{}' has no upstream handle for per-run addressing",
                        self.input_name,
                        self.step_key
                    )
                })?;
                Ok(format!("{}/{}/{}", self.run_id, step, output))
            }
            AddressingMode::AssetIdentity => {
                let asset_key = self.asset_key.ok_or_else(|| {
                    anyhow::anyhow!(
                        "input '{}' of step '{}' has no asset key for asset-identity addressing",
                        self.input_name,
                        self.step_key
                    )
                })?;
                Ok(format!("asset/{}", asset_key))
            }
        }
    }
}

/// The persistence boundary. `handle_output` must make the written value
/// retrievable by a later `load_input` addressed by the same identity.
#[async_trait]
pub trait IoManager: Send + Sync {
    fn mode(&self) -> AddressingMode;

    async fn handle_output(&self, ctx: &OutputContext<'_>, value: &Value) -> anyhow::Result<()>;

    async fn load_input(&self, ctx: &InputContext<'_>) -> anyhow::Result<Value>;
}

/// In-memory manager backed by a concurrent map. The default binding for
/// jobs that do not configure one.
pub struct InMemIoManager {
    mode: AddressingMode,
    store: DashMap<String, Value>,
}

impl InMemIoManager {
    pub fn new(mode: AddressingMode) -> Self {
        Self {
            mode,
            store: DashMap::new(),
        }
    }

    /// Raw lookup by storage key, for tests and harnesses.
    pub fn get_stored(&self, storage_key: &str) -> Option<Value> {
        self.store.get(storage_key).map(|v| v.clone())
    }

    pub fn stored_keys(&self) -> Vec<String> {
        self.store.iter().map(|e| e.key().clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

#[async_trait]
impl IoManager for InMemIoManager {
    fn mode(&self) -> AddressingMode {
        self.mode
    }

    async fn handle_output(&self, ctx: &OutputContext<'_>, value: &Value) -> anyhow::Result<()> {
        let key = ctx.storage_key(self.mode)?;
        debug!(key = %key, "in-mem handle_output");
        self.store.insert(key, value.clone());
        Ok(())
    }

    async fn load_input(&self, ctx: &InputContext<'_>) -> anyhow::Result<Value> {
        let key = ctx.storage_key(self.mode)?;
        self.store
            .get(&key)
            .map(|v| v.clone())
            .ok_or_else(|| anyhow::anyhow!("no value stored at '{}'", key))
    }
}

/// Filesystem manager: one JSON file per storage key under a root directory.
pub struct FsIoManager {
    mode: AddressingMode,
    root: PathBuf,
}

impl FsIoManager {
    pub fn new(root: impl Into<PathBuf>, mode: AddressingMode) -> Self {
        Self {
            mode,
            root: root.into(),
        }
    }

    fn path_for(&self, storage_key: &str) -> PathBuf {
        self.root.join(format!("{}.json", storage_key))
    }

    /// Whether a value exists for the given storage key.
    pub fn has_stored(&self, storage_key: &str) -> bool {
        self.path_for(storage_key).exists()
    }
}

#[async_trait]
impl IoManager for FsIoManager {
    fn mode(&self) -> AddressingMode {
        self.mode
    }

    async fn handle_output(&self, ctx: &OutputContext<'_>, value: &Value) -> anyhow::Result<()> {
        let path = self.path_for(&ctx.storage_key(self.mode)?);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| anyhow::anyhow!("creating {}: {}", parent.display(), e))?;
        }
        let serialized = serde_json::to_vec(value)?;
        std::fs::write(&path, serialized)
            .map_err(|e| anyhow::anyhow!("writing {}: {}", path.display(), e))?;
        debug!(path = %path.display(), "fs handle_output");
        Ok(())
    }

    async fn load_input(&self, ctx: &InputContext<'_>) -> anyhow::Result<Value> {
        let path = self.path_for(&ctx.storage_key(self.mode)?);
        let bytes = std::fs::read(&path)
            .map_err(|e| anyhow::anyhow!("reading {}: {}", path.display(), e))?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

type IoManagerFactory =
    Arc<dyn Fn(&ResourceInitContext<'_>) -> anyhow::Result<Arc<dyn IoManager>> + Send + Sync>;

/// A resource definition specialized to build an [`IoManager`]. The
/// addressing mode is part of the definition so the plan builder can verify
/// asset keys exist wherever asset-identity addressing will be used.
#[derive(Clone)]
pub struct IoManagerDefinition {
    factory: IoManagerFactory,
    dependency_keys: Vec<String>,
    mode: AddressingMode,
}

impl IoManagerDefinition {
    pub fn new<F>(mode: AddressingMode, factory: F) -> Self
    where
        F: Fn(&ResourceInitContext<'_>) -> anyhow::Result<Arc<dyn IoManager>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            factory: Arc::new(factory),
            dependency_keys: Vec::new(),
            mode,
        }
    }

    /// Fresh in-memory manager per run.
    pub fn in_memory(mode: AddressingMode) -> Self {
        Self::new(mode, move |_ctx| {
            Ok(Arc::new(InMemIoManager::new(mode)) as Arc<dyn IoManager>)
        })
    }

    /// Filesystem manager rooted at `root`.
    pub fn filesystem(root: impl AsRef<Path>, mode: AddressingMode) -> Self {
        let root = root.as_ref().to_path_buf();
        Self::new(mode, move |_ctx| {
            Ok(Arc::new(FsIoManager::new(root.clone(), mode)) as Arc<dyn IoManager>)
        })
    }

    /// Bind an existing manager instance, shared across runs. Useful for
    /// tests that inspect the manager's storage after execution.
    pub fn shared(manager: Arc<dyn IoManager>) -> Self {
        let mode = manager.mode();
        Self::new(mode, move |_ctx| Ok(manager.clone()))
    }

    pub fn with_dependencies<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependency_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn dependency_keys(&self) -> &[String] {
        &self.dependency_keys
    }

    pub fn mode(&self) -> AddressingMode {
        self.mode
    }

    pub(crate) fn instantiate(
        &self,
        ctx: &ResourceInitContext<'_>,
    ) -> anyhow::Result<Arc<dyn IoManager>> {
        (self.factory)(ctx)
    }
}
