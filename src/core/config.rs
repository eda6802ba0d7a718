//! Per-run configuration.
//!
//! A [`RunConfig`] carries two value bags keyed by node name and by resource
//! key. Values are `serde_json::Value`; consumers deserialize what they need
//! via the typed accessors on [`OpContext`](crate::engine::OpContext) and
//! [`ResourceInitContext`](crate::resources::ResourceInitContext).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Configuration for a single run: op config keyed by node name, resource
/// config keyed by resource key. No ordering significance.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RunConfig {
    #[serde(default)]
    pub ops: HashMap<String, Value>,
    #[serde(default)]
    pub resources: HashMap<String, Value>,
}

impl RunConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the config value bag for a node.
    pub fn with_op_config(mut self, node_name: impl Into<String>, config: Value) -> Self {
        self.ops.insert(node_name.into(), config);
        self
    }

    /// Set the config value bag for a resource key.
    pub fn with_resource_config(mut self, key: impl Into<String>, config: Value) -> Self {
        self.resources.insert(key.into(), config);
        self
    }

    pub fn op_config(&self, node_name: &str) -> Option<&Value> {
        self.ops.get(node_name)
    }

    pub fn resource_config(&self, key: &str) -> Option<&Value> {
        self.resources.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_round_trip() {
        let config = RunConfig::new()
            .with_op_config("load", json!({"path": "/tmp/in"}))
            .with_resource_config("db", json!({"url": "postgres://x"}));

        let serialized = serde_json::to_string(&config).unwrap();
        let restored: RunConfig = serde_json::from_str(&serialized).unwrap();
        assert_eq!(config, restored);
        assert_eq!(restored.op_config("load").unwrap()["path"], "/tmp/in");
        assert!(restored.op_config("missing").is_none());
    }
}
