use thiserror::Error;

/// Unified error type for the opflow engine.
///
/// Structural errors (cycles, unresolved inputs/resources, bad selections)
/// and resource initialization failures surface synchronously from
/// [`execute`](crate::engine::execute) before any step runs. Step-level
/// errors never escape `execute`; they are captured in the event stream and
/// reflected in the run status.
#[derive(Debug, Error)]
pub enum FlowError {
    /// The node graph contains a cycle. `cycle` lists the node names along
    /// the cycle, in order, with the first node repeated at the end.
    #[error("graph contains a cycle: {}", cycle.join(" -> "))]
    GraphCycle { cycle: Vec<String> },

    /// A declared input cannot be satisfied by a wire, a literal default,
    /// or an io-manager identity.
    #[error("unresolved input '{input}' on node '{node}': {reason}")]
    UnresolvedInput {
        node: String,
        input: String,
        reason: String,
    },

    /// A resource or io-manager key has no binding in the job.
    #[error("unresolved resource key '{key}' (referenced by {referenced_by})")]
    UnresolvedResource {
        key: String,
        referenced_by: String,
    },

    /// A selection names unknown nodes or produces an empty plan.
    #[error("invalid selection: {message}")]
    Selection { message: String },

    /// A definition (node, graph, job) is malformed at construction time.
    #[error("invalid definition: {message}")]
    InvalidGraph { message: String },

    /// A resource factory failed. Fatal for the run: no partial resource
    /// set is ever used.
    #[error("failed to initialize resource '{key}'")]
    ResourceInit {
        key: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A step's compute or output handling failed. Localized to the step;
    /// retried per policy and recorded in the event stream.
    #[error("step '{step}' failed: {message}")]
    StepExecution {
        step: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// An io manager's load_input or handle_output failed. Treated exactly
    /// like a step execution error for retry purposes.
    #[error("io manager '{manager_key}' failed during {operation}: {message}")]
    IoManager {
        manager_key: String,
        operation: String,
        message: String,
    },

    #[error("serialization failed")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },

    #[error("io operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("run '{run_id}' was canceled")]
    Canceled { run_id: String },

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl FlowError {
    pub fn cycle(nodes: Vec<String>) -> Self {
        Self::GraphCycle { cycle: nodes }
    }

    pub fn unresolved_input(
        node: impl Into<String>,
        input: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::UnresolvedInput {
            node: node.into(),
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn unresolved_resource(key: impl Into<String>, referenced_by: impl Into<String>) -> Self {
        Self::UnresolvedResource {
            key: key.into(),
            referenced_by: referenced_by.into(),
        }
    }

    pub fn selection(message: impl Into<String>) -> Self {
        Self::Selection {
            message: message.into(),
        }
    }

    pub fn invalid_graph(message: impl Into<String>) -> Self {
        Self::InvalidGraph {
            message: message.into(),
        }
    }

    pub fn resource_init(key: impl Into<String>, source: anyhow::Error) -> Self {
        Self::ResourceInit {
            key: key.into(),
            source: source.into(),
        }
    }

    pub fn step_execution(step: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StepExecution {
            step: step.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn step_execution_with_source(
        step: impl Into<String>,
        message: impl Into<String>,
        source: anyhow::Error,
    ) -> Self {
        Self::StepExecution {
            step: step.into(),
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn io_manager(
        manager_key: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::IoManager {
            manager_key: manager_key.into(),
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn io(operation: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// True for errors detected at plan build, before any step runs.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::GraphCycle { .. }
                | Self::UnresolvedInput { .. }
                | Self::UnresolvedResource { .. }
                | Self::Selection { .. }
                | Self::InvalidGraph { .. }
        )
    }

    /// Error category for logging.
    pub fn category(&self) -> &'static str {
        match self {
            Self::GraphCycle { .. } => "graph_cycle",
            Self::UnresolvedInput { .. } => "unresolved_input",
            Self::UnresolvedResource { .. } => "unresolved_resource",
            Self::Selection { .. } => "selection",
            Self::InvalidGraph { .. } => "invalid_graph",
            Self::ResourceInit { .. } => "resource_init",
            Self::StepExecution { .. } => "step_execution",
            Self::IoManager { .. } => "io_manager",
            Self::Serialization { .. } => "serialization",
            Self::Io { .. } => "io",
            Self::Canceled { .. } => "canceled",
            Self::Internal { .. } => "internal",
        }
    }
}

/// Result type alias for engine APIs.
pub type Result<T> = std::result::Result<T, FlowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_names_sequence() {
        let err = FlowError::cycle(vec!["a".into(), "b".into(), "a".into()]);
        assert_eq!(err.to_string(), "graph contains a cycle: a -> b -> a");
        assert!(err.is_structural());
    }

    #[test]
    fn test_categories() {
        assert_eq!(
            FlowError::unresolved_resource("db", "node 'load'").category(),
            "unresolved_resource"
        );
        assert_eq!(
            FlowError::step_execution("load", "boom").category(),
            "step_execution"
        );
        assert!(!FlowError::step_execution("load", "boom").is_structural());
    }

    #[test]
    fn test_io_manager_error_display() {
        let err = FlowError::io_manager("db", "load_input", "missing key");
        assert_eq!(
            err.to_string(),
            "io manager 'db' failed during load_input: missing key"
        );
    }
}
