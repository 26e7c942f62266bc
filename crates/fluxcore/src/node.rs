use crate::{events::EventSink, NodeError, NodeId, RunId, Value};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Core trait implemented by every executable node type
#[async_trait]
pub trait Node: Send + Sync {
    /// Type identifier, e.g. "transform.json_parse"
    fn node_type(&self) -> &str;

    /// Execute the node with the given context
    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError>;

    /// Optional: validate configuration when the flow is loaded
    fn validate_config(&self, _config: &HashMap<String, Value>) -> Result<(), NodeError> {
        Ok(())
    }
}

/// Execution context passed to each node
#[derive(Clone)]
pub struct NodeContext {
    pub run_id: RunId,
    pub node_id: NodeId,

    /// Input values collected from predecessor nodes
    pub inputs: HashMap<String, Value>,

    /// Static configuration from the flow definition
    pub config: HashMap<String, Value>,

    /// Sink for incremental output; sequence numbers are assigned here
    pub events: EventSink,

    /// Cooperative cancellation; long-running nodes should select on it
    pub cancellation: tokio_util::sync::CancellationToken,
}

impl NodeContext {
    pub fn require_input(&self, name: &str) -> Result<&Value, NodeError> {
        self.inputs
            .get(name)
            .ok_or_else(|| NodeError::MissingInput(name.to_string()))
    }

    pub fn require_config(&self, name: &str) -> Result<&Value, NodeError> {
        self.config
            .get(name)
            .ok_or_else(|| NodeError::Configuration(format!("missing config: {}", name)))
    }

    pub fn get_config_or(&self, name: &str, default: Value) -> Value {
        self.config.get(name).cloned().unwrap_or(default)
    }
}

/// Output ports produced by one node execution
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeOutput {
    pub outputs: HashMap<String, Value>,
}

impl NodeOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_output(mut self, port: impl Into<String>, value: impl Into<Value>) -> Self {
        self.outputs.insert(port.into(), value.into());
        self
    }
}
