use async_trait::async_trait;
use fluxcore::{Node, NodeContext, NodeError, NodeOutput, Value};
use fluxruntime::{NodeFactory, NodeTypeInfo};
use std::collections::HashMap;

/// Echoes its message input and emits it as a data event
pub struct DebugNode;

#[async_trait]
impl Node for DebugNode {
    fn node_type(&self) -> &str {
        "debug.log"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let message = ctx
            .inputs
            .get("message")
            .and_then(|v| v.as_str())
            .or_else(|| ctx.config.get("message").and_then(|v| v.as_str()))
            .unwrap_or("(no message)")
            .to_string();

        tracing::info!(node_id = %ctx.node_id, "debug: {}", message);
        Ok(NodeOutput::new().with_output("message", message))
    }
}

pub struct DebugNodeFactory;

impl NodeFactory for DebugNodeFactory {
    fn create(&self, _config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(DebugNode))
    }

    fn node_type(&self) -> &str {
        "debug.log"
    }

    fn metadata(&self) -> NodeTypeInfo {
        NodeTypeInfo {
            description: "Logs and forwards its message input".to_string(),
            category: "debug".to_string(),
        }
    }
}
