use async_trait::async_trait;
use fluxcore::{Node, NodeContext, NodeError, NodeOutput, Value};
use fluxruntime::{NodeFactory, NodeTypeInfo};
use std::collections::HashMap;
use std::time::Duration;

/// Waits for a configured duration, observing cancellation.
///
/// The sleep selects on the run's cancellation token, so a cancelled run
/// does not wait out the full delay.
pub struct DelayNode;

#[async_trait]
impl Node for DelayNode {
    fn node_type(&self) -> &str {
        "time.delay"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let ms = ctx
            .get_config_or("ms", Value::from(1000.0))
            .as_f64()
            .unwrap_or(1000.0)
            .max(0.0) as u64;

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(ms)) => {}
            _ = ctx.cancellation.cancelled() => return Err(NodeError::Cancelled),
        }

        Ok(NodeOutput::new().with_output("elapsed_ms", ms as i64))
    }
}

pub struct DelayNodeFactory;

impl NodeFactory for DelayNodeFactory {
    fn create(&self, _config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(DelayNode))
    }

    fn node_type(&self) -> &str {
        "time.delay"
    }

    fn metadata(&self) -> NodeTypeInfo {
        NodeTypeInfo {
            description: "Wait for a configured number of milliseconds".to_string(),
            category: "time".to_string(),
        }
    }
}
