use async_trait::async_trait;
use fluxcore::{Node, NodeContext, NodeError, NodeOutput, Value};
use fluxruntime::{NodeFactory, NodeTypeInfo};
use std::collections::HashMap;

/// Parse a JSON string into a value
pub struct JsonParseNode;

#[async_trait]
impl Node for JsonParseNode {
    fn node_type(&self) -> &str {
        "transform.json_parse"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let input = ctx
            .require_input("json")?
            .as_str()
            .ok_or_else(|| NodeError::InvalidInputType {
                field: "json".to_string(),
                expected: "string".to_string(),
                actual: "other".to_string(),
            })?;

        let parsed: serde_json::Value = serde_json::from_str(input)
            .map_err(|e| NodeError::ExecutionFailed(format!("JSON parse error: {}", e)))?;

        Ok(NodeOutput::new().with_output("parsed", Value::Json(parsed)))
    }
}

pub struct JsonParseNodeFactory;

impl NodeFactory for JsonParseNodeFactory {
    fn create(&self, _config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(JsonParseNode))
    }

    fn node_type(&self) -> &str {
        "transform.json_parse"
    }

    fn metadata(&self) -> NodeTypeInfo {
        NodeTypeInfo {
            description: "Parse a JSON string".to_string(),
            category: "transform".to_string(),
        }
    }
}

/// Serialize a value to a JSON string
pub struct JsonStringifyNode;

#[async_trait]
impl Node for JsonStringifyNode {
    fn node_type(&self) -> &str {
        "transform.json_stringify"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let value = ctx.require_input("value")?;
        let json = serde_json::to_string_pretty(value)
            .map_err(|e| NodeError::ExecutionFailed(format!("JSON stringify error: {}", e)))?;
        Ok(NodeOutput::new().with_output("json", json))
    }
}

pub struct JsonStringifyNodeFactory;

impl NodeFactory for JsonStringifyNodeFactory {
    fn create(&self, _config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(JsonStringifyNode))
    }

    fn node_type(&self) -> &str {
        "transform.json_stringify"
    }

    fn metadata(&self) -> NodeTypeInfo {
        NodeTypeInfo {
            description: "Serialize a value to JSON".to_string(),
            category: "transform".to_string(),
        }
    }
}
