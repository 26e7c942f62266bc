use crate::{DefinitionError, Value};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

pub type FlowId = Uuid;
pub type NodeId = Uuid;

/// Directed graph of computation nodes, defined once and executed many times.
///
/// A flow is immutable for the duration of any one run; a concurrent edit
/// produces a new definition that only affects later runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    pub id: FlowId,
    pub name: String,
    pub description: Option<String>,
    pub nodes: Vec<NodeSpec>,
    pub connections: Vec<Connection>,
    #[serde(default)]
    pub settings: FlowSettings,
}

impl Flow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: None,
            nodes: Vec::new(),
            connections: Vec::new(),
            settings: FlowSettings::default(),
        }
    }

    pub fn add_node(&mut self, node: NodeSpec) -> NodeId {
        let id = node.id;
        self.nodes.push(node);
        id
    }

    pub fn connect(
        &mut self,
        from_node: NodeId,
        from_port: impl Into<String>,
        to_node: NodeId,
        to_port: impl Into<String>,
    ) {
        self.connections.push(Connection {
            from_node,
            from_port: from_port.into(),
            to_node,
            to_port: to_port.into(),
        });
    }

    pub fn find_node(&self, id: NodeId) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Structural validation: connection endpoints must reference declared
    /// nodes and every node type must be resolvable. Cycle detection happens
    /// when the dependency graph is built for execution.
    pub fn validate(&self, known_type: impl Fn(&str) -> bool) -> Result<(), DefinitionError> {
        let ids: HashSet<NodeId> = self.nodes.iter().map(|n| n.id).collect();
        if ids.len() != self.nodes.len() {
            return Err(DefinitionError::Invalid("duplicate node id".to_string()));
        }
        for node in &self.nodes {
            if !known_type(&node.node_type) {
                return Err(DefinitionError::UnknownNodeType(node.node_type.clone()));
            }
        }
        for conn in &self.connections {
            if !ids.contains(&conn.from_node) {
                return Err(DefinitionError::InvalidConnection(format!(
                    "source node {} not in flow",
                    conn.from_node
                )));
            }
            if !ids.contains(&conn.to_node) {
                return Err(DefinitionError::InvalidConnection(format!(
                    "target node {} not in flow",
                    conn.to_node
                )));
            }
        }
        Ok(())
    }
}

/// One node instance inside a flow definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: NodeId,
    pub node_type: String,
    pub name: Option<String>,
    #[serde(default)]
    pub config: HashMap<String, Value>,
}

impl NodeSpec {
    pub fn new(node_type: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            node_type: node_type.into(),
            name: None,
            config: HashMap::new(),
        }
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Edge from an output port to an input port
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub from_node: NodeId,
    pub from_port: String,
    pub to_node: NodeId,
    pub to_port: String,
}

/// Per-flow execution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowSettings {
    /// Upper bound on nodes executing concurrently within one run
    pub max_parallel: usize,
    /// Wall-clock budget for the whole run; expiry behaves like cancellation
    pub timeout_ms: Option<u64>,
    /// TTL for memoized node outputs; None disables memoization
    pub memo_ttl_secs: Option<u64>,
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self {
            max_parallel: 8,
            timeout_ms: None,
            memo_ttl_secs: None,
        }
    }
}
