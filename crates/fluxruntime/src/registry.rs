use fluxcore::{DefinitionError, Node, NodeError, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Factory trait for creating node instances
pub trait NodeFactory: Send + Sync {
    /// Create a new instance of the node with the given configuration
    fn create(&self, config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError>;

    /// Node type identifier
    fn node_type(&self) -> &str;

    /// Optional node metadata for catalogue listings
    fn metadata(&self) -> NodeTypeInfo {
        NodeTypeInfo::default()
    }
}

impl std::fmt::Debug for dyn NodeFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeFactory")
            .field("node_type", &self.node_type())
            .finish()
    }
}

/// Catalogue metadata about a node type
#[derive(Debug, Clone)]
pub struct NodeTypeInfo {
    pub description: String,
    pub category: String,
}

impl Default for NodeTypeInfo {
    fn default() -> Self {
        Self {
            description: String::new(),
            category: "general".to_string(),
        }
    }
}

/// Registry of executable node types.
///
/// Built once at process start by registering the static catalogue, then
/// shared read-only as `Arc<NodeRegistry>`. Lookups are plain map reads with
/// no locking. An unresolvable type fails the run that referenced it, never
/// the process.
pub struct NodeRegistry {
    factories: HashMap<String, Arc<dyn NodeFactory>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a node factory; only valid during startup, before the
    /// registry is shared.
    pub fn register(&mut self, factory: Arc<dyn NodeFactory>) {
        let node_type = factory.node_type().to_string();
        tracing::debug!("registering node type: {}", node_type);
        self.factories.insert(node_type, factory);
    }

    /// Resolve a node type to its factory
    pub fn resolve(&self, node_type: &str) -> Result<&Arc<dyn NodeFactory>, DefinitionError> {
        self.factories
            .get(node_type)
            .ok_or_else(|| DefinitionError::UnknownNodeType(node_type.to_string()))
    }

    pub fn contains(&self, node_type: &str) -> bool {
        self.factories.contains_key(node_type)
    }

    /// Instantiate a node for execution
    pub fn create_node(
        &self,
        node_type: &str,
        config: &HashMap<String, Value>,
    ) -> Result<Box<dyn Node>, DefinitionError> {
        self.resolve(node_type)?
            .create(config)
            .map_err(|e| DefinitionError::Invalid(format!("failed to create node: {}", e)))
    }

    pub fn list_node_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn get_metadata(&self, node_type: &str) -> Option<NodeTypeInfo> {
        self.factories.get(node_type).map(|f| f.metadata())
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
