use async_trait::async_trait;
use fluxcore::{Flow, FlowId};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Definition-store collaborator.
///
/// Returns the graph to execute for a flow id. The dispatcher clones the
/// definition for the duration of one run, so a concurrent edit never
/// affects an in-flight run.
#[async_trait]
pub trait FlowStore: Send + Sync {
    async fn get(&self, flow_id: FlowId) -> Option<Flow>;
}

/// In-memory store used by the server and in tests
pub struct MemoryFlowStore {
    flows: RwLock<HashMap<FlowId, Flow>>,
}

impl MemoryFlowStore {
    pub fn new() -> Self {
        Self {
            flows: RwLock::new(HashMap::new()),
        }
    }

    pub async fn insert(&self, flow: Flow) -> FlowId {
        let id = flow.id;
        self.flows.write().await.insert(id, flow);
        id
    }

    pub async fn remove(&self, flow_id: FlowId) -> Option<Flow> {
        self.flows.write().await.remove(&flow_id)
    }

    pub async fn list(&self) -> Vec<Flow> {
        self.flows.read().await.values().cloned().collect()
    }
}

impl Default for MemoryFlowStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FlowStore for MemoryFlowStore {
    async fn get(&self, flow_id: FlowId) -> Option<Flow> {
        self.flows.read().await.get(&flow_id).cloned()
    }
}
