use async_trait::async_trait;
use fluxcore::{FlowId, NodeId, RunId, Value};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Process-wide key-value store with TTL.
///
/// Backs two separate concerns, kept apart by key namespaces: memoized node
/// outputs (`memo:`) and cross-process coordination flags (`cancel:`).
/// Reads after expiry behave as a miss; writes are last-writer-wins and no
/// cross-key atomicity is provided. Callers depend only on this trait so a
/// shared external store can replace the in-process map unchanged.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Option<Value>;
    async fn set(&self, key: &str, value: Value, ttl: Duration);
    async fn delete(&self, key: &str);
}

/// Key for a memoized node output, tied to the node's input fingerprint
pub fn memo_key(flow_id: FlowId, node_id: NodeId, input_fingerprint: u64) -> String {
    format!("memo:{}:{}:{:016x}", flow_id, node_id, input_fingerprint)
}

/// Key for the cross-process cancellation flag of a run
pub fn cancel_key(run_id: RunId) -> String {
    format!("cancel:{}", run_id)
}

/// In-process cache for single-instance deployments
pub struct MemoryCache {
    entries: RwLock<HashMap<String, (Value, Instant)>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &str) -> Option<Value> {
        let expired = {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some((value, expires_at)) => {
                    if Instant::now() < *expires_at {
                        return Some(value.clone());
                    }
                    true
                }
                None => false,
            }
        };
        // Drop the stale entry lazily rather than running a sweeper.
        if expired {
            self.entries.write().await.remove(key);
        }
        None
    }

    async fn set(&self, key: &str, value: Value, ttl: Duration) {
        let expires_at = Instant::now() + ttl;
        self.entries
            .write()
            .await
            .insert(key.to_string(), (value, expires_at));
    }

    async fn delete(&self, key: &str) {
        self.entries.write().await.remove(key);
    }
}
