use crate::cache::{memo_key, CacheStore};
use crate::registry::NodeRegistry;
use fluxcore::{
    DefinitionError, EventSink, Flow, Node, NodeContext, NodeId, RunError, Value,
};
use futures::stream::{FuturesUnordered, StreamExt};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Result of one local flow execution
#[derive(Debug)]
pub struct ExecOutcome {
    /// Output ports per node, for nodes that produced any
    pub outputs: HashMap<NodeId, HashMap<String, Value>>,
    /// Nodes that delivered output, the basis for usage debit
    pub nodes_executed: u64,
    /// True when the run stopped because cancellation was observed
    pub cancelled: bool,
}

/// A run that stopped on an error, carrying how much work completed
/// first so failed runs can be debited for the nodes that actually ran.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct ExecFailure {
    pub error: RunError,
    pub nodes_executed: u64,
}

impl ExecFailure {
    fn new(error: RunError, nodes_executed: u64) -> Self {
        Self {
            error,
            nodes_executed,
        }
    }
}

impl From<DefinitionError> for ExecFailure {
    fn from(e: DefinitionError) -> Self {
        Self::new(e.into(), 0)
    }
}

impl ExecOutcome {
    /// Merged outputs of leaf nodes (no outgoing connections), recorded as
    /// the run's final result payload.
    pub fn final_output(&self, flow: &Flow) -> Value {
        let has_successor: HashSet<NodeId> =
            flow.connections.iter().map(|c| c.from_node).collect();
        let mut merged = HashMap::new();
        for node in &flow.nodes {
            if has_successor.contains(&node.id) {
                continue;
            }
            if let Some(ports) = self.outputs.get(&node.id) {
                let label = node.name.clone().unwrap_or_else(|| node.id.to_string());
                merged.insert(label, Value::Object(ports.clone()));
            }
        }
        Value::Object(merged)
    }
}

/// Executes one flow as a DAG in the current process.
///
/// Dependency-free nodes run concurrently up to the flow's `max_parallel`.
/// Cancellation is observed at node boundaries: once the token is
/// signalled, no further node is launched and output from nodes still in
/// flight is suppressed. Node outputs are memoized through the cache when
/// the flow enables it.
pub struct FlowExecutor {
    cache: Arc<dyn CacheStore>,
    /// Upper bound on one node's execution; doubles as the cancellation
    /// responsiveness bound for nodes that ignore their token
    node_timeout: Option<Duration>,
    /// How long to wait for in-flight nodes after cancellation
    cancel_grace: Duration,
}

impl FlowExecutor {
    pub fn new(cache: Arc<dyn CacheStore>) -> Self {
        Self {
            cache,
            node_timeout: None,
            cancel_grace: Duration::from_secs(5),
        }
    }

    pub fn with_node_timeout(mut self, timeout: Duration) -> Self {
        self.node_timeout = Some(timeout);
        self
    }

    pub async fn execute(
        &self,
        flow: &Flow,
        registry: &NodeRegistry,
        sink: &EventSink,
        cancel: CancellationToken,
    ) -> Result<ExecOutcome, ExecFailure> {
        let run_id = sink.run_id();
        tracing::info!(%run_id, flow_id = %flow.id, "starting flow execution");

        let graph = build_graph(flow)?;
        let node_to_index: HashMap<NodeId, NodeIndex> = graph
            .node_indices()
            .filter_map(|idx| graph.node_weight(idx).map(|id| (*id, idx)))
            .collect();

        // Resolve every node type up front so a bad reference fails the run
        // before any work starts.
        let mut instances: HashMap<NodeId, Box<dyn Node>> = HashMap::new();
        for spec in &flow.nodes {
            let node = registry.create_node(&spec.node_type, &spec.config)?;
            instances.insert(spec.id, node);
        }

        let memo_ttl = flow.settings.memo_ttl_secs.map(Duration::from_secs);
        // Child token handed to nodes. Failing the run cancels it so
        // in-flight siblings stop instead of running detached.
        let node_cancel = cancel.child_token();
        let mut completed: HashSet<NodeId> = HashSet::new();
        let mut in_flight: HashSet<NodeId> = HashSet::new();
        let mut outputs: HashMap<NodeId, HashMap<String, Value>> = HashMap::new();
        let mut running = FuturesUnordered::new();
        let mut nodes_executed = 0u64;
        let mut cancelled = false;

        loop {
            if !cancelled && cancel.is_cancelled() {
                tracing::info!(%run_id, "cancellation observed at node boundary");
                cancelled = true;
            }

            let mut memo_hit = false;
            if !cancelled {
                let ready = ready_nodes(&graph, &node_to_index, &completed, &in_flight);
                for node_id in ready {
                    if running.len() >= flow.settings.max_parallel {
                        break;
                    }
                    let Some(spec) = flow.find_node(node_id) else {
                        node_cancel.cancel();
                        return Err(ExecFailure::new(
                            DefinitionError::NodeNotFound(node_id.to_string()).into(),
                            nodes_executed,
                        ));
                    };
                    let inputs = collect_inputs(node_id, flow, &outputs);

                    // Memoized output short-circuits the node entirely.
                    let fingerprint = input_fingerprint(&inputs, &spec.config);
                    if memo_ttl.is_some() {
                        let key = memo_key(flow.id, node_id, fingerprint);
                        if let Some(Value::Object(ports)) = self.cache.get(&key).await {
                            tracing::debug!(%run_id, node_id = %node_id, "memoized output reused");
                            for (port, value) in &ports {
                                sink.data(node_id, port.clone(), value.clone());
                            }
                            outputs.insert(node_id, ports);
                            completed.insert(node_id);
                            nodes_executed += 1;
                            memo_hit = true;
                            continue;
                        }
                    }

                    let Some(node) = instances.remove(&node_id) else {
                        node_cancel.cancel();
                        return Err(ExecFailure::new(
                            DefinitionError::NodeNotFound(node_id.to_string()).into(),
                            nodes_executed,
                        ));
                    };
                    let ctx = NodeContext {
                        run_id,
                        node_id,
                        inputs,
                        config: spec.config.clone(),
                        events: sink.clone(),
                        cancellation: node_cancel.child_token(),
                    };

                    in_flight.insert(node_id);
                    let node_timeout = self.node_timeout;
                    running.push(tokio::spawn(async move {
                        let result = match node_timeout {
                            Some(limit) => match timeout(limit, node.execute(ctx)).await {
                                Ok(result) => result,
                                Err(_) => Err(fluxcore::NodeError::Timeout {
                                    seconds: limit.as_secs(),
                                }),
                            },
                            None => node.execute(ctx).await,
                        };
                        (node_id, fingerprint, result)
                    }));
                }
            }

            // A memoized completion may have unblocked dependents that are
            // not in flight yet; recompute the ready set before waiting.
            if memo_hit {
                continue;
            }
            if running.is_empty() {
                break;
            }

            // Wake on either a node completing or cancellation arriving, so
            // a long node does not delay the boundary check.
            let joined = if cancelled {
                // Already draining; bound the wait for in-flight nodes.
                match timeout(self.cancel_grace, running.next()).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        tracing::warn!(%run_id, "abandoning in-flight nodes after cancel grace");
                        break;
                    }
                }
            } else {
                tokio::select! {
                    joined = running.next() => joined,
                    _ = cancel.cancelled() => continue,
                }
            };

            let Some(joined) = joined else { break };
            let (node_id, fingerprint, result) = match joined {
                Ok(joined) => joined,
                Err(e) => {
                    node_cancel.cancel();
                    return Err(ExecFailure::new(
                        RunError::Execution(format!("node task join error: {}", e)),
                        nodes_executed,
                    ));
                }
            };
            in_flight.remove(&node_id);

            match result {
                Ok(output) => {
                    completed.insert(node_id);
                    nodes_executed += 1;
                    if let Some(ttl) = memo_ttl {
                        let key = memo_key(flow.id, node_id, fingerprint);
                        self.cache
                            .set(&key, Value::Object(output.outputs.clone()), ttl)
                            .await;
                    }
                    if cancelled {
                        // The node was in flight when the run was marked
                        // cancelled; its output is not forwarded.
                        tracing::debug!(%run_id, node_id = %node_id, "suppressing output of cancelled run");
                        continue;
                    }
                    for (port, value) in &output.outputs {
                        sink.data(node_id, port.clone(), value.clone());
                    }
                    outputs.insert(node_id, output.outputs);
                }
                Err(e) => {
                    if cancelled {
                        tracing::debug!(%run_id, node_id = %node_id, "ignoring node error after cancellation: {}", e);
                        continue;
                    }
                    tracing::error!(%run_id, node_id = %node_id, "node failed: {}", e);
                    // Stop siblings still in flight; they observe the token
                    // at their next cancellation check.
                    node_cancel.cancel();
                    return Err(ExecFailure::new(RunError::Node(e), nodes_executed));
                }
            }
        }

        tracing::info!(
            %run_id,
            nodes_executed,
            cancelled,
            "flow execution finished"
        );
        Ok(ExecOutcome {
            outputs,
            nodes_executed,
            cancelled,
        })
    }
}

/// Build the dependency graph and reject cyclic definitions
pub fn build_graph(flow: &Flow) -> Result<DiGraph<NodeId, ()>, DefinitionError> {
    let mut graph = DiGraph::new();
    let mut node_to_index = HashMap::new();

    for spec in &flow.nodes {
        let idx = graph.add_node(spec.id);
        node_to_index.insert(spec.id, idx);
    }
    for conn in &flow.connections {
        let from = node_to_index
            .get(&conn.from_node)
            .ok_or_else(|| DefinitionError::NodeNotFound(conn.from_node.to_string()))?;
        let to = node_to_index
            .get(&conn.to_node)
            .ok_or_else(|| DefinitionError::NodeNotFound(conn.to_node.to_string()))?;
        graph.add_edge(*from, *to, ());
    }

    if toposort(&graph, None).is_err() {
        return Err(DefinitionError::CyclicDependency);
    }
    Ok(graph)
}

fn ready_nodes(
    graph: &DiGraph<NodeId, ()>,
    node_to_index: &HashMap<NodeId, NodeIndex>,
    completed: &HashSet<NodeId>,
    in_flight: &HashSet<NodeId>,
) -> Vec<NodeId> {
    let mut ready = Vec::new();
    for (node_id, idx) in node_to_index {
        if completed.contains(node_id) || in_flight.contains(node_id) {
            continue;
        }
        let deps_met = graph
            .neighbors_directed(*idx, petgraph::Direction::Incoming)
            .all(|dep| {
                graph
                    .node_weight(dep)
                    .map(|id| completed.contains(id))
                    .unwrap_or(false)
            });
        if deps_met {
            ready.push(*node_id);
        }
    }
    ready
}

fn collect_inputs(
    node_id: NodeId,
    flow: &Flow,
    outputs: &HashMap<NodeId, HashMap<String, Value>>,
) -> HashMap<String, Value> {
    let mut inputs = HashMap::new();
    for conn in &flow.connections {
        if conn.to_node != node_id {
            continue;
        }
        if let Some(ports) = outputs.get(&conn.from_node) {
            if let Some(value) = ports.get(&conn.from_port) {
                inputs.insert(conn.to_port.clone(), value.clone());
            }
        }
    }
    inputs
}

/// Combined fingerprint of a node's runtime inputs and static config,
/// keying its memoized output.
fn input_fingerprint(inputs: &HashMap<String, Value>, config: &HashMap<String, Value>) -> u64 {
    let mut combined: Vec<(&str, u64)> = inputs
        .iter()
        .chain(config.iter())
        .map(|(k, v)| (k.as_str(), v.fingerprint()))
        .collect();
    combined.sort_unstable();
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    combined.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use fluxcore::{Flow, NodeSpec};

    #[test]
    fn build_graph_rejects_cycles() {
        let mut flow = Flow::new("cycle");
        let a = flow.add_node(NodeSpec::new("t"));
        let b = flow.add_node(NodeSpec::new("t"));
        flow.connect(a, "out", b, "in");
        flow.connect(b, "out", a, "in");
        assert!(matches!(
            build_graph(&flow),
            Err(DefinitionError::CyclicDependency)
        ));
    }

    #[test]
    fn ready_nodes_excludes_in_flight() {
        let mut flow = Flow::new("fanout");
        let a = flow.add_node(NodeSpec::new("t"));
        let b = flow.add_node(NodeSpec::new("t"));
        let graph = build_graph(&flow).unwrap();
        let node_to_index: HashMap<NodeId, NodeIndex> = graph
            .node_indices()
            .map(|i| (*graph.node_weight(i).unwrap(), i))
            .collect();

        let mut in_flight = HashSet::new();
        in_flight.insert(a);
        let ready = ready_nodes(&graph, &node_to_index, &HashSet::new(), &in_flight);
        assert_eq!(ready, vec![b]);
    }
}
