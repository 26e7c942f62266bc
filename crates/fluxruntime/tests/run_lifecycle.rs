//! End-to-end tests for local-mode run orchestration: admission, event
//! ordering, terminal states, cancellation and quota accounting.

use async_trait::async_trait;
use fluxcore::{
    DenyReason, Flow, Node, NodeContext, NodeError, NodeOutput, NodeSpec, RunError, RunEventKind,
    RunState, TenantCtx, Value,
};
use fluxruntime::{
    AllowAll, Authorizer, CacheStore, Dispatcher, MemoryCache, MemoryFlowStore, NodeFactory,
    NodeRegistry, RequirePermission, RuntimeConfig,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Emits its configured value on the "out" port
struct EchoNode;

#[async_trait]
impl Node for EchoNode {
    fn node_type(&self) -> &str {
        "test.echo"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let value = ctx
            .config
            .get("value")
            .cloned()
            .or_else(|| ctx.inputs.get("in").cloned())
            .unwrap_or(Value::Null);
        Ok(NodeOutput::new().with_output("out", value))
    }
}

/// Sleeps until cancelled or until its configured duration elapses
struct SlowNode;

#[async_trait]
impl Node for SlowNode {
    fn node_type(&self) -> &str {
        "test.slow"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let millis = ctx
            .config
            .get("millis")
            .and_then(|v| v.as_f64())
            .unwrap_or(10_000.0) as u64;
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(millis)) => {
                Ok(NodeOutput::new().with_output("out", Value::from("slept")))
            }
            _ = ctx.cancellation.cancelled() => Err(NodeError::Cancelled),
        }
    }
}

struct FailNode;

#[async_trait]
impl Node for FailNode {
    fn node_type(&self) -> &str {
        "test.fail"
    }

    async fn execute(&self, _ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        Err(NodeError::ExecutionFailed("deliberate failure".to_string()))
    }
}

macro_rules! factory {
    ($factory:ident, $node:ident, $node_type:literal) => {
        struct $factory;

        impl NodeFactory for $factory {
            fn create(
                &self,
                _config: &HashMap<String, Value>,
            ) -> Result<Box<dyn Node>, NodeError> {
                Ok(Box::new($node))
            }

            fn node_type(&self) -> &str {
                $node_type
            }
        }
    };
}

factory!(EchoFactory, EchoNode, "test.echo");
factory!(SlowFactory, SlowNode, "test.slow");
factory!(FailFactory, FailNode, "test.fail");

/// Raises a shared flag when its cancellation token fires
struct CancelReporterNode {
    observed: Arc<AtomicBool>,
}

#[async_trait]
impl Node for CancelReporterNode {
    fn node_type(&self) -> &str {
        "test.report_cancel"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(10)) => Ok(NodeOutput::new()),
            _ = ctx.cancellation.cancelled() => {
                self.observed.store(true, Ordering::SeqCst);
                Err(NodeError::Cancelled)
            }
        }
    }
}

struct CancelReporterFactory {
    observed: Arc<AtomicBool>,
}

impl NodeFactory for CancelReporterFactory {
    fn create(&self, _config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(CancelReporterNode {
            observed: self.observed.clone(),
        }))
    }

    fn node_type(&self) -> &str {
        "test.report_cancel"
    }
}

fn test_registry() -> Arc<NodeRegistry> {
    let mut registry = NodeRegistry::new();
    registry.register(Arc::new(EchoFactory));
    registry.register(Arc::new(SlowFactory));
    registry.register(Arc::new(FailFactory));
    Arc::new(registry)
}

fn dispatcher_with_registry(
    config: RuntimeConfig,
    authorizer: Arc<dyn Authorizer>,
    registry: Arc<NodeRegistry>,
) -> (Arc<Dispatcher>, Arc<MemoryFlowStore>) {
    let flows = Arc::new(MemoryFlowStore::new());
    let cache: Arc<dyn CacheStore> = Arc::new(MemoryCache::new());
    let dispatcher = Arc::new(Dispatcher::new(
        config,
        registry,
        flows.clone(),
        cache,
        authorizer,
    ));
    (dispatcher, flows)
}

fn dispatcher_with(
    config: RuntimeConfig,
    authorizer: Arc<dyn Authorizer>,
) -> (Arc<Dispatcher>, Arc<MemoryFlowStore>) {
    dispatcher_with_registry(config, authorizer, test_registry())
}

fn default_dispatcher() -> (Arc<Dispatcher>, Arc<MemoryFlowStore>) {
    dispatcher_with(RuntimeConfig::default(), Arc::new(AllowAll))
}

fn linear_flow(len: usize) -> Flow {
    let mut flow = Flow::new("linear");
    let mut prev = None;
    for i in 0..len {
        let node = if prev.is_none() {
            NodeSpec::new("test.echo").with_config("value", format!("step-{}", i))
        } else {
            NodeSpec::new("test.echo")
        };
        let id = flow.add_node(node);
        if let Some(prev_id) = prev {
            flow.connect(prev_id, "out", id, "in");
        }
        prev = Some(id);
    }
    flow
}

fn tenant() -> TenantCtx {
    TenantCtx::new(Uuid::new_v4(), Uuid::new_v4())
}

async fn wait_terminal(dispatcher: &Arc<Dispatcher>, run_id: Uuid) -> RunState {
    for _ in 0..200 {
        if let Some(run) = dispatcher.get_run(run_id).await {
            if run.state.is_terminal() {
                return run.state;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("run {} did not reach a terminal state", run_id);
}

#[tokio::test]
async fn linear_flow_emits_ordered_events_then_single_end() {
    let (dispatcher, flows) = default_dispatcher();
    let flow = linear_flow(3);
    let flow_id = flows.insert(flow).await;

    let run_id = dispatcher.submit(tenant(), flow_id).await.unwrap();
    let mut stream = dispatcher.bridge().subscribe(run_id);

    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("event stream stalled")
            .expect("stream closed before terminal event");
        let terminal = event.is_terminal();
        events.push(event);
        if terminal {
            break;
        }
    }

    // One data event per node, sequence numbers strictly increasing,
    // exactly one terminal event and it is a non-cancelled end.
    assert_eq!(events.len(), 4);
    for pair in events.windows(2) {
        assert!(pair[0].seq < pair[1].seq);
    }
    for event in &events[..3] {
        assert!(matches!(event.kind, RunEventKind::Data { .. }));
    }
    assert!(matches!(
        events[3].kind,
        RunEventKind::End { cancelled: false }
    ));

    let state = wait_terminal(&dispatcher, run_id).await;
    assert_eq!(state, RunState::Completed);

    let run = dispatcher.get_run(run_id).await.unwrap();
    assert!(run.output.is_some());
    assert!(run.finished_at.is_some());
}

#[tokio::test]
async fn cancel_before_first_node_emits_only_cancelled_end() {
    let (dispatcher, flows) = default_dispatcher();
    let mut flow = Flow::new("slow");
    flow.add_node(NodeSpec::new("test.slow"));
    let flow_id = flows.insert(flow).await;

    let run_id = dispatcher.submit(tenant(), flow_id).await.unwrap();
    let mut stream = dispatcher.bridge().subscribe(run_id);
    assert!(dispatcher.cancel(run_id).await);

    let event = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("no event after cancellation")
        .expect("stream closed without terminal event");
    assert!(matches!(event.kind, RunEventKind::End { cancelled: true }));

    let state = wait_terminal(&dispatcher, run_id).await;
    assert_eq!(state, RunState::Cancelled);

    let run = dispatcher.get_run(run_id).await.unwrap();
    if let RunState::Running { has_emitted } = run.state {
        panic!("unexpected running state, has_emitted={}", has_emitted);
    }
    assert!(run.output.is_none());
}

#[tokio::test]
async fn repeated_cancel_is_idempotent() {
    let (dispatcher, flows) = default_dispatcher();
    let mut flow = Flow::new("slow");
    flow.add_node(NodeSpec::new("test.slow"));
    let flow_id = flows.insert(flow).await;

    let run_id = dispatcher.submit(tenant(), flow_id).await.unwrap();
    let mut stream = dispatcher.bridge().subscribe(run_id);

    assert!(dispatcher.cancel(run_id).await);
    assert!(dispatcher.cancel(run_id).await);
    assert!(dispatcher.cancel(run_id).await);

    let mut terminal_events = 0;
    while let Ok(Some(event)) =
        tokio::time::timeout(Duration::from_secs(2), stream.next()).await
    {
        if event.is_terminal() {
            terminal_events += 1;
        }
    }
    assert_eq!(terminal_events, 1);
    assert_eq!(wait_terminal(&dispatcher, run_id).await, RunState::Cancelled);
}

#[tokio::test]
async fn cancel_after_completion_leaves_state_completed() {
    let (dispatcher, flows) = default_dispatcher();
    let flow_id = flows.insert(linear_flow(1)).await;

    let run_id = dispatcher.submit(tenant(), flow_id).await.unwrap();
    assert_eq!(wait_terminal(&dispatcher, run_id).await, RunState::Completed);

    // The run is still known, so the request is accepted, but a terminal
    // state is final.
    dispatcher.cancel(run_id).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let run = dispatcher.get_run(run_id).await.unwrap();
    assert_eq!(run.state, RunState::Completed);
}

#[tokio::test]
async fn failed_node_produces_error_event_and_failed_state() {
    let (dispatcher, flows) = default_dispatcher();
    let mut flow = Flow::new("failing");
    flow.add_node(NodeSpec::new("test.fail"));
    let flow_id = flows.insert(flow).await;

    let run_id = dispatcher.submit(tenant(), flow_id).await.unwrap();
    let mut stream = dispatcher.bridge().subscribe(run_id);

    let event = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("no event from failing run")
        .expect("stream closed without terminal event");
    assert!(matches!(event.kind, RunEventKind::Error { .. }));
    assert!(event.is_terminal());

    let state = wait_terminal(&dispatcher, run_id).await;
    assert_eq!(state, RunState::Failed);
    let run = dispatcher.get_run(run_id).await.unwrap();
    assert!(run.error.is_some());
}

#[tokio::test]
async fn node_failure_stops_sibling_nodes_in_flight() {
    let observed = Arc::new(AtomicBool::new(false));
    let mut registry = NodeRegistry::new();
    registry.register(Arc::new(FailFactory));
    registry.register(Arc::new(CancelReporterFactory {
        observed: observed.clone(),
    }));
    let (dispatcher, flows) = dispatcher_with_registry(
        RuntimeConfig::default(),
        Arc::new(AllowAll),
        Arc::new(registry),
    );

    // Two independent roots: one fails immediately while the other is
    // still in flight.
    let mut flow = Flow::new("parallel");
    flow.add_node(NodeSpec::new("test.fail"));
    flow.add_node(NodeSpec::new("test.report_cancel"));
    let flow_id = flows.insert(flow).await;

    let run_id = dispatcher.submit(tenant(), flow_id).await.unwrap();
    assert_eq!(wait_terminal(&dispatcher, run_id).await, RunState::Failed);

    let mut cancelled = false;
    for _ in 0..100 {
        if observed.load(Ordering::SeqCst) {
            cancelled = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(cancelled, "sibling node kept running after the failure");
}

#[tokio::test]
async fn failed_run_is_charged_for_nodes_that_completed() {
    let (dispatcher, flows) = default_dispatcher();
    let mut flow = Flow::new("partial");
    let first = flow.add_node(NodeSpec::new("test.echo").with_config("value", "x"));
    let second = flow.add_node(NodeSpec::new("test.fail"));
    flow.connect(first, "out", second, "in");
    let flow_id = flows.insert(flow).await;

    let workspace = Uuid::new_v4();
    dispatcher.usage().set_quota(workspace, 10);
    let run_id = dispatcher
        .submit(TenantCtx::new(workspace, Uuid::new_v4()), flow_id)
        .await
        .unwrap();

    assert_eq!(wait_terminal(&dispatcher, run_id).await, RunState::Failed);
    // Only the echo ran to completion, so only one unit is debited.
    assert_eq!(dispatcher.usage().consumed(workspace), 1);
    let run = dispatcher.get_run(run_id).await.unwrap();
    assert_eq!(run.units_consumed, 1);
}

#[tokio::test]
async fn run_timeout_converges_to_cancelled() {
    let (dispatcher, flows) = default_dispatcher();
    let mut flow = Flow::new("timed");
    flow.settings.timeout_ms = Some(100);
    flow.add_node(NodeSpec::new("test.slow"));
    let flow_id = flows.insert(flow).await;

    let run_id = dispatcher.submit(tenant(), flow_id).await.unwrap();
    let state = wait_terminal(&dispatcher, run_id).await;
    assert_eq!(state, RunState::Cancelled);
}

#[tokio::test]
async fn unknown_flow_is_rejected_without_creating_a_run() {
    let (dispatcher, _flows) = default_dispatcher();
    let err = dispatcher.submit(tenant(), Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, RunError::Definition(_)));
}

#[tokio::test]
async fn unknown_run_queries_are_not_found() {
    let (dispatcher, _flows) = default_dispatcher();
    assert!(dispatcher.get_run(Uuid::new_v4()).await.is_none());
    assert!(!dispatcher.cancel(Uuid::new_v4()).await);
}

#[tokio::test]
async fn unauthorized_tenant_is_denied_at_admission() {
    let (dispatcher, flows) = dispatcher_with(
        RuntimeConfig::default(),
        Arc::new(RequirePermission("flows:execute".to_string())),
    );
    let flow_id = flows.insert(linear_flow(1)).await;

    let err = dispatcher.submit(tenant(), flow_id).await.unwrap_err();
    assert!(matches!(
        err,
        RunError::AdmissionDenied(DenyReason::Unauthorized(_))
    ));

    let mut allowed = tenant();
    allowed.permissions.push("flows:execute".to_string());
    let run_id = dispatcher.submit(allowed, flow_id).await.unwrap();
    assert_eq!(wait_terminal(&dispatcher, run_id).await, RunState::Completed);
}

#[tokio::test]
async fn rate_limit_denies_excess_submissions_per_flow() {
    let config = RuntimeConfig {
        rate_limit: 2,
        rate_window: Duration::from_secs(60),
        ..RuntimeConfig::default()
    };
    let (dispatcher, flows) = dispatcher_with(config, Arc::new(AllowAll));
    let flow_id = flows.insert(linear_flow(1)).await;

    dispatcher.submit(tenant(), flow_id).await.unwrap();
    dispatcher.submit(tenant(), flow_id).await.unwrap();
    let err = dispatcher.submit(tenant(), flow_id).await.unwrap_err();
    assert!(matches!(
        err,
        RunError::AdmissionDenied(DenyReason::RateLimited { .. })
    ));
}

#[tokio::test]
async fn quota_of_one_does_not_let_two_concurrent_runs_complete() {
    let (dispatcher, flows) = default_dispatcher();
    // Both runs must be in flight before either reaches its completion
    // debit, so the node holds for a moment.
    let mut flow = Flow::new("brief");
    flow.add_node(NodeSpec::new("test.slow").with_config("millis", 200.0));
    let flow_id = flows.insert(flow).await;

    let workspace = Uuid::new_v4();
    dispatcher.usage().set_quota(workspace, 1);
    let tenant_ctx = TenantCtx::new(workspace, Uuid::new_v4());

    let first = dispatcher.submit(tenant_ctx.clone(), flow_id).await.unwrap();
    let second = dispatcher.submit(tenant_ctx, flow_id).await.unwrap();

    let states = [
        wait_terminal(&dispatcher, first).await,
        wait_terminal(&dispatcher, second).await,
    ];
    let completed = states
        .iter()
        .filter(|s| **s == RunState::Completed)
        .count();
    assert_eq!(completed, 1, "exactly one run may consume the last unit");
    assert!(states.contains(&RunState::Failed));
    assert_eq!(dispatcher.usage().consumed(workspace), 1);
}

#[tokio::test]
async fn exhausted_quota_denies_at_admission() {
    let (dispatcher, flows) = default_dispatcher();
    let flow_id = flows.insert(linear_flow(1)).await;

    let workspace = Uuid::new_v4();
    dispatcher.usage().set_quota(workspace, 1);
    let tenant_ctx = TenantCtx::new(workspace, Uuid::new_v4());

    let run_id = dispatcher.submit(tenant_ctx.clone(), flow_id).await.unwrap();
    wait_terminal(&dispatcher, run_id).await;

    let err = dispatcher.submit(tenant_ctx, flow_id).await.unwrap_err();
    assert!(matches!(
        err,
        RunError::AdmissionDenied(DenyReason::QuotaExhausted { .. })
    ));
}
