use crate::admission::{AdmissionGate, Authorizer, Decision};
use crate::bridge::EventBridge;
use crate::cache::CacheStore;
use crate::cancel::CancelRegistry;
use crate::executor::FlowExecutor;
use crate::limiter::RateLimiter;
use crate::registry::NodeRegistry;
use crate::store::FlowStore;
use crate::usage::{QuotaPolicy, UsageTracker};
use fluxcore::{
    Broker, DefinitionError, EventSink, ExecMode, Flow, Run, RunError, RunId, RunJob, RunState,
    TenantCtx,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::RwLock;

/// Tunables for the orchestration runtime
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Per-run topic buffer; absorbs subscribe/publish races at run start
    pub event_buffer: usize,
    /// Flow-scope rate budget: admissions per window
    pub rate_limit: u32,
    pub rate_window: Duration,
    pub quota_policy: QuotaPolicy,
    /// Charge failed runs for the nodes they actually executed
    pub charge_failed: bool,
    /// Default wall-clock budget for runs whose flow sets none
    pub run_timeout: Option<Duration>,
    /// Upper bound on a single node's execution; also the cancellation
    /// responsiveness bound for nodes that never check their token
    pub node_timeout: Option<Duration>,
    /// How often queued-mode workers poll the cancellation flag
    pub cancel_poll_interval: Duration,
    /// Run everything inline even when a broker is configured
    pub force_local: bool,
    /// Attempts for broker operations before surfacing the failure
    pub broker_retries: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            event_buffer: 1024,
            rate_limit: 60,
            rate_window: Duration::from_secs(60),
            quota_policy: QuotaPolicy::default(),
            charge_failed: true,
            run_timeout: None,
            node_timeout: None,
            cancel_poll_interval: Duration::from_secs(2),
            force_local: false,
            broker_retries: 3,
        }
    }
}

/// The central state machine.
///
/// Owns every run record for its lifetime, decides local versus queued
/// execution, and is the single place that understands both paths. Every
/// run that gets past admission emits exactly one terminal event, and its
/// cancel handle and topic are released at the terminal transition.
pub struct Dispatcher {
    config: RuntimeConfig,
    registry: Arc<NodeRegistry>,
    flows: Arc<dyn FlowStore>,
    gate: AdmissionGate,
    usage: Arc<UsageTracker>,
    cancels: Arc<CancelRegistry>,
    bridge: Arc<EventBridge>,
    broker: Option<Arc<dyn Broker>>,
    executor: Arc<FlowExecutor>,
    runs: RwLock<HashMap<RunId, Run>>,
    /// Sinks of runs in their active phase, for the has_emitted flag
    active: Mutex<HashMap<RunId, EventSink>>,
}

impl Dispatcher {
    pub fn new(
        config: RuntimeConfig,
        registry: Arc<NodeRegistry>,
        flows: Arc<dyn FlowStore>,
        cache: Arc<dyn CacheStore>,
        authorizer: Arc<dyn Authorizer>,
    ) -> Self {
        let limiter = Arc::new(RateLimiter::new(config.rate_limit, config.rate_window));
        let usage = Arc::new(UsageTracker::new());
        let gate = AdmissionGate::new(authorizer, limiter, usage.clone(), config.quota_policy);
        let mut executor = FlowExecutor::new(cache.clone());
        if let Some(limit) = config.node_timeout {
            executor = executor.with_node_timeout(limit);
        }
        Self {
            bridge: Arc::new(EventBridge::new(config.event_buffer)),
            cancels: Arc::new(CancelRegistry::with_cache(cache)),
            executor: Arc::new(executor),
            config,
            registry,
            flows,
            gate,
            usage,
            broker: None,
            runs: RwLock::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Attach the broker; runs are queued from here on unless the
    /// configuration forces local execution.
    pub fn with_broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn bridge(&self) -> &Arc<EventBridge> {
        &self.bridge
    }

    pub fn usage(&self) -> &Arc<UsageTracker> {
        &self.usage
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    /// Accept a run request: admission, mode selection, launch.
    ///
    /// Admission or definition failures return an error without creating a
    /// Run. On success the run id is returned immediately; execution
    /// proceeds in the background on either path and results arrive as
    /// events on the run's topic.
    pub async fn submit(self: &Arc<Self>, tenant: TenantCtx, flow_id: fluxcore::FlowId) -> Result<RunId, RunError> {
        let flow = self
            .flows
            .get(flow_id)
            .await
            .ok_or_else(|| DefinitionError::FlowNotFound(flow_id.to_string()))?;
        flow.validate(|node_type| self.registry.contains(node_type))?;

        let estimated_units = flow.nodes.len() as u64;
        match self.gate.admit(&tenant, flow_id, estimated_units).await {
            Decision::Allow => {}
            Decision::Deny(reason) => return Err(RunError::AdmissionDenied(reason)),
        }

        let mode = match &self.broker {
            Some(_) if !self.config.force_local => ExecMode::Queued,
            _ => ExecMode::Local,
        };
        let mut run = Run::new(flow_id, tenant, mode);
        run.state = RunState::Admitted;
        let run_id = run.id;

        // Topic and cancel handle exist before anything can publish or
        // cancel, closing the race at run start.
        let sink = self.bridge.open(run_id);
        let handle = self.cancels.register(run_id);
        self.lock_active().insert(run_id, sink.clone());

        run.state = RunState::Running { has_emitted: false };
        self.runs.write().await.insert(run_id, run);
        tracing::info!(%run_id, %flow_id, ?mode, "run admitted");

        self.spawn_timeout(run_id, &flow);

        match mode {
            ExecMode::Local => {
                let dispatcher = self.clone();
                tokio::spawn(async move {
                    dispatcher.run_local(run_id, flow, sink, handle.token()).await;
                });
            }
            ExecMode::Queued => {
                let tenant = match self.runs.read().await.get(&run_id) {
                    Some(run) => run.tenant.clone(),
                    None => return Err(RunError::Execution("run record missing".to_string())),
                };
                self.enqueue_with_retry(run_id, flow_id, tenant, sink).await?;
                let dispatcher = self.clone();
                tokio::spawn(async move {
                    dispatcher.watch_remote(run_id).await;
                });
            }
        }
        Ok(run_id)
    }

    /// Request cancellation. Idempotent; returns false for unknown runs.
    /// Never blocks on the run: convergence to Cancelled is asynchronous
    /// and bounded by the node-boundary check interval.
    pub async fn cancel(&self, run_id: RunId) -> bool {
        let known = self.runs.read().await.contains_key(&run_id);
        if !known {
            return false;
        }
        self.cancels.signal(run_id).await;
        true
    }

    /// Snapshot of a run record
    pub async fn get_run(&self, run_id: RunId) -> Option<Run> {
        let mut run = self.runs.read().await.get(&run_id).cloned()?;
        if let RunState::Running { has_emitted } = run.state {
            // Local runs emit through the sink, queued runs have the flag
            // recorded by the remote watcher; either one counts.
            let local = self
                .lock_active()
                .get(&run_id)
                .map(|s| s.has_emitted())
                .unwrap_or(false);
            run.state = RunState::Running {
                has_emitted: has_emitted || local,
            };
        }
        Some(run)
    }

    async fn run_local(
        self: Arc<Self>,
        run_id: RunId,
        flow: Flow,
        sink: EventSink,
        token: tokio_util::sync::CancellationToken,
    ) {
        let result = self
            .executor
            .execute(&flow, &self.registry, &sink, token)
            .await;

        match result {
            Ok(outcome) if outcome.cancelled => {
                sink.end(true);
                self.finish(run_id, RunState::Cancelled, None, None, outcome.nodes_executed)
                    .await;
            }
            Ok(outcome) => {
                let units = outcome.nodes_executed;
                if self.config.quota_policy == QuotaPolicy::AtCompletion {
                    let workspace_id = match self.runs.read().await.get(&run_id) {
                        Some(run) => run.tenant.workspace_id,
                        None => return,
                    };
                    if let Err(e) = self.usage.try_debit(workspace_id, units) {
                        // Quota raced to exhaustion between admission and
                        // completion; the run must not land as Completed.
                        tracing::warn!(%run_id, "completion debit failed: {}", e);
                        sink.error(e.to_string());
                        self.finish(run_id, RunState::Failed, None, Some(e.to_string()), units)
                            .await;
                        return;
                    }
                }
                let output = outcome.final_output(&flow);
                sink.end(false);
                self.finish(run_id, RunState::Completed, Some(output), None, units)
                    .await;
            }
            Err(failure) => {
                let units = self
                    .charge_for_failure(run_id, failure.nodes_executed)
                    .await;
                let message = failure.to_string();
                sink.error(message.clone());
                self.finish(run_id, RunState::Failed, None, Some(message), units)
                    .await;
            }
        }
    }

    /// Charge a failed run for the nodes that completed before the
    /// failure, when configured to
    async fn charge_for_failure(&self, run_id: RunId, nodes_executed: u64) -> u64 {
        if !self.config.charge_failed
            || self.config.quota_policy != QuotaPolicy::AtCompletion
            || nodes_executed == 0
        {
            return 0;
        }
        let workspace_id = match self.runs.read().await.get(&run_id) {
            Some(run) => run.tenant.workspace_id,
            None => return 0,
        };
        let _ = self.usage.try_debit(workspace_id, nodes_executed);
        nodes_executed
    }

    /// Follow a queued run's events and mirror its terminal state into the
    /// local run record. Units are debited by the executing worker.
    async fn watch_remote(self: Arc<Self>, run_id: RunId) {
        let mut stream = self.bridge.subscribe(run_id);
        let mut emitted = false;
        while let Some(event) = stream.next().await {
            if !event.is_terminal() {
                // The worker's emissions flow through the broker, not the
                // local sink, so the record's flag is raised here.
                if !emitted {
                    emitted = true;
                    let mut runs = self.runs.write().await;
                    if let Some(run) = runs.get_mut(&run_id) {
                        if let RunState::Running { has_emitted } = &mut run.state {
                            *has_emitted = true;
                        }
                    }
                }
                continue;
            }
            let (state, error) = match &event.kind {
                fluxcore::RunEventKind::End { cancelled: true } => (RunState::Cancelled, None),
                fluxcore::RunEventKind::End { cancelled: false } => (RunState::Completed, None),
                fluxcore::RunEventKind::Error { message } => {
                    (RunState::Failed, Some(message.clone()))
                }
                _ => unreachable!("terminal events are end or error"),
            };
            self.finish(run_id, state, None, error, 0).await;
            return;
        }
        // Stream ended without a terminal event: the topic was torn down or
        // the broker link died for good. Surface the gap as a failure.
        tracing::error!(%run_id, "remote run stream ended without terminal event");
        self.finish(
            run_id,
            RunState::Failed,
            None,
            Some("event stream lost before run finished".to_string()),
            0,
        )
        .await;
    }

    /// Single terminal transition point: updates the record, releases the
    /// cancel handle and the topic. Terminal states are final; a second
    /// call for the same run is a no-op.
    async fn finish(
        &self,
        run_id: RunId,
        state: RunState,
        output: Option<fluxcore::Value>,
        error: Option<String>,
        units: u64,
    ) {
        {
            let mut runs = self.runs.write().await;
            let Some(run) = runs.get_mut(&run_id) else {
                return;
            };
            if run.state.is_terminal() {
                return;
            }
            run.state = state;
            run.finished_at = Some(chrono::Utc::now());
            run.output = output;
            run.error = error;
            run.units_consumed = units;
        }
        tracing::info!(%run_id, ?state, "run finished");
        self.lock_active().remove(&run_id);
        self.cancels.remove(run_id).await;
        self.bridge.close(run_id);
    }

    /// Expiry of the wall-clock budget behaves exactly like cancellation
    fn spawn_timeout(self: &Arc<Self>, run_id: RunId, flow: &Flow) {
        let budget = flow
            .settings
            .timeout_ms
            .map(Duration::from_millis)
            .or(self.config.run_timeout);
        let Some(budget) = budget else { return };
        let dispatcher = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(budget).await;
            let still_active = dispatcher
                .runs
                .read()
                .await
                .get(&run_id)
                .map(|r| !r.state.is_terminal())
                .unwrap_or(false);
            if still_active {
                tracing::warn!(%run_id, "run timed out, signalling cancellation");
                dispatcher.cancels.signal(run_id).await;
            }
        });
    }

    async fn enqueue_with_retry(
        &self,
        run_id: RunId,
        flow_id: fluxcore::FlowId,
        tenant: TenantCtx,
        sink: EventSink,
    ) -> Result<(), RunError> {
        let broker = self
            .broker
            .as_ref()
            .ok_or_else(|| RunError::Infrastructure("no broker configured".to_string()))?;
        let job = RunJob {
            run_id,
            flow_id,
            tenant,
        };
        let mut backoff = Duration::from_millis(200);
        let mut last_err = None;
        for attempt in 1..=self.config.broker_retries {
            match broker.enqueue(job.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(%run_id, attempt, "enqueue failed: {}", e);
                    last_err = Some(e);
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }
        // The run exists, so it must still terminate with one terminal
        // event rather than vanish.
        let message = format!(
            "failed to enqueue run after {} attempts: {}",
            self.config.broker_retries,
            last_err.map(|e| e.to_string()).unwrap_or_default()
        );
        sink.error(message.clone());
        self.finish(run_id, RunState::Failed, None, Some(message.clone()), 0)
            .await;
        Err(RunError::Infrastructure(message))
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, HashMap<RunId, EventSink>> {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
