use crate::cache::CacheStore;
use crate::cancel::CancelRegistry;
use crate::executor::FlowExecutor;
use crate::registry::NodeRegistry;
use crate::store::FlowStore;
use crate::usage::{QuotaPolicy, UsageTracker};
use fluxcore::{Broker, EventSink, RunError, RunJob};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Queued-mode execution worker.
///
/// Pulls jobs from the broker (which guarantees each job reaches one
/// worker), executes the flow locally, and publishes every run event to the
/// shared broker channel so the instance serving the client can forward
/// them. Cancellation requests land in the cache as a `cancel:` flag; the
/// worker polls it at a bounded interval in addition to the node-boundary
/// checks the executor performs.
pub struct Worker {
    registry: Arc<NodeRegistry>,
    flows: Arc<dyn FlowStore>,
    broker: Arc<dyn Broker>,
    cancels: Arc<CancelRegistry>,
    executor: FlowExecutor,
    usage: Arc<UsageTracker>,
    quota_policy: QuotaPolicy,
    charge_failed: bool,
    cancel_poll_interval: Duration,
}

impl Worker {
    pub fn new(
        registry: Arc<NodeRegistry>,
        flows: Arc<dyn FlowStore>,
        cache: Arc<dyn CacheStore>,
        broker: Arc<dyn Broker>,
        usage: Arc<UsageTracker>,
    ) -> Self {
        Self {
            registry,
            flows,
            broker,
            cancels: Arc::new(CancelRegistry::with_cache(cache.clone())),
            executor: FlowExecutor::new(cache),
            usage,
            quota_policy: QuotaPolicy::default(),
            charge_failed: true,
            cancel_poll_interval: Duration::from_secs(2),
        }
    }

    /// Bounded interval at which the cache-backed cancellation flag is
    /// polled during execution
    pub fn with_cancel_poll_interval(mut self, interval: Duration) -> Self {
        self.cancel_poll_interval = interval;
        self
    }

    pub fn with_quota_policy(mut self, policy: QuotaPolicy, charge_failed: bool) -> Self {
        self.quota_policy = policy;
        self.charge_failed = charge_failed;
        self
    }

    /// Consume jobs until the broker connection is lost
    pub async fn run(&self) -> Result<(), RunError> {
        tracing::info!("worker started, waiting for jobs");
        loop {
            let job = self.broker.next_job().await?;
            tracing::info!(run_id = %job.run_id, flow_id = %job.flow_id, "picked up run job");
            self.process(job).await;
        }
    }

    async fn process(&self, job: RunJob) {
        let run_id = job.run_id;

        // Local topic whose events are forwarded to the broker channel.
        let (topic, _) = broadcast::channel(1024);
        let sink = EventSink::new(run_id, topic.clone());
        let forwarder = self.spawn_forwarder(topic.subscribe());

        let Some(flow) = self.flows.get(job.flow_id).await else {
            tracing::error!(run_id = %run_id, "flow {} not found for queued run", job.flow_id);
            sink.error(format!("flow not found: {}", job.flow_id));
            drop(sink);
            let _ = forwarder.await;
            return;
        };

        let handle = self.cancels.register(run_id);
        let watcher_stop = CancellationToken::new();
        let watcher = self.spawn_cancel_watcher(run_id, handle.token(), watcher_stop.clone());

        let workspace_id = job.tenant.workspace_id;
        let result = self
            .executor
            .execute(&flow, &self.registry, &sink, handle.token())
            .await;
        watcher_stop.cancel();
        let _ = watcher.await;

        match result {
            Ok(outcome) if outcome.cancelled => {
                sink.end(true);
            }
            Ok(outcome) => {
                if self.quota_policy == QuotaPolicy::AtCompletion {
                    if let Err(e) = self.usage.try_debit(workspace_id, outcome.nodes_executed) {
                        sink.error(e.to_string());
                        self.teardown(run_id, sink, forwarder).await;
                        return;
                    }
                }
                sink.end(false);
            }
            Err(failure) => {
                // Failed runs pay for the nodes that completed before the
                // failure, same as the local path.
                if self.charge_failed
                    && self.quota_policy == QuotaPolicy::AtCompletion
                    && failure.nodes_executed > 0
                {
                    let _ = self.usage.try_debit(workspace_id, failure.nodes_executed);
                }
                sink.error(failure.to_string());
            }
        }
        self.teardown(run_id, sink, forwarder).await;
    }

    async fn teardown(
        &self,
        run_id: fluxcore::RunId,
        sink: EventSink,
        forwarder: tokio::task::JoinHandle<()>,
    ) {
        self.cancels.remove(run_id).await;
        // Dropping the sink closes the topic so the forwarder drains and
        // exits after the terminal event is published.
        drop(sink);
        let _ = forwarder.await;
    }

    fn spawn_forwarder(
        &self,
        mut rx: broadcast::Receiver<fluxcore::RunEvent>,
    ) -> tokio::task::JoinHandle<()> {
        let broker = self.broker.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if let Err(e) = broker.publish(event).await {
                            // Lost events surface to clients as a sequence
                            // gap; delivery is at-least-once, not exact.
                            tracing::error!("failed to publish run event: {}", e);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "event forwarder lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Poll the cache-backed cancellation flag until execution ends.
    /// Responsiveness for a signal raised on another instance is bounded by
    /// the poll interval plus the executor's node-boundary check.
    fn spawn_cancel_watcher(
        &self,
        run_id: fluxcore::RunId,
        token: CancellationToken,
        stop: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let cancels = self.cancels.clone();
        let interval = self.cancel_poll_interval;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                if cancels.is_signalled_remote(run_id).await {
                    tracing::info!(%run_id, "remote cancellation flag observed");
                    token.cancel();
                    return;
                }
            }
        })
    }
}
