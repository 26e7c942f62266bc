use crate::{BrokerError, FlowId, RunEvent, RunId, TenantCtx};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, Mutex};

/// Unit of work handed to the distributed worker pool.
///
/// Carries the resolved tenant so the executing worker can attribute
/// usage without re-running authorization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunJob {
    pub run_id: RunId,
    pub flow_id: FlowId,
    pub tenant: TenantCtx,
}

/// Stream of run events delivered from the broker channel.
///
/// The channel ends (yields `None`) when the broker connection is lost;
/// consumers resubscribe to recover. Events published during the outage may
/// be missed; clients detect the gap via sequence discontinuity.
pub type BrokerEvents = mpsc::Receiver<RunEvent>;

/// Queue + pub/sub contract required in queued mode.
///
/// The job queue provides at-most-one-active-worker-per-job; the event
/// channel is shared, at-least-once, and ordered per run.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Hand a run to the worker pool
    async fn enqueue(&self, job: RunJob) -> Result<(), BrokerError>;

    /// Await the next job; each job is delivered to exactly one caller
    async fn next_job(&self) -> Result<RunJob, BrokerError>;

    /// Publish a run event to the shared channel
    async fn publish(&self, event: RunEvent) -> Result<(), BrokerError>;

    /// Open a fresh subscription to the shared event channel
    async fn subscribe(&self) -> Result<BrokerEvents, BrokerError>;
}

/// In-process broker over tokio channels.
///
/// Used by tests and single-binary queued-mode deployments; the production
/// deployment uses [`super::iggy::IggyBroker`].
pub struct ChannelBroker {
    job_tx: mpsc::Sender<RunJob>,
    job_rx: Mutex<mpsc::Receiver<RunJob>>,
    event_tx: broadcast::Sender<RunEvent>,
}

impl ChannelBroker {
    pub fn new(capacity: usize) -> Self {
        let (job_tx, job_rx) = mpsc::channel(capacity);
        let (event_tx, _) = broadcast::channel(capacity);
        Self {
            job_tx,
            job_rx: Mutex::new(job_rx),
            event_tx,
        }
    }
}

impl Default for ChannelBroker {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl Broker for ChannelBroker {
    async fn enqueue(&self, job: RunJob) -> Result<(), BrokerError> {
        self.job_tx
            .send(job)
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))
    }

    async fn next_job(&self) -> Result<RunJob, BrokerError> {
        // One receiver shared by all workers gives each job to one puller.
        let mut rx = self.job_rx.lock().await;
        rx.recv()
            .await
            .ok_or_else(|| BrokerError::Consume("job queue closed".to_string()))
    }

    async fn publish(&self, event: RunEvent) -> Result<(), BrokerError> {
        // No subscribers yet is fine; the event channel is best-effort.
        let _ = self.event_tx.send(event);
        Ok(())
    }

    async fn subscribe(&self) -> Result<BrokerEvents, BrokerError> {
        let mut source = self.event_tx.subscribe();
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(event) => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    // Lagged receivers skip ahead; missed events surface to
                    // clients as a sequence gap.
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "broker subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RunEventKind;
    use chrono::Utc;
    use uuid::Uuid;

    fn event(run_id: RunId, seq: u64) -> RunEvent {
        RunEvent {
            run_id,
            seq,
            kind: RunEventKind::End { cancelled: false },
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn each_job_goes_to_exactly_one_puller() {
        let broker = ChannelBroker::default();
        broker
            .enqueue(RunJob {
                run_id: Uuid::new_v4(),
                flow_id: Uuid::new_v4(),
                tenant: TenantCtx::new(Uuid::new_v4(), Uuid::new_v4()),
            })
            .await
            .unwrap();

        let first = broker.next_job().await.unwrap();
        // A second pull should block; verify with a zero-ish timeout.
        let second =
            tokio::time::timeout(std::time::Duration::from_millis(50), broker.next_job()).await;
        assert!(second.is_err(), "job delivered twice: {:?}", first.run_id);
    }

    #[tokio::test]
    async fn published_events_reach_all_subscribers() {
        let broker = ChannelBroker::default();
        let mut sub_a = broker.subscribe().await.unwrap();
        let mut sub_b = broker.subscribe().await.unwrap();

        let run_id = Uuid::new_v4();
        broker.publish(event(run_id, 1)).await.unwrap();

        assert_eq!(sub_a.recv().await.unwrap().run_id, run_id);
        assert_eq!(sub_b.recv().await.unwrap().run_id, run_id);
    }
}
