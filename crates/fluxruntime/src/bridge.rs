use fluxcore::{Broker, EventSink, RunEvent, RunId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Fans run events out to the clients subscribed on this process.
///
/// Each run gets its own broadcast topic, created at admission so the
/// channel buffer absorbs subscribe/publish ordering races at run start.
/// Events produced locally go straight to the topic through the run's
/// [`EventSink`]; events produced by remote workers arrive over the broker
/// and are republished into the topic by the relay task, which discards
/// events for runs with no local topic.
///
/// Delivery to any one subscriber is at-least-once and ordered per run;
/// [`RunEventStream`] deduplicates by sequence number so duplicates from
/// the local/relay overlap are dropped, not re-forwarded.
pub struct EventBridge {
    topics: Mutex<HashMap<RunId, broadcast::Sender<RunEvent>>>,
    buffer: usize,
}

impl EventBridge {
    pub fn new(buffer: usize) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            buffer,
        }
    }

    /// Create the run's topic and hand back its event sink
    pub fn open(&self, run_id: RunId) -> EventSink {
        let sender = self.sender(run_id);
        EventSink::new(run_id, sender)
    }

    /// Subscribe to a run's events. Unknown or already-closed runs get an
    /// immediately-ended stream; subscribing never creates a topic, so a
    /// request for an arbitrary run id leaves no state behind.
    pub fn subscribe(&self, run_id: RunId) -> RunEventStream {
        let rx = self.lock().get(&run_id).map(|sender| sender.subscribe());
        RunEventStream {
            done: rx.is_none(),
            rx,
            last_seq: 0,
        }
    }

    /// Deliver an event that arrived over the broker. Returns false when no
    /// local topic exists, i.e. no client on this instance cares.
    pub fn publish_remote(&self, event: RunEvent) -> bool {
        let topics = self.lock();
        match topics.get(&event.run_id) {
            Some(sender) => {
                let _ = sender.send(event);
                true
            }
            None => false,
        }
    }

    /// Drop the run's topic once the run is terminal and its terminal event
    /// has been published. Events already sent remain readable by attached
    /// subscribers; their streams end after draining.
    pub fn close(&self, run_id: RunId) {
        self.lock().remove(&run_id);
    }

    pub fn has_topic(&self, run_id: RunId) -> bool {
        self.lock().contains_key(&run_id)
    }

    /// Relay the shared broker channel into local topics, resubscribing
    /// with bounded backoff when the broker connection drops. Events
    /// published during a resubscribe window are missed; clients see the
    /// gap as a sequence discontinuity.
    pub fn spawn_relay(self: &Arc<Self>, broker: Arc<dyn Broker>) -> JoinHandle<()> {
        let bridge = self.clone();
        tokio::spawn(async move {
            let mut backoff = Duration::from_millis(500);
            loop {
                match broker.subscribe().await {
                    Ok(mut events) => {
                        backoff = Duration::from_millis(500);
                        while let Some(event) = events.recv().await {
                            // Discards events for runs with no local topic.
                            bridge.publish_remote(event);
                        }
                        tracing::warn!("broker event channel closed, resubscribing");
                    }
                    Err(e) => {
                        tracing::error!("broker subscribe failed: {}, retrying", e);
                    }
                }
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(Duration::from_secs(10));
            }
        })
    }

    fn sender(&self, run_id: RunId) -> broadcast::Sender<RunEvent> {
        let mut topics = self.lock();
        topics
            .entry(run_id)
            .or_insert_with(|| broadcast::channel(self.buffer).0)
            .clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<RunId, broadcast::Sender<RunEvent>>> {
        self.topics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for EventBridge {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Ordered, deduplicated view of one run's events.
///
/// Yields events in strictly increasing sequence order, drops duplicate
/// sequence numbers, and ends after the run's terminal event.
pub struct RunEventStream {
    rx: Option<broadcast::Receiver<RunEvent>>,
    last_seq: u64,
    done: bool,
}

impl RunEventStream {
    pub async fn next(&mut self) -> Option<RunEvent> {
        if self.done {
            return None;
        }
        let rx = self.rx.as_mut()?;
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if event.seq <= self.last_seq {
                        // Duplicate delivery under at-least-once semantics.
                        continue;
                    }
                    self.last_seq = event.seq;
                    if event.is_terminal() {
                        self.done = true;
                    }
                    return Some(event);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "subscriber lagged; clients detect the seq gap");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.done = true;
                    return None;
                }
            }
        }
    }
}
