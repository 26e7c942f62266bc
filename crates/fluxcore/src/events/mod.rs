//! Run events: ordered incremental output for one run.
//!
//! Every event carries a sequence number that increases monotonically
//! within its run. Sequence numbers are assigned by the run's [`EventSink`]
//! and are the basis for subscriber-side deduplication and gap detection
//! under at-least-once delivery.

mod broker;
pub mod iggy;

pub use broker::{Broker, BrokerEvents, ChannelBroker, RunJob};

use crate::{NodeId, RunId, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// One unit of incremental output for a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    pub run_id: RunId,
    /// Monotonic within the run, starting at 1
    pub seq: u64,
    pub kind: RunEventKind,
    pub timestamp: DateTime<Utc>,
}

impl RunEvent {
    /// Terminal events close the run's stream: `end` for completed or
    /// cancelled runs, `error` for failed ones.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            RunEventKind::End { .. } | RunEventKind::Error { .. }
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunEventKind {
    /// A node produced output on a port
    Data {
        node_id: NodeId,
        port: String,
        payload: Value,
    },
    /// The run failed; message is sanitized for clients. Terminal.
    Error { message: String },
    /// The run completed or was cancelled. Terminal.
    End { cancelled: bool },
}

/// Per-run event producer.
///
/// Cloneable; all clones share one sequence counter so events from
/// concurrently executing nodes still get unique, increasing numbers.
/// Sends never block and ignore the absence of subscribers.
#[derive(Clone)]
pub struct EventSink {
    run_id: RunId,
    next_seq: Arc<AtomicU64>,
    sender: broadcast::Sender<RunEvent>,
}

impl EventSink {
    pub fn new(run_id: RunId, sender: broadcast::Sender<RunEvent>) -> Self {
        Self {
            run_id,
            next_seq: Arc::new(AtomicU64::new(1)),
            sender,
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// True once any event has been emitted on this run
    pub fn has_emitted(&self) -> bool {
        self.next_seq.load(Ordering::SeqCst) > 1
    }

    /// Assign the next sequence number and publish to the local topic
    pub fn emit(&self, kind: RunEventKind) -> RunEvent {
        let event = RunEvent {
            run_id: self.run_id,
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
            kind,
            timestamp: Utc::now(),
        };
        let _ = self.sender.send(event.clone());
        event
    }

    pub fn data(&self, node_id: NodeId, port: impl Into<String>, payload: Value) -> RunEvent {
        self.emit(RunEventKind::Data {
            node_id,
            port: port.into(),
            payload,
        })
    }

    pub fn error(&self, message: impl Into<String>) -> RunEvent {
        self.emit(RunEventKind::Error {
            message: message.into(),
        })
    }

    pub fn end(&self, cancelled: bool) -> RunEvent {
        self.emit(RunEventKind::End { cancelled })
    }
}
