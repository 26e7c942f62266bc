//! Core abstractions for the flux execution-orchestration engine.
//!
//! This crate carries the types every other component depends on: flow
//! definitions, run records and their lifecycle, the node contract, the
//! error taxonomy, and run events together with the broker contract used in
//! queued mode.

mod error;
pub mod events;
mod flow;
mod node;
mod run;
mod value;

pub use error::{BrokerError, DefinitionError, DenyReason, NodeError, Result, RunError};
pub use events::{Broker, BrokerEvents, ChannelBroker, EventSink, RunEvent, RunEventKind, RunJob};
pub use flow::{Connection, Flow, FlowId, FlowSettings, NodeId, NodeSpec};
pub use node::{Node, NodeContext, NodeOutput};
pub use run::{ExecMode, Run, RunId, RunState, TenantCtx};
pub use value::Value;
