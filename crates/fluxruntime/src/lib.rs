//! Execution-orchestration runtime.
//!
//! The components that take a run request from admission to a terminal
//! event: the admission gate (authorization, rate, quota), the node
//! registry, the local DAG executor, the cache layer, the cancellation
//! registry, the event stream bridge, the dispatcher state machine, and
//! the queued-mode worker.

pub mod admission;
pub mod bridge;
pub mod cache;
pub mod cancel;
pub mod dispatcher;
pub mod executor;
pub mod limiter;
pub mod registry;
pub mod store;
pub mod usage;
pub mod worker;

pub use admission::{AdmissionGate, AllowAll, AuthError, Authorizer, Decision, RequirePermission};
pub use bridge::{EventBridge, RunEventStream};
pub use cache::{cancel_key, memo_key, CacheStore, MemoryCache};
pub use cancel::{CancelHandle, CancelRegistry};
pub use dispatcher::{Dispatcher, RuntimeConfig};
pub use executor::{ExecFailure, ExecOutcome, FlowExecutor};
pub use limiter::RateLimiter;
pub use registry::{NodeFactory, NodeRegistry, NodeTypeInfo};
pub use store::{FlowStore, MemoryFlowStore};
pub use usage::{QuotaPolicy, Remaining, UsageTracker};
pub use worker::Worker;
