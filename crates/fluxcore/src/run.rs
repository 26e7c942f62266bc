use crate::{FlowId, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type RunId = Uuid;

/// Resolved tenant identity attached to every run request.
///
/// Produced by the authorization collaborator; the orchestrator treats the
/// permission set as opaque strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantCtx {
    pub workspace_id: Uuid,
    pub org_id: Uuid,
    #[serde(default)]
    pub permissions: Vec<String>,
}

impl TenantCtx {
    pub fn new(workspace_id: Uuid, org_id: Uuid) -> Self {
        Self {
            workspace_id,
            org_id,
            permissions: Vec::new(),
        }
    }
}

/// Where a run executes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecMode {
    /// Inline, in the process that accepted the request
    Local,
    /// Handed to a worker process via the broker
    Queued,
}

/// Run lifecycle.
///
/// `Pending` exists only during admission; `Running` carries a flag for
/// whether output has been emitted instead of a separate streaming state,
/// since nodes may emit, block, then emit again. Terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum RunState {
    Pending,
    Admitted,
    Running { has_emitted: bool },
    Completed,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Failed | RunState::Cancelled
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(self, RunState::Running { .. })
    }
}

/// One execution attempt of a flow.
///
/// Owned exclusively by the dispatcher for its lifetime; a resubmission of
/// the same flow always allocates a fresh run id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub flow_id: FlowId,
    pub tenant: TenantCtx,
    pub mode: ExecMode,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub output: Option<Value>,
    pub error: Option<String>,
    /// Units consumed, recorded at the terminal transition for usage debit
    pub units_consumed: u64,
}

impl Run {
    pub fn new(flow_id: FlowId, tenant: TenantCtx, mode: ExecMode) -> Self {
        Self {
            id: Uuid::new_v4(),
            flow_id,
            tenant,
            mode,
            state: RunState::Pending,
            started_at: Utc::now(),
            finished_at: None,
            output: None,
            error: None,
            units_consumed: 0,
        }
    }
}
