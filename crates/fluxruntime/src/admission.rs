use crate::limiter::RateLimiter;
use crate::usage::{QuotaPolicy, Remaining, UsageTracker};
use async_trait::async_trait;
use fluxcore::{DenyReason, FlowId, TenantCtx};
use std::sync::Arc;

/// External authorization collaborator.
///
/// The policy language is not this crate's concern; the gate only needs a
/// positive decision for the resolved tenant and target flow. Any error is
/// treated as a denial (fail closed).
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(&self, tenant: &TenantCtx, flow_id: FlowId) -> Result<(), AuthError>;
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct AuthError(pub String);

/// Permits everything; single-tenant and test deployments
pub struct AllowAll;

#[async_trait]
impl Authorizer for AllowAll {
    async fn authorize(&self, _tenant: &TenantCtx, _flow_id: FlowId) -> Result<(), AuthError> {
        Ok(())
    }
}

/// Requires a named permission in the tenant's resolved permission set
pub struct RequirePermission(pub String);

#[async_trait]
impl Authorizer for RequirePermission {
    async fn authorize(&self, tenant: &TenantCtx, _flow_id: FlowId) -> Result<(), AuthError> {
        if tenant.permissions.iter().any(|p| p == &self.0) {
            Ok(())
        } else {
            Err(AuthError(format!("missing permission '{}'", self.0)))
        }
    }
}

/// Outcome of admission
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Allow,
    Deny(DenyReason),
}

impl Decision {
    pub fn is_allow(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

/// Evaluates every check a run request must pass before any work starts:
/// authorization, then the flow's rate budget, then tenant quota. The first
/// failing check short-circuits. A declined request leaves no counter
/// consumed; an allowed one consumes exactly one rate slot (plus the quota
/// reservation when the policy debits at admission).
pub struct AdmissionGate {
    authorizer: Arc<dyn Authorizer>,
    limiter: Arc<RateLimiter>,
    usage: Arc<UsageTracker>,
    policy: QuotaPolicy,
}

impl AdmissionGate {
    pub fn new(
        authorizer: Arc<dyn Authorizer>,
        limiter: Arc<RateLimiter>,
        usage: Arc<UsageTracker>,
        policy: QuotaPolicy,
    ) -> Self {
        Self {
            authorizer,
            limiter,
            usage,
            policy,
        }
    }

    pub async fn admit(
        &self,
        tenant: &TenantCtx,
        flow_id: FlowId,
        estimated_units: u64,
    ) -> Decision {
        if let Err(e) = self.authorizer.authorize(tenant, flow_id).await {
            tracing::debug!(%flow_id, "admission denied by authorizer: {}", e);
            return Decision::Deny(DenyReason::Unauthorized(e.to_string()));
        }

        let scope = flow_id.to_string();
        if !self.limiter.try_acquire(&scope) {
            return Decision::Deny(DenyReason::RateLimited { scope });
        }

        let quota_ok = match self.policy {
            QuotaPolicy::AtAdmission => self
                .usage
                .try_debit(tenant.workspace_id, estimated_units)
                .is_ok(),
            // Completion-time debiting only requires the quota not to be
            // exhausted yet; the actual charge happens at the terminal
            // transition.
            QuotaPolicy::AtCompletion => {
                self.usage.remaining(tenant.workspace_id) != Remaining::Units(0)
            }
        };
        if !quota_ok {
            // Undo the rate slot so a declined admission has no side effect.
            self.limiter.release(&scope);
            return Decision::Deny(DenyReason::QuotaExhausted {
                workspace_id: tenant.workspace_id,
            });
        }

        Decision::Allow
    }
}
