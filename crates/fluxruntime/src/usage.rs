use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

/// Quota still available to a tenant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Remaining {
    Unlimited,
    Units(u64),
}

/// When quota is debited.
///
/// `AtCompletion` (the default) avoids charging runs that fail before doing
/// work; `AtAdmission` reserves the units up front. Either way a single
/// remaining unit can only ever fund one completed run: the completion-time
/// debit is a check-and-debit that fails when quota raced to exhaustion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QuotaPolicy {
    AtAdmission,
    #[default]
    AtCompletion,
}

/// Accumulates per-tenant consumption and enforces quota.
///
/// Read by the admission gate; written by the dispatcher on terminal
/// transitions. Tenants without an explicit quota are unlimited.
pub struct UsageTracker {
    inner: Mutex<UsageState>,
}

#[derive(Default)]
struct UsageState {
    quotas: HashMap<Uuid, u64>,
    consumed: HashMap<Uuid, u64>,
}

/// Raised by [`UsageTracker::try_debit`] when the tenant cannot cover units
#[derive(Debug, thiserror::Error)]
#[error("quota exhausted for workspace {workspace_id}: {requested} units requested, {remaining} remaining")]
pub struct QuotaExceeded {
    pub workspace_id: Uuid,
    pub requested: u64,
    pub remaining: u64,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(UsageState::default()),
        }
    }

    /// Assign a finite quota to a tenant (replacing any previous value)
    pub fn set_quota(&self, workspace_id: Uuid, units: u64) {
        let mut state = self.lock();
        state.quotas.insert(workspace_id, units);
    }

    pub fn remaining(&self, workspace_id: Uuid) -> Remaining {
        let state = self.lock();
        match state.quotas.get(&workspace_id) {
            Some(units) => Remaining::Units(*units),
            None => Remaining::Unlimited,
        }
    }

    /// Atomically check and debit units from the tenant's quota.
    ///
    /// Consumption is recorded on success regardless of whether the tenant
    /// has a finite quota.
    pub fn try_debit(&self, workspace_id: Uuid, units: u64) -> Result<(), QuotaExceeded> {
        let mut state = self.lock();
        if let Some(remaining) = state.quotas.get_mut(&workspace_id) {
            if *remaining < units {
                return Err(QuotaExceeded {
                    workspace_id,
                    requested: units,
                    remaining: *remaining,
                });
            }
            *remaining -= units;
        }
        *state.consumed.entry(workspace_id).or_default() += units;
        Ok(())
    }

    /// Total units ever debited for a tenant
    pub fn consumed(&self, workspace_id: Uuid) -> u64 {
        let state = self.lock();
        state.consumed.get(&workspace_id).copied().unwrap_or(0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, UsageState> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for UsageTracker {
    fn default() -> Self {
        Self::new()
    }
}
