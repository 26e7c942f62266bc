use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Per-scope sliding-window rate limiter.
///
/// A scope is any budgeted resource key (flow id, workspace id). Decisions
/// are conservative under concurrency: the window is checked and the slot
/// recorded under one lock, so no admission slips past an exhausted budget.
/// Declined attempts consume nothing.
pub struct RateLimiter {
    max_per_window: u32,
    window: Duration,
    scopes: Mutex<HashMap<String, Vec<Instant>>>,
}

impl RateLimiter {
    pub fn new(max_per_window: u32, window: Duration) -> Self {
        Self {
            max_per_window,
            window,
            scopes: Mutex::new(HashMap::new()),
        }
    }

    /// Try to take one admission slot for the scope.
    ///
    /// Returns false once the scope has used its budget for the current
    /// window; the attempt itself is not recorded in that case.
    pub fn try_acquire(&self, scope: &str) -> bool {
        let now = Instant::now();
        let mut scopes = self
            .scopes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let hits = scopes.entry(scope.to_string()).or_default();
        hits.retain(|t| now.duration_since(*t) < self.window);
        if hits.len() as u32 >= self.max_per_window {
            return false;
        }
        hits.push(now);
        true
    }

    /// Give back the most recent slot taken for the scope.
    ///
    /// Used when a later admission check declines the request, so a denied
    /// admission leaves no counter consumed.
    pub fn release(&self, scope: &str) {
        let mut scopes = self
            .scopes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(hits) = scopes.get_mut(scope) {
            hits.pop();
        }
    }

    /// Admissions still available for the scope in the current window
    pub fn remaining(&self, scope: &str) -> u32 {
        let now = Instant::now();
        let mut scopes = self
            .scopes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let hits = scopes.entry(scope.to_string()).or_default();
        hits.retain(|t| now.duration_since(*t) < self.window);
        self.max_per_window.saturating_sub(hits.len() as u32)
    }
}
