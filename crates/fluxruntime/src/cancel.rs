use crate::cache::{cancel_key, CacheStore};
use fluxcore::{RunId, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How long the cross-process cancellation flag stays visible. Long enough
/// to outlive any sane run; the flag is deleted at the terminal transition.
const FLAG_TTL: Duration = Duration::from_secs(6 * 60 * 60);

/// Per-run cancellation token, signal-once and idempotent.
///
/// Executors observe it at node boundaries; cancellation-aware nodes select
/// on the token directly.
#[derive(Clone)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_signalled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Maps live runs to their cancellation handles.
///
/// Handles are local to the process that owns them. When a cache store is
/// attached (queued mode), signalling also writes a `cancel:` flag so a
/// worker on another instance observes the request within its poll
/// interval. Handles are removed when the run reaches a terminal state.
pub struct CancelRegistry {
    handles: Mutex<HashMap<RunId, CancelHandle>>,
    cache: Option<Arc<dyn CacheStore>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self {
            handles: Mutex::new(HashMap::new()),
            cache: None,
        }
    }

    /// Registry whose signals are also visible across processes
    pub fn with_cache(cache: Arc<dyn CacheStore>) -> Self {
        Self {
            handles: Mutex::new(HashMap::new()),
            cache: Some(cache),
        }
    }

    pub fn register(&self, run_id: RunId) -> CancelHandle {
        let handle = CancelHandle {
            token: CancellationToken::new(),
        };
        self.lock().insert(run_id, handle.clone());
        handle
    }

    /// Signal cancellation for a run. Returns false for unknown runs.
    ///
    /// Idempotent: signalling an already-signalled or already-terminal run
    /// is a no-op that still returns true. Never blocks on the run itself;
    /// convergence to Cancelled is asynchronous.
    pub async fn signal(&self, run_id: RunId) -> bool {
        let found = {
            let handles = self.lock();
            match handles.get(&run_id) {
                Some(handle) => {
                    handle.token.cancel();
                    true
                }
                None => false,
            }
        };
        if let Some(cache) = &self.cache {
            cache
                .set(&cancel_key(run_id), Value::Bool(true), FLAG_TTL)
                .await;
            return true;
        }
        found
    }

    /// Local, in-memory check
    pub fn is_signalled(&self, run_id: RunId) -> bool {
        self.lock()
            .get(&run_id)
            .map(|h| h.is_signalled())
            .unwrap_or(false)
    }

    /// Cross-process check against the cache-backed flag
    pub async fn is_signalled_remote(&self, run_id: RunId) -> bool {
        match &self.cache {
            Some(cache) => cache
                .get(&cancel_key(run_id))
                .await
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            None => false,
        }
    }

    /// Drop the handle and clear any cross-process flag; called exactly
    /// when the run reaches a terminal state.
    pub async fn remove(&self, run_id: RunId) {
        self.lock().remove(&run_id);
        if let Some(cache) = &self.cache {
            cache.delete(&cancel_key(run_id)).await;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<RunId, CancelHandle>> {
        self.handles
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for CancelRegistry {
    fn default() -> Self {
        Self::new()
    }
}
