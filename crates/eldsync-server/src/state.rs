//! Application state shared across handlers.

use std::sync::Arc;
use std::time::Instant;

use eldsync_core::SyncOrchestrator;

/// Shared application state.
#[derive(Debug, Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

#[derive(Debug)]
struct AppStateInner {
    orchestrator: SyncOrchestrator,
    started_at: Instant,
}

/// State handle passed to handlers.
pub type SharedState = AppState;

impl AppState {
    /// Wrap a running orchestrator.
    #[must_use]
    pub fn new(orchestrator: SyncOrchestrator) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                orchestrator,
                started_at: Instant::now(),
            }),
        }
    }

    /// The sync orchestrator.
    #[must_use]
    pub fn orchestrator(&self) -> &SyncOrchestrator {
        &self.inner.orchestrator
    }

    /// Seconds since the state was created.
    #[must_use]
    pub fn uptime_secs(&self) -> u64 {
        self.inner.started_at.elapsed().as_secs()
    }
}
