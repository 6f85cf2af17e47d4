//! Shared application state.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor. It
//! carries the session manager, which owns all live collaboration state
//! (rooms, connection bindings, pending saves, outbound queues). Nothing
//! here is a process-wide global; tests build as many states as they like.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::services::document::DocumentStore;
use crate::services::session::SessionManager;

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Shared application state. Clone is required by Axum; every field is cheap
/// to clone.
#[derive(Clone)]
pub struct AppState {
    pub sessions: SessionManager,
    /// Outbound event queue depth per socket.
    pub client_channel_capacity: usize,
    shutdown: Arc<watch::Sender<bool>>,
}

impl AppState {
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>, save_debounce: Duration, client_channel_capacity: usize) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            sessions: SessionManager::new(store, save_debounce),
            client_channel_capacity,
            shutdown: Arc::new(shutdown),
        }
    }

    /// Receiver that flips to `true` once shutdown begins.
    #[must_use]
    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Tell every live socket to close.
    pub fn begin_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Wait up to `grace` for sockets to close, then store every pending save.
    pub async fn drain(&self, grace: Duration) {
        let deadline = tokio::time::Instant::now() + grace;
        while self.sessions.hub().connection_count() > 0 {
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    connections = self.sessions.hub().connection_count(),
                    "sockets still open after shutdown grace period"
                );
                break;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }

        info!(pending = self.sessions.pending_saves(), "flushing pending saves");
        self.sessions.flush_pending().await;
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================
