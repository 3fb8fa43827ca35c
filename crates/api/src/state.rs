//! Application state

use subsync_billing::SyncService;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub sync: SyncService,
    pub config: Config,
    /// Cancelled when the server begins shutting down
    pub shutdown: CancellationToken,
    /// Background work the server waits for before exiting
    pub tasks: TaskTracker,
}

impl AppState {
    pub fn new(sync: SyncService, config: Config) -> Self {
        Self {
            sync,
            config,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }
}
