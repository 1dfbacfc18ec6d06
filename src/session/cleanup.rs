//! Background cleanup task.
//!
//! Periodically evicts expired token records, pending logins,
//! redeemed-code entries and ended-session markers.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, info, warn};

use super::store::TokenStore;
use crate::flow::AuthorizationFlowCoordinator;

/// Default cleanup interval in seconds.
pub const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 300; // 5 minutes

/// Spawn a background task that periodically cleans up expired state.
///
/// Returns a `JoinHandle` that can be used to abort the task.
pub fn spawn_cleanup_task(
    store: Arc<dyn TokenStore>,
    flow: Arc<AuthorizationFlowCoordinator>,
    cleanup_interval_secs: u64,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(cleanup_interval_secs.max(1)));

        // Skip the first immediate tick
        ticker.tick().await;

        loop {
            ticker.tick().await;
            run_cleanup(store.as_ref(), &flow);
        }
    })
}

fn run_cleanup(store: &dyn TokenStore, flow: &AuthorizationFlowCoordinator) {
    match store.evict_expired() {
        Ok(0) => debug!("Token cleanup: no expired sessions"),
        Ok(count) => info!(evicted = count, "Token cleanup completed"),
        Err(e) => warn!(error = %e, "Token cleanup failed"),
    }

    let flow_evicted = flow.evict_expired();
    if flow_evicted > 0 {
        debug!(evicted = flow_evicted, "Expired login and sign-out state dropped");
    }

    match store.session_count() {
        Ok(count) => {
            debug!(
                active_sessions = count,
                pending_logins = flow.pending_count(),
                "Session store status"
            );
        }
        Err(e) => {
            debug!(error = %e, "Failed to get session count");
        }
    }
}
