//! Session lifecycle hooks.

use crate::oidc::ClaimSet;
use crate::session::{Session, SessionId};

/// Observer for session lifecycle transitions. All hooks default to no-ops
/// and run inline, so implementations must not block.
pub trait SessionEvents: Send + Sync {
    fn signed_in(&self, _session: &Session, _identity: &ClaimSet) {}

    fn token_refreshed(&self, _session_id: &SessionId) {}

    /// The session's tokens were discarded after a failed refresh.
    fn session_invalidated(&self, _session_id: &SessionId, _reason: &str) {}

    fn signed_out(&self, _session_id: &SessionId) {}
}

/// Hooks that do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEvents;

impl SessionEvents for NoopEvents {}
