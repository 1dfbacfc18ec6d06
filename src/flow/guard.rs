//! Per-session locks and the ended-session list, shared by login, sign-out
//! and refresh.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

use crate::session::SessionId;

/// Upper bound on remembered ended sessions.
pub const DEFAULT_MAX_ENDED: usize = 100_000;

type LockTable = Mutex<HashMap<SessionId, Arc<AsyncMutex<()>>>>;

/// Serialises work on one session and remembers sessions that were signed
/// out or invalidated, so a cookie still naming them cannot bring their
/// tokens back.
pub struct SessionGuard {
    locks: LockTable,
    ended: Mutex<HashMap<SessionId, DateTime<Utc>>>,
    ended_ttl: Duration,
    max_ended: usize,
}

/// Held for the duration of a session critical section.
pub struct SessionLock<'a> {
    // Dropped before the lease so the lease sees only the table's reference.
    _guard: OwnedMutexGuard<()>,
    _lease: LockLease<'a>,
}

/// Removes the table entry once the last holder is gone.
struct LockLease<'a> {
    table: &'a LockTable,
    id: SessionId,
    lock: Arc<AsyncMutex<()>>,
}

impl Drop for LockLease<'_> {
    fn drop(&mut self) {
        if let Ok(mut table) = self.table.lock() {
            // Two references left: the table's and ours.
            let idle = table
                .get(&self.id)
                .is_some_and(|entry| Arc::ptr_eq(entry, &self.lock) && Arc::strong_count(entry) == 2);
            if idle {
                table.remove(&self.id);
            }
        }
    }
}

impl SessionGuard {
    /// Ended sessions are remembered for `ended_ttl_secs`, which should be
    /// the session cookie lifetime.
    pub fn new(ended_ttl_secs: u64) -> Self {
        Self::with_capacity(ended_ttl_secs, DEFAULT_MAX_ENDED)
    }

    pub fn with_capacity(ended_ttl_secs: u64, max_ended: usize) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            ended: Mutex::new(HashMap::new()),
            ended_ttl: Duration::seconds(ended_ttl_secs as i64),
            max_ended: max_ended.max(1),
        }
    }

    /// Wait for exclusive access to the session.
    pub async fn lock(&self, id: &SessionId) -> SessionLock<'_> {
        let lock = match self.locks.lock() {
            Ok(mut table) => table.entry(*id).or_default().clone(),
            // Poisoned table: fall back to an unshared lock.
            Err(_) => Arc::new(AsyncMutex::new(())),
        };
        let lease = LockLease {
            table: &self.locks,
            id: *id,
            lock: lock.clone(),
        };
        SessionLock {
            _guard: lock.lock_owned().await,
            _lease: lease,
        }
    }

    /// Sessions with a lock entry (work in flight or queued).
    pub fn locked_sessions(&self) -> usize {
        self.locks.lock().map(|t| t.len()).unwrap_or(0)
    }

    /// Remember that the session ended.
    pub fn end(&self, id: &SessionId) {
        let Ok(mut ended) = self.ended.lock() else {
            return;
        };
        let now = Utc::now();
        if ended.len() >= self.max_ended && !ended.contains_key(id) {
            ended.retain(|_, until| *until > now);
            if ended.len() >= self.max_ended {
                if let Some(oldest) = ended.iter().min_by_key(|(_, until)| **until).map(|(id, _)| *id) {
                    ended.remove(&oldest);
                }
            }
        }
        ended.insert(*id, now + self.ended_ttl);
    }

    pub fn is_ended(&self, id: &SessionId) -> bool {
        match self.ended.lock() {
            Ok(ended) => ended.get(id).is_some_and(|until| *until > Utc::now()),
            // Fail closed.
            Err(_) => true,
        }
    }

    /// Forget ended sessions whose cookies can no longer be valid.
    pub fn evict_expired(&self) -> usize {
        let Ok(mut ended) = self.ended.lock() else {
            return 0;
        };
        let now = Utc::now();
        let before = ended.len();
        ended.retain(|_, until| *until > now);
        let evicted = before - ended.len();
        if evicted > 0 {
            debug!(evicted, "Ended sessions forgotten");
        }
        evicted
    }

    pub fn ended_count(&self) -> usize {
        self.ended.lock().map(|e| e.len()).unwrap_or(0)
    }
}

impl Default for SessionGuard {
    fn default() -> Self {
        Self::new(86400) // 24 hours
    }
}
