//! Logins awaiting their callback, and redeemed authorization codes.

use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::warn;

/// Per-login secrets kept between the authorization redirect and the callback.
#[derive(Clone)]
pub struct PendingAuth {
    pub state: String,
    pub code_verifier: String,
    pub nonce: String,
    /// Local path the user returns to after sign-in.
    pub return_url: String,
    pub created_at: DateTime<Utc>,
}

impl std::fmt::Debug for PendingAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingAuth")
            .field("return_url", &self.return_url)
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// Pending logins keyed by `state`. Each entry can be taken once.
pub struct PendingAuthStore {
    entries: Mutex<HashMap<String, PendingAuth>>,
    ttl: Duration,
    max_entries: usize,
}

impl PendingAuthStore {
    pub fn new(ttl_secs: u64, max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl: Duration::seconds(ttl_secs as i64),
            max_entries,
        }
    }

    /// Store a pending login. At capacity, expired entries are dropped
    /// first, then the oldest one.
    pub fn insert(&self, pending: PendingAuth) {
        let Ok(mut entries) = self.entries.lock() else {
            warn!("Pending login table lock poisoned");
            return;
        };

        if entries.len() >= self.max_entries {
            let cutoff = Utc::now() - self.ttl;
            entries.retain(|_, p| p.created_at > cutoff);
        }
        if entries.len() >= self.max_entries {
            if let Some(oldest) = entries
                .values()
                .min_by_key(|p| p.created_at)
                .map(|p| p.state.clone())
            {
                entries.remove(&oldest);
            }
        }

        entries.insert(pending.state.clone(), pending);
    }

    /// Remove and return the login for `state` if it has not expired.
    pub fn take(&self, state: &str) -> Option<PendingAuth> {
        let pending = self.entries.lock().ok()?.remove(state)?;
        if pending.created_at + self.ttl < Utc::now() {
            return None;
        }
        Some(pending)
    }

    pub fn evict_expired(&self) -> usize {
        let cutoff = Utc::now() - self.ttl;
        match self.entries.lock() {
            Ok(mut entries) => {
                let before = entries.len();
                entries.retain(|_, p| p.created_at >= cutoff);
                before - entries.len()
            }
            Err(_) => 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Hashes of authorization codes already sent to the token endpoint.
pub struct RedeemedCodes {
    codes: Mutex<HashMap<String, DateTime<Utc>>>,
    ttl: Duration,
}

impl RedeemedCodes {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            codes: Mutex::new(HashMap::new()),
            ttl: Duration::seconds(ttl_secs as i64),
        }
    }

    /// Record `code` as redeemed. Returns false if it was seen before.
    pub fn mark_redeemed(&self, code: &str) -> bool {
        let key = hex::encode(Sha256::digest(code.as_bytes()));
        let Ok(mut codes) = self.codes.lock() else {
            return false;
        };
        if codes.contains_key(&key) {
            return false;
        }
        codes.insert(key, Utc::now());
        true
    }

    pub fn evict_expired(&self) -> usize {
        let cutoff = Utc::now() - self.ttl;
        match self.codes.lock() {
            Ok(mut codes) => {
                let before = codes.len();
                codes.retain(|_, seen| *seen >= cutoff);
                before - codes.len()
            }
            Err(_) => 0,
        }
    }
}
