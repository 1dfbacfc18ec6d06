//! Token store interface and the in-memory backing.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::debug;

use super::types::{SessionId, TokenRecord};

/// Persistence for session token records.
///
/// `save` must be atomic per session: a concurrent `load` observes either the
/// previous record or the new one, never a mix.
pub trait TokenStore: Send + Sync {
    /// Load the record for a session, `None` if absent or expired.
    fn load(&self, id: &SessionId) -> Result<Option<TokenRecord>>;

    /// Insert or replace the record for a session.
    fn save(&self, id: &SessionId, record: &TokenRecord) -> Result<()>;

    /// Delete a session's record. Returns whether one existed.
    fn delete(&self, id: &SessionId) -> Result<bool>;

    /// Drop expired entries. Returns the number removed.
    fn evict_expired(&self) -> Result<usize>;

    /// Number of stored sessions.
    fn session_count(&self) -> Result<usize>;
}

struct Entry {
    record: TokenRecord,
    expires_at: DateTime<Utc>,
}

/// In-process token store. Entries live for `ttl_secs` after their last save.
pub struct MemoryTokenStore {
    entries: RwLock<HashMap<SessionId, Entry>>,
    ttl: Duration,
}

impl MemoryTokenStore {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl: Duration::seconds(ttl_secs as i64),
        }
    }
}

impl TokenStore for MemoryTokenStore {
    fn load(&self, id: &SessionId) -> Result<Option<TokenRecord>> {
        let entries = self.entries.read().map_err(|_| anyhow!("Token store lock poisoned"))?;
        Ok(entries
            .get(id)
            .filter(|entry| entry.expires_at > Utc::now())
            .map(|entry| entry.record.clone()))
    }

    fn save(&self, id: &SessionId, record: &TokenRecord) -> Result<()> {
        let mut entries = self.entries.write().map_err(|_| anyhow!("Token store lock poisoned"))?;
        entries.insert(
            *id,
            Entry {
                record: record.clone(),
                expires_at: Utc::now() + self.ttl,
            },
        );
        debug!(session_id = %id, "Token record saved");
        Ok(())
    }

    fn delete(&self, id: &SessionId) -> Result<bool> {
        let mut entries = self.entries.write().map_err(|_| anyhow!("Token store lock poisoned"))?;
        Ok(entries.remove(id).is_some())
    }

    fn evict_expired(&self) -> Result<usize> {
        let now = Utc::now();
        let mut entries = self.entries.write().map_err(|_| anyhow!("Token store lock poisoned"))?;
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        Ok(before - entries.len())
    }

    fn session_count(&self) -> Result<usize> {
        let entries = self.entries.read().map_err(|_| anyhow!("Token store lock poisoned"))?;
        Ok(entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(access_token: &str) -> TokenRecord {
        TokenRecord::issued(
            "id-token".to_string(),
            access_token.to_string(),
            Some("refresh".to_string()),
            Utc::now(),
            300,
            vec!["openid".to_string()],
        )
    }

    #[test]
    fn test_save_load_delete() {
        let store = MemoryTokenStore::new(3600);
        let id = SessionId::new();

        assert!(store.load(&id).unwrap().is_none());

        store.save(&id, &record("at-1")).unwrap();
        assert_eq!(store.load(&id).unwrap().unwrap().access_token, "at-1");

        store.save(&id, &record("at-2")).unwrap();
        assert_eq!(store.load(&id).unwrap().unwrap().access_token, "at-2");
        assert_eq!(store.session_count().unwrap(), 1);

        assert!(store.delete(&id).unwrap());
        assert!(!store.delete(&id).unwrap());
        assert!(store.load(&id).unwrap().is_none());
    }

    #[test]
    fn test_expired_entries_are_invisible_and_evicted() {
        let store = MemoryTokenStore::new(0);
        let id = SessionId::new();
        store.save(&id, &record("at-1")).unwrap();

        assert!(store.load(&id).unwrap().is_none());
        assert_eq!(store.evict_expired().unwrap(), 1);
        assert_eq!(store.session_count().unwrap(), 0);
    }
}
