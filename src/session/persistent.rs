//! Token store backed by the redb embedded database.
//!
//! Provides persistent storage for session token records with:
//! - In-memory cache for hot sessions
//! - TTL-based expiry refreshed on every save

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;
use tracing::{debug, warn};

use super::store::TokenStore;
use super::types::{SessionId, TokenRecord};

/// redb table for token records (key: session_id hex, value: MessagePack bytes).
const TOKENS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("oidc_tokens");

/// Stored value: the record plus its store-level expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRecord {
    record: TokenRecord,
    expires_at: DateTime<Utc>,
}

impl StoredRecord {
    fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// Token store with in-memory cache and persistent storage.
pub struct RedbTokenStore {
    /// redb database handle.
    db: Database,

    /// In-memory cache for frequently accessed sessions.
    cache: RwLock<HashMap<SessionId, StoredRecord>>,

    /// Entry TTL in seconds.
    ttl_secs: u64,

    /// Maximum number of records to keep in cache.
    max_cache_size: usize,
}

impl RedbTokenStore {
    /// Open or create a token store at the given path.
    pub fn open(path: PathBuf, ttl_secs: u64) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }

        let db = Database::create(&path)
            .with_context(|| format!("Failed to open token database: {:?}", path))?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(TOKENS_TABLE)?;
        }
        write_txn.commit()?;

        let cache = Self::load_active_records(&db)?;
        debug!(sessions = cache.len(), "Loaded active token records into cache");

        Ok(Self {
            db,
            cache: RwLock::new(cache),
            ttl_secs,
            max_cache_size: 10000,
        })
    }

    fn persist(&self, id: &SessionId, stored: &StoredRecord) -> Result<()> {
        let data = rmp_serde::to_vec_named(stored).context("Failed to serialize token record")?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(TOKENS_TABLE)?;
            table.insert(id.to_hex().as_str(), data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn load_active_records(db: &Database) -> Result<HashMap<SessionId, StoredRecord>> {
        let mut records = HashMap::new();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(TOKENS_TABLE)?;

        for entry in table.iter()? {
            let (key, value) = entry?;
            let Some(id) = SessionId::from_hex(key.value()) else {
                continue;
            };
            match rmp_serde::from_slice::<StoredRecord>(value.value()) {
                Ok(stored) if !stored.is_expired() => {
                    records.insert(id, stored);
                }
                _ => {}
            }
        }

        Ok(records)
    }

    /// Evict the record closest to expiry from the cache.
    fn evict_cache_entry(cache: &mut HashMap<SessionId, StoredRecord>) {
        if let Some(oldest_id) = cache
            .iter()
            .min_by_key(|(_, s)| s.expires_at)
            .map(|(id, _)| *id)
        {
            cache.remove(&oldest_id);
        }
    }
}

impl TokenStore for RedbTokenStore {
    fn load(&self, id: &SessionId) -> Result<Option<TokenRecord>> {
        // The cache lock is held across the database read so a concurrent
        // delete cannot be undone by re-caching a stale row.
        let mut cache = self.cache.write().map_err(|_| anyhow!("Token cache lock poisoned"))?;
        if let Some(stored) = cache.get(id) {
            if stored.is_expired() {
                cache.remove(id);
                // Left in the database for the cleanup task.
                return Ok(None);
            }
            return Ok(Some(stored.record.clone()));
        }

        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TOKENS_TABLE)?;

        let key = id.to_hex();
        match table.get(key.as_str())? {
            Some(value) => {
                let stored: StoredRecord = rmp_serde::from_slice(value.value())
                    .context("Failed to deserialize token record")?;
                if stored.is_expired() {
                    return Ok(None);
                }

                let record = stored.record.clone();
                if cache.len() >= self.max_cache_size {
                    Self::evict_cache_entry(&mut cache);
                }
                cache.insert(*id, stored);
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    fn save(&self, id: &SessionId, record: &TokenRecord) -> Result<()> {
        let stored = StoredRecord {
            record: record.clone(),
            expires_at: Utc::now() + Duration::seconds(self.ttl_secs as i64),
        };

        let mut cache = self.cache.write().map_err(|_| anyhow!("Token cache lock poisoned"))?;

        // Database first so the cache never holds an unpersisted record.
        self.persist(id, &stored)?;

        if cache.len() >= self.max_cache_size && !cache.contains_key(id) {
            Self::evict_cache_entry(&mut cache);
        }
        cache.insert(*id, stored);
        Ok(())
    }

    fn delete(&self, id: &SessionId) -> Result<bool> {
        let mut cache = self.cache.write().map_err(|_| anyhow!("Token cache lock poisoned"))?;

        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(TOKENS_TABLE)?;
            let key = id.to_hex();
            let result = table.remove(key.as_str())?;
            result.is_some()
        };
        write_txn.commit()?;

        // Only after the commit, so no later read can find the row.
        cache.remove(id);

        Ok(removed)
    }

    fn evict_expired(&self) -> Result<usize> {
        if let Ok(mut cache) = self.cache.write() {
            cache.retain(|_, stored| !stored.is_expired());
        }

        let expired: Vec<String> = {
            let read_txn = self.db.begin_read()?;
            let table = read_txn.open_table(TOKENS_TABLE)?;

            let mut ids = Vec::new();
            for entry in table.iter()? {
                let (key, value) = entry?;
                match rmp_serde::from_slice::<StoredRecord>(value.value()) {
                    Ok(stored) if stored.is_expired() => {
                        ids.push(key.value().to_string());
                    }
                    Err(e) => {
                        warn!(key = key.value(), error = %e, "Failed to deserialize token record, marking for deletion");
                        ids.push(key.value().to_string());
                    }
                    _ => {}
                }
            }
            ids
        };

        if expired.is_empty() {
            return Ok(0);
        }

        let write_txn = self.db.begin_write()?;
        let mut evicted = 0;
        {
            let mut table = write_txn.open_table(TOKENS_TABLE)?;
            for id in &expired {
                if table.remove(id.as_str())?.is_some() {
                    evicted += 1;
                }
            }
        }
        write_txn.commit()?;

        Ok(evicted)
    }

    fn session_count(&self) -> Result<usize> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TOKENS_TABLE)?;
        Ok(table.len()? as usize)
    }
}
