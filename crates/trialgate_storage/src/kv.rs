#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::debug;
use trialgate_kernel_contracts::UnixTimeMs;

use crate::clock::{SystemTrialClock, TrialClock};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("kv store lock poisoned")]
    LockPoisoned,
    #[error("kv backend failure on {op} {key}: {reason}")]
    Backend {
        op: &'static str,
        key: String,
        reason: String,
    },
}

/// Durable key/value backend with per-key expiration.
///
/// Writes are last-write-wins per key; there is no cross-key transaction and no compare-and-swap.
#[async_trait]
pub trait TrialKvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Stores `value` under `key`. A `ttl_secs` of zero keeps the entry until overwritten.
    async fn put(&self, key: &str, value: String, ttl_secs: u64) -> Result<(), StorageError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct KvEntry {
    value: String,
    expires_at: Option<UnixTimeMs>,
}

impl KvEntry {
    fn is_live(&self, now: UnixTimeMs) -> bool {
        match self.expires_at {
            Some(expires_at) => now < expires_at,
            None => true,
        }
    }
}

/// Process-local store used for single-node deployments and tests.
pub struct InMemoryKvStore {
    entries: Mutex<BTreeMap<String, KvEntry>>,
    clock: Arc<dyn TrialClock>,
}

impl InMemoryKvStore {
    pub fn new_in_memory() -> Self {
        Self::with_clock(Arc::new(SystemTrialClock))
    }

    pub fn with_clock(clock: Arc<dyn TrialClock>) -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            clock,
        }
    }

    /// Number of live (unexpired) entries.
    pub fn live_len(&self) -> Result<usize, StorageError> {
        let now = self.clock.now_ms();
        let entries = self.entries.lock().map_err(|_| StorageError::LockPoisoned)?;
        Ok(entries.values().filter(|e| e.is_live(now)).count())
    }

    pub fn expires_at(&self, key: &str) -> Result<Option<UnixTimeMs>, StorageError> {
        let entries = self.entries.lock().map_err(|_| StorageError::LockPoisoned)?;
        Ok(entries.get(key).and_then(|e| e.expires_at))
    }

    /// Drops expired entries and returns how many were removed.
    pub fn purge_expired(&self) -> Result<usize, StorageError> {
        let now = self.clock.now_ms();
        let mut entries = self.entries.lock().map_err(|_| StorageError::LockPoisoned)?;
        let before = entries.len();
        entries.retain(|_, e| e.is_live(now));
        let purged = before - entries.len();
        if purged > 0 {
            debug!(purged, "purged expired kv entries");
        }
        Ok(purged)
    }
}

impl Default for InMemoryKvStore {
    fn default() -> Self {
        Self::new_in_memory()
    }
}

#[async_trait]
impl TrialKvStore for InMemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let now = self.clock.now_ms();
        let mut entries = self.entries.lock().map_err(|_| StorageError::LockPoisoned)?;
        let value = match entries.get(key) {
            Some(entry) if entry.is_live(now) => Some(entry.value.clone()),
            Some(_) => None,
            None => return Ok(None),
        };
        if value.is_none() {
            entries.remove(key);
        }
        Ok(value)
    }

    async fn put(&self, key: &str, value: String, ttl_secs: u64) -> Result<(), StorageError> {
        let now = self.clock.now_ms();
        let expires_at = (ttl_secs > 0)
            .then(|| UnixTimeMs(now.0.saturating_add(ttl_secs.saturating_mul(1_000))));
        let mut entries = self.entries.lock().map_err(|_| StorageError::LockPoisoned)?;
        entries.insert(key.to_string(), KvEntry { value, expires_at });
        Ok(())
    }
}
