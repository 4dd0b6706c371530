#![forbid(unsafe_code)]

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use idem_kernel_contracts::{ContractViolation, MonotonicTimeNs, Validate};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyStoreError {
    #[error("key store unavailable: {reason}")]
    Unavailable { reason: String },
    #[error(transparent)]
    ContractViolation(#[from] ContractViolation),
}

/// Cache entry schema: `{key, value, ttl}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: String,
    pub value: Vec<u8>,
    pub ttl_ms: u64,
}

impl CacheEntry {
    pub fn v1(key: String, value: Vec<u8>, ttl_ms: u64) -> Result<Self, ContractViolation> {
        let e = Self { key, value, ttl_ms };
        e.validate()?;
        Ok(e)
    }
}

impl Validate for CacheEntry {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.key.trim().is_empty() || self.key.len() > 256 {
            return Err(ContractViolation::InvalidValue {
                field: "cache_entry.key",
                reason: "must be non-empty and <= 256 chars",
            });
        }
        if self.ttl_ms == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "cache_entry.ttl_ms",
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}

/// Fast volatile store in front of the ledger. Best effort only: single-key
/// operations, last write wins, loss is tolerated.
pub trait KeyStore: Send + Sync {
    fn get(&self, key: &str, now: MonotonicTimeNs) -> Result<Option<Vec<u8>>, KeyStoreError>;
    fn set_with_expiry(&self, entry: CacheEntry, now: MonotonicTimeNs)
        -> Result<(), KeyStoreError>;
}

impl<T: KeyStore + ?Sized> KeyStore for Arc<T> {
    fn get(&self, key: &str, now: MonotonicTimeNs) -> Result<Option<Vec<u8>>, KeyStoreError> {
        (**self).get(key, now)
    }

    fn set_with_expiry(
        &self,
        entry: CacheEntry,
        now: MonotonicTimeNs,
    ) -> Result<(), KeyStoreError> {
        (**self).set_with_expiry(entry, now)
    }
}

#[derive(Debug, Clone)]
struct StoredEntry {
    value: Vec<u8>,
    expires_at: MonotonicTimeNs,
}

/// Entries plus an index ordered by expiry, so eviction never scans the map.
#[derive(Debug, Default)]
struct Entries {
    by_key: HashMap<String, StoredEntry>,
    by_expiry: BTreeSet<(u64, String)>,
}

impl Entries {
    fn remove(&mut self, key: &str) -> Option<StoredEntry> {
        let removed = self.by_key.remove(key)?;
        self.by_expiry.remove(&(removed.expires_at.0, key.to_string()));
        Some(removed)
    }

    /// Drops the entry closest to expiry; an already expired one sorts first.
    fn evict_one(&mut self, now: MonotonicTimeNs) {
        if let Some((expires_at_ns, victim)) = self.by_expiry.pop_first() {
            self.by_key.remove(&victim);
            tracing::debug!(
                key = victim.as_str(),
                expired = expires_at_ns <= now.0,
                "key store full; evicted entry"
            );
        }
    }
}

#[derive(Debug)]
pub struct InMemoryKeyStore {
    entries: Mutex<Entries>,
    max_entries: usize,
}

impl InMemoryKeyStore {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(Entries::default()),
            max_entries: max_entries.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.by_key.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, Entries>, KeyStoreError> {
        self.entries.lock().map_err(|_| KeyStoreError::Unavailable {
            reason: "in-memory key store lock poisoned".to_string(),
        })
    }
}

impl KeyStore for InMemoryKeyStore {
    fn get(&self, key: &str, now: MonotonicTimeNs) -> Result<Option<Vec<u8>>, KeyStoreError> {
        let mut entries = self.lock()?;
        let live = match entries.by_key.get(key) {
            Some(e) if e.expires_at > now => Some(e.value.clone()),
            Some(_) => None,
            None => return Ok(None),
        };
        if live.is_none() {
            entries.remove(key);
        }
        Ok(live)
    }

    fn set_with_expiry(
        &self,
        entry: CacheEntry,
        now: MonotonicTimeNs,
    ) -> Result<(), KeyStoreError> {
        entry.validate()?;
        let mut entries = self.lock()?;
        if entries.remove(&entry.key).is_none() && entries.by_key.len() >= self.max_entries {
            entries.evict_one(now);
        }
        let expires_at = now.saturating_add_ms(entry.ttl_ms);
        entries.by_expiry.insert((expires_at.0, entry.key.clone()));
        entries.by_key.insert(
            entry.key,
            StoredEntry {
                value: entry.value,
                expires_at,
            },
        );
        Ok(())
    }
}

/// Key store used when caching is switched off: every lookup misses.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullKeyStore;

impl KeyStore for NullKeyStore {
    fn get(&self, _key: &str, _now: MonotonicTimeNs) -> Result<Option<Vec<u8>>, KeyStoreError> {
        Ok(None)
    }

    fn set_with_expiry(
        &self,
        _entry: CacheEntry,
        _now: MonotonicTimeNs,
    ) -> Result<(), KeyStoreError> {
        Ok(())
    }
}
