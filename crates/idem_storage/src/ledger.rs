#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use idem_kernel_contracts::envelope::ResponseEnvelope;
use idem_kernel_contracts::idempotency::{
    ClaimAttempt, ClaimRecord, ClaimStatus, ClaimToken, ScopedKey,
};
use idem_kernel_contracts::{ContractViolation, MonotonicTimeNs, Validate};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LedgerError {
    #[error("durable ledger unavailable: {reason}")]
    Unavailable { reason: String },
    /// The caller's claim token no longer owns a Pending record for this key.
    #[error("claim lost for {key}")]
    ClaimLost { key: String },
    #[error("durable ledger returned a corrupt record: {reason}")]
    Corrupt { reason: String },
    #[error(transparent)]
    ContractViolation(#[from] ContractViolation),
}

/// Result of an atomic insert-if-absent. A conflict is ordinary control flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed(ClaimRecord),
    Conflict(ClaimRecord),
}

/// Durable system of record for idempotency claims.
///
/// `claim` and `supersede` are the only ways to become the executor for a key,
/// and both must be atomic with respect to every other call on the same key.
pub trait DurableLedger: Send + Sync {
    /// Inserts a Pending record unless a live one exists. Failed tombstones and
    /// expired records count as absent.
    fn claim(&self, attempt: &ClaimAttempt) -> Result<ClaimOutcome, LedgerError>;

    /// Replaces `stale` only if the stored record still carries its claim token
    /// and is not Committed.
    fn supersede(
        &self,
        stale: &ClaimRecord,
        attempt: &ClaimAttempt,
    ) -> Result<ClaimOutcome, LedgerError>;

    fn commit(
        &self,
        key: &ScopedKey,
        token: &ClaimToken,
        envelope: &ResponseEnvelope,
        now: MonotonicTimeNs,
        expires_at: MonotonicTimeNs,
    ) -> Result<ClaimRecord, LedgerError>;

    /// Marks the caller's Pending record Failed. Returns false when the token no
    /// longer owns the record.
    fn abandon(
        &self,
        key: &ScopedKey,
        token: &ClaimToken,
        now: MonotonicTimeNs,
    ) -> Result<bool, LedgerError>;

    fn read(&self, key: &ScopedKey) -> Result<Option<ClaimRecord>, LedgerError>;

    fn read_expired(
        &self,
        now: MonotonicTimeNs,
        limit: usize,
    ) -> Result<Vec<ClaimRecord>, LedgerError>;

    /// Deletes the record only if it is still expired at `now`.
    fn delete_expired(&self, key: &ScopedKey, now: MonotonicTimeNs)
        -> Result<bool, LedgerError>;
}

impl<T: DurableLedger + ?Sized> DurableLedger for Arc<T> {
    fn claim(&self, attempt: &ClaimAttempt) -> Result<ClaimOutcome, LedgerError> {
        (**self).claim(attempt)
    }

    fn supersede(
        &self,
        stale: &ClaimRecord,
        attempt: &ClaimAttempt,
    ) -> Result<ClaimOutcome, LedgerError> {
        (**self).supersede(stale, attempt)
    }

    fn commit(
        &self,
        key: &ScopedKey,
        token: &ClaimToken,
        envelope: &ResponseEnvelope,
        now: MonotonicTimeNs,
        expires_at: MonotonicTimeNs,
    ) -> Result<ClaimRecord, LedgerError> {
        (**self).commit(key, token, envelope, now, expires_at)
    }

    fn abandon(
        &self,
        key: &ScopedKey,
        token: &ClaimToken,
        now: MonotonicTimeNs,
    ) -> Result<bool, LedgerError> {
        (**self).abandon(key, token, now)
    }

    fn read(&self, key: &ScopedKey) -> Result<Option<ClaimRecord>, LedgerError> {
        (**self).read(key)
    }

    fn read_expired(
        &self,
        now: MonotonicTimeNs,
        limit: usize,
    ) -> Result<Vec<ClaimRecord>, LedgerError> {
        (**self).read_expired(now, limit)
    }

    fn delete_expired(
        &self,
        key: &ScopedKey,
        now: MonotonicTimeNs,
    ) -> Result<bool, LedgerError> {
        (**self).delete_expired(key, now)
    }
}

/// Process-local ledger. A single mutex gives every operation the atomicity a
/// unique constraint gives a database.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    records: Mutex<BTreeMap<ScopedKey, ClaimRecord>>,
    unavailable: AtomicBool,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates an outage: every call fails with `Unavailable` while false.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<ScopedKey, ClaimRecord>>, LedgerError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(LedgerError::Unavailable {
                reason: "in-memory ledger switched off".to_string(),
            });
        }
        self.records.lock().map_err(|_| LedgerError::Unavailable {
            reason: "in-memory ledger lock poisoned".to_string(),
        })
    }
}

fn claimable(existing: &ClaimRecord, now: MonotonicTimeNs) -> bool {
    existing.status == ClaimStatus::Failed || existing.is_expired(now)
}

impl DurableLedger for InMemoryLedger {
    fn claim(&self, attempt: &ClaimAttempt) -> Result<ClaimOutcome, LedgerError> {
        attempt.validate()?;
        let mut records = self.lock()?;
        let record = match records.get(&attempt.key) {
            Some(existing)
                if existing.status == ClaimStatus::Failed && !existing.is_expired(attempt.now) =>
            {
                existing.superseding_v1(attempt)?
            }
            Some(existing) if !claimable(existing, attempt.now) => {
                return Ok(ClaimOutcome::Conflict(existing.clone()));
            }
            _ => ClaimRecord::pending_v1(attempt)?,
        };
        records.insert(attempt.key.clone(), record.clone());
        Ok(ClaimOutcome::Claimed(record))
    }

    fn supersede(
        &self,
        stale: &ClaimRecord,
        attempt: &ClaimAttempt,
    ) -> Result<ClaimOutcome, LedgerError> {
        attempt.validate()?;
        let mut records = self.lock()?;
        let record = match records.get(&attempt.key) {
            None => ClaimRecord::pending_v1(attempt)?,
            Some(existing) if existing.is_expired(attempt.now) => {
                ClaimRecord::pending_v1(attempt)?
            }
            Some(existing)
                if existing.claim_token == stale.claim_token
                    && existing.status != ClaimStatus::Committed =>
            {
                existing.superseding_v1(attempt)?
            }
            Some(existing) => return Ok(ClaimOutcome::Conflict(existing.clone())),
        };
        records.insert(attempt.key.clone(), record.clone());
        Ok(ClaimOutcome::Claimed(record))
    }

    fn commit(
        &self,
        key: &ScopedKey,
        token: &ClaimToken,
        envelope: &ResponseEnvelope,
        now: MonotonicTimeNs,
        expires_at: MonotonicTimeNs,
    ) -> Result<ClaimRecord, LedgerError> {
        let mut records = self.lock()?;
        let committed = match records.get(key) {
            Some(r) if r.claim_token == *token && r.status == ClaimStatus::Pending => {
                r.committed(envelope.clone(), now, expires_at)?
            }
            _ => {
                return Err(LedgerError::ClaimLost {
                    key: key.cache_key(),
                })
            }
        };
        records.insert(key.clone(), committed.clone());
        Ok(committed)
    }

    fn abandon(
        &self,
        key: &ScopedKey,
        token: &ClaimToken,
        _now: MonotonicTimeNs,
    ) -> Result<bool, LedgerError> {
        let mut records = self.lock()?;
        let failed = match records.get(key) {
            Some(r) if r.claim_token == *token && r.status == ClaimStatus::Pending => r.failed()?,
            _ => return Ok(false),
        };
        records.insert(key.clone(), failed);
        Ok(true)
    }

    fn read(&self, key: &ScopedKey) -> Result<Option<ClaimRecord>, LedgerError> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn read_expired(
        &self,
        now: MonotonicTimeNs,
        limit: usize,
    ) -> Result<Vec<ClaimRecord>, LedgerError> {
        let records = self.lock()?;
        let mut expired: Vec<ClaimRecord> = records
            .values()
            .filter(|r| r.is_expired(now))
            .cloned()
            .collect();
        expired.sort_by_key(|r| r.expires_at);
        expired.truncate(limit);
        Ok(expired)
    }

    fn delete_expired(
        &self,
        key: &ScopedKey,
        now: MonotonicTimeNs,
    ) -> Result<bool, LedgerError> {
        let mut records = self.lock()?;
        match records.get(key) {
            Some(r) if r.is_expired(now) => {
                records.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
