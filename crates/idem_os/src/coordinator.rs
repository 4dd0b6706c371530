#![forbid(unsafe_code)]

//! Idempotency coordinator: lookup, execute once, persist, cache.
//!
//! The key store is consulted first and never trusted for correctness. The
//! durable ledger's atomic claim decides who executes; every other caller for
//! the same key either replays the committed envelope or is told to retry.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use idem_engines::claim_policy::{
    reason_codes, ClaimPolicyConfig, ClaimPolicyRuntime, ConflictAction,
};
use idem_engines::fingerprint::payload_fingerprint;
use idem_engines::ids::fresh_claim_token;
use idem_kernel_contracts::envelope::{CachedReplay, ResponseEnvelope};
use idem_kernel_contracts::idempotency::{
    ClaimAttempt, ClaimRecord, ClaimStatus, ClaimToken, EndpointId, IdempotencyKey,
    PayloadFingerprint, ScopedKey,
};
use idem_kernel_contracts::policy::IdempotencyPolicy;
use idem_kernel_contracts::{ContractViolation, ReasonCodeId, Validate};
use idem_storage::{CacheEntry, ClaimOutcome, DurableLedger, KeyStore, LedgerError};

use crate::clock::Clock;
use crate::executor::{run_with_timeout, ExecutorError, WriteExecutor};

/// Upper bound on supersede / re-claim transitions within one call.
pub const MAX_CONFLICT_ROUNDS: u32 = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotentWriteRequest {
    pub endpoint_id: EndpointId,
    pub idempotency_key: Option<String>,
    pub payload: Vec<u8>,
}

impl IdempotentWriteRequest {
    pub fn v1(endpoint_id: EndpointId, idempotency_key: Option<String>, payload: Vec<u8>) -> Self {
        Self {
            endpoint_id,
            idempotency_key,
            payload,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaySource {
    KeyStore,
    Ledger,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// No key supplied and keys are optional: executed without deduplication.
    Bypassed,
    Executed,
    /// Executed after replacing a stale Pending claim or a Failed tombstone.
    Recovered { superseded_attempt: u32 },
    Replayed(ReplaySource),
}

impl Disposition {
    pub fn is_replay(self) -> bool {
        matches!(self, Disposition::Replayed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecuteOutcome {
    pub envelope: ResponseEnvelope,
    pub disposition: Disposition,
    pub reason_code: ReasonCodeId,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum IdempotencyError {
    #[error("an idempotency key is required for this endpoint")]
    KeyRequired,
    #[error("invalid idempotency key: {0}")]
    InvalidKey(ContractViolation),
    #[error("idempotency key was already used with a different payload")]
    PayloadMismatch,
    #[error("a request with this idempotency key is in flight; retry after {retry_after_ms}ms")]
    PendingBusy { retry_after_ms: u64 },
    #[error(transparent)]
    ExecutorFailure(ExecutorError),
    #[error(transparent)]
    LedgerUnavailable(LedgerError),
}

impl IdempotencyError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IdempotencyError::PendingBusy { .. } | IdempotencyError::LedgerUnavailable(_)
        )
    }

    pub fn reason_code(&self) -> ReasonCodeId {
        match self {
            IdempotencyError::KeyRequired => reason_codes::IDEM_KEY_REQUIRED,
            IdempotencyError::InvalidKey(_) => reason_codes::IDEM_KEY_INVALID,
            IdempotencyError::PayloadMismatch => reason_codes::IDEM_PAYLOAD_MISMATCH,
            IdempotencyError::PendingBusy { .. } => reason_codes::IDEM_PENDING_BUSY,
            IdempotencyError::ExecutorFailure(ExecutorError::TimedOut { .. }) => {
                reason_codes::IDEM_EXECUTOR_TIMED_OUT
            }
            IdempotencyError::ExecutorFailure(_) => reason_codes::IDEM_EXECUTOR_FAILED,
            IdempotencyError::LedgerUnavailable(_) => reason_codes::IDEM_LEDGER_UNAVAILABLE,
        }
    }
}

impl From<LedgerError> for IdempotencyError {
    fn from(err: LedgerError) -> Self {
        IdempotencyError::LedgerUnavailable(err)
    }
}

impl From<ContractViolation> for IdempotencyError {
    fn from(violation: ContractViolation) -> Self {
        IdempotencyError::LedgerUnavailable(LedgerError::ContractViolation(violation))
    }
}

pub struct IdempotencyCoordinator<K, L, C>
where
    K: KeyStore,
    L: DurableLedger,
    C: Clock,
{
    policy: IdempotencyPolicy,
    key_store: K,
    ledger: L,
    clock: C,
    claim_policy: ClaimPolicyRuntime,
}

impl<K, L, C> IdempotencyCoordinator<K, L, C>
where
    K: KeyStore,
    L: DurableLedger,
    C: Clock,
{
    pub fn new(
        policy: IdempotencyPolicy,
        key_store: K,
        ledger: L,
        clock: C,
    ) -> Result<Self, ContractViolation> {
        policy.validate()?;
        Ok(Self {
            policy,
            key_store,
            ledger,
            clock,
            claim_policy: ClaimPolicyRuntime::new(ClaimPolicyConfig::from_policy(&policy)),
        })
    }

    pub fn policy(&self) -> &IdempotencyPolicy {
        &self.policy
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    pub fn execute<E>(
        &self,
        request: IdempotentWriteRequest,
        executor: Arc<E>,
    ) -> Result<ExecuteOutcome, IdempotencyError>
    where
        E: WriteExecutor + ?Sized,
    {
        let raw_key = request
            .idempotency_key
            .clone()
            .filter(|k| !k.trim().is_empty());
        let key = match raw_key {
            None if self.policy.key_required => return Err(IdempotencyError::KeyRequired),
            None => return self.bypass(request, executor),
            Some(k) => IdempotencyKey::new(k).map_err(IdempotencyError::InvalidKey)?,
        };
        let key = ScopedKey::new(request.endpoint_id.clone(), key);
        let fingerprint = payload_fingerprint(&request.endpoint_id, &request.payload)?;

        if let Some(replay) = self.lookup_key_store(&key, &fingerprint)? {
            return Ok(replay);
        }

        let token = fresh_claim_token()?;
        let wait_until = Instant::now() + Duration::from_millis(self.policy.pending_wait_ms);
        let mut rounds = 0u32;
        let mut outcome = self.ledger.claim(&self.attempt(&key, &token, &fingerprint)?)?;
        let mut claim_reason = reason_codes::IDEM_OK_CLAIMED;

        loop {
            let existing = match outcome {
                ClaimOutcome::Claimed(record) => {
                    return self.run_claimed(
                        record,
                        &fingerprint,
                        request.payload,
                        executor,
                        claim_reason,
                    )
                }
                ClaimOutcome::Conflict(existing) => existing,
            };

            let decision =
                self.claim_policy
                    .evaluate_conflict(&existing, &fingerprint, self.clock.now());
            match decision.action {
                ConflictAction::ReplayCommitted => {
                    return self.replay_from_ledger(&existing, &fingerprint, decision.reason_code)
                }
                ConflictAction::RejectPayloadMismatch => {
                    tracing::info!(
                        endpoint = key.endpoint_id.as_str(),
                        key = key.idempotency_key.as_str(),
                        reason_code = decision.reason_code.0,
                        "idempotency key reused with a different payload"
                    );
                    return Err(IdempotencyError::PayloadMismatch);
                }
                ConflictAction::PendingBusy { retry_after_ms } => {
                    let now = Instant::now();
                    if now >= wait_until {
                        tracing::debug!(
                            endpoint = key.endpoint_id.as_str(),
                            key = key.idempotency_key.as_str(),
                            attempt = existing.attempt,
                            retry_after_ms,
                            "claim in flight"
                        );
                        return Err(IdempotencyError::PendingBusy { retry_after_ms });
                    }
                    let step = Duration::from_millis(self.policy.pending_poll_interval_ms);
                    thread::sleep(step.min(wait_until - now));
                    outcome = self.ledger.claim(&self.attempt(&key, &token, &fingerprint)?)?;
                    claim_reason = reason_codes::IDEM_OK_CLAIMED;
                }
                ConflictAction::SupersedeStale | ConflictAction::ReclaimAbandoned => {
                    rounds += 1;
                    if rounds > MAX_CONFLICT_ROUNDS {
                        tracing::warn!(
                            endpoint = key.endpoint_id.as_str(),
                            key = key.idempotency_key.as_str(),
                            reason_code = reason_codes::IDEM_CONFLICT_ROUNDS_EXHAUSTED.0,
                            "gave up recovering a contended claim"
                        );
                        return Err(IdempotencyError::PendingBusy {
                            retry_after_ms: self.policy.retry_after_ms,
                        });
                    }
                    outcome = self
                        .ledger
                        .supersede(&existing, &self.attempt(&key, &token, &fingerprint)?)?;
                    claim_reason = decision.reason_code;
                }
            }
        }
    }

    fn attempt(
        &self,
        key: &ScopedKey,
        token: &ClaimToken,
        fingerprint: &PayloadFingerprint,
    ) -> Result<ClaimAttempt, ContractViolation> {
        ClaimAttempt::v1(
            key.clone(),
            token.clone(),
            fingerprint.clone(),
            self.clock.now(),
            self.policy.ttl_ms,
        )
    }

    fn bypass<E>(
        &self,
        request: IdempotentWriteRequest,
        executor: Arc<E>,
    ) -> Result<ExecuteOutcome, IdempotencyError>
    where
        E: WriteExecutor + ?Sized,
    {
        tracing::debug!(
            endpoint = request.endpoint_id.as_str(),
            "no idempotency key; executing without deduplication"
        );
        let envelope = run_with_timeout(executor, request.payload, self.execution_timeout())
            .map_err(IdempotencyError::ExecutorFailure)?;
        Ok(ExecuteOutcome {
            envelope,
            disposition: Disposition::Bypassed,
            reason_code: reason_codes::IDEM_OK_BYPASSED_NO_KEY,
        })
    }

    fn execution_timeout(&self) -> Duration {
        Duration::from_millis(self.policy.execution_timeout_ms)
    }

    fn run_claimed<E>(
        &self,
        record: ClaimRecord,
        fingerprint: &PayloadFingerprint,
        payload: Vec<u8>,
        executor: Arc<E>,
        claim_reason: ReasonCodeId,
    ) -> Result<ExecuteOutcome, IdempotencyError>
    where
        E: WriteExecutor + ?Sized,
    {
        let (disposition, reason_code) = if record.attempt > 1 {
            let reason = if claim_reason == reason_codes::IDEM_OK_CLAIMED {
                reason_codes::IDEM_OK_ABANDONED_CLAIM_RECLAIMED
            } else {
                claim_reason
            };
            tracing::info!(
                endpoint = record.key.endpoint_id.as_str(),
                key = record.key.idempotency_key.as_str(),
                attempt = record.attempt,
                reason_code = reason.0,
                "recovered abandoned claim"
            );
            (
                Disposition::Recovered {
                    superseded_attempt: record.attempt - 1,
                },
                reason,
            )
        } else {
            (Disposition::Executed, claim_reason)
        };

        let result = run_with_timeout(executor, payload, self.execution_timeout()).and_then(
            |envelope| {
                if envelope.is_committable() {
                    Ok(envelope)
                } else {
                    Err(ExecutorError::Uncommittable {
                        status_code: envelope.status_code,
                    })
                }
            },
        );
        let envelope = match result {
            Ok(envelope) => envelope,
            Err(err) => {
                self.abandon(&record);
                tracing::warn!(
                    endpoint = record.key.endpoint_id.as_str(),
                    key = record.key.idempotency_key.as_str(),
                    attempt = record.attempt,
                    error = %err,
                    "write executor failed; claim abandoned"
                );
                return Err(IdempotencyError::ExecutorFailure(err));
            }
        };

        let now = self.clock.now();
        let expires_at = now.saturating_add_ms(self.policy.ttl_ms);
        match self
            .ledger
            .commit(&record.key, &record.claim_token, &envelope, now, expires_at)
        {
            Ok(committed) => {
                self.populate_key_store(&committed);
                Ok(ExecuteOutcome {
                    envelope,
                    disposition,
                    reason_code,
                })
            }
            Err(LedgerError::ClaimLost { .. }) => {
                tracing::warn!(
                    endpoint = record.key.endpoint_id.as_str(),
                    key = record.key.idempotency_key.as_str(),
                    attempt = record.attempt,
                    "claim superseded while executing; result discarded"
                );
                self.resolve_lost_commit(&record.key, fingerprint)
            }
            Err(err) => {
                tracing::error!(
                    endpoint = record.key.endpoint_id.as_str(),
                    key = record.key.idempotency_key.as_str(),
                    error = %err,
                    "commit failed after execution"
                );
                self.abandon(&record);
                Err(IdempotencyError::LedgerUnavailable(err))
            }
        }
    }

    fn abandon(&self, record: &ClaimRecord) {
        match self
            .ledger
            .abandon(&record.key, &record.claim_token, self.clock.now())
        {
            Ok(true) => {}
            Ok(false) => tracing::debug!(
                endpoint = record.key.endpoint_id.as_str(),
                key = record.key.idempotency_key.as_str(),
                "claim already superseded; nothing to abandon"
            ),
            // The Pending record turns stale and is recovered by a later caller.
            Err(err) => tracing::warn!(
                endpoint = record.key.endpoint_id.as_str(),
                key = record.key.idempotency_key.as_str(),
                error = %err,
                "failed to abandon claim"
            ),
        }
    }

    fn resolve_lost_commit(
        &self,
        key: &ScopedKey,
        fingerprint: &PayloadFingerprint,
    ) -> Result<ExecuteOutcome, IdempotencyError> {
        match self.ledger.read(key)? {
            Some(current) if current.status == ClaimStatus::Committed => {
                let decision =
                    self.claim_policy
                        .evaluate_conflict(&current, fingerprint, self.clock.now());
                match decision.action {
                    ConflictAction::ReplayCommitted => {
                        self.replay_from_ledger(&current, fingerprint, decision.reason_code)
                    }
                    ConflictAction::RejectPayloadMismatch => Err(IdempotencyError::PayloadMismatch),
                    _ => Err(IdempotencyError::PendingBusy {
                        retry_after_ms: self.policy.retry_after_ms,
                    }),
                }
            }
            _ => Err(IdempotencyError::PendingBusy {
                retry_after_ms: self.policy.retry_after_ms,
            }),
        }
    }

    fn replay_from_ledger(
        &self,
        record: &ClaimRecord,
        fingerprint: &PayloadFingerprint,
        reason_code: ReasonCodeId,
    ) -> Result<ExecuteOutcome, IdempotencyError> {
        let envelope = record.response.clone().ok_or_else(|| LedgerError::Corrupt {
            reason: format!("committed record {} has no response", record.key),
        })?;
        self.populate_key_store(record);
        tracing::debug!(
            endpoint = record.key.endpoint_id.as_str(),
            key = record.key.idempotency_key.as_str(),
            fingerprint = fingerprint.as_str(),
            "replayed committed response from ledger"
        );
        Ok(ExecuteOutcome {
            envelope,
            disposition: Disposition::Replayed(ReplaySource::Ledger),
            reason_code,
        })
    }

    fn lookup_key_store(
        &self,
        key: &ScopedKey,
        fingerprint: &PayloadFingerprint,
    ) -> Result<Option<ExecuteOutcome>, IdempotencyError> {
        let bytes = match self.key_store.get(&key.cache_key(), self.clock.now()) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Ok(None),
            Err(err) => {
                tracing::warn!(
                    endpoint = key.endpoint_id.as_str(),
                    key = key.idempotency_key.as_str(),
                    error = %err,
                    "key store lookup failed; falling back to ledger"
                );
                return Ok(None);
            }
        };
        let cached = match CachedReplay::decode(&bytes) {
            Ok(cached) => cached,
            Err(err) => {
                tracing::warn!(
                    endpoint = key.endpoint_id.as_str(),
                    key = key.idempotency_key.as_str(),
                    error = %err,
                    "undecodable key store entry ignored"
                );
                return Ok(None);
            }
        };
        if self.policy.verify_payload_fingerprint && cached.payload_fingerprint != *fingerprint {
            return Err(IdempotencyError::PayloadMismatch);
        }
        Ok(Some(ExecuteOutcome {
            envelope: cached.envelope,
            disposition: Disposition::Replayed(ReplaySource::KeyStore),
            reason_code: reason_codes::IDEM_OK_REPLAY_CACHED,
        }))
    }

    fn populate_key_store(&self, record: &ClaimRecord) {
        let Some(envelope) = record.response.clone() else {
            return;
        };
        let now = self.clock.now();
        let ttl_ms = now.ms_until(record.expires_at);
        if ttl_ms == 0 {
            return;
        }
        let entry = CachedReplay::v1(record.payload_fingerprint.clone(), envelope)
            .and_then(|replay| CacheEntry::v1(record.key.cache_key(), replay.encode(), ttl_ms));
        let result = match entry {
            Ok(entry) => self.key_store.set_with_expiry(entry, now),
            Err(violation) => Err(violation.into()),
        };
        if let Err(err) = result {
            tracing::warn!(
                endpoint = record.key.endpoint_id.as_str(),
                key = record.key.idempotency_key.as_str(),
                error = %err,
                "key store populate failed"
            );
        }
    }
}
