#![forbid(unsafe_code)]

use idem_kernel_contracts::idempotency::{ClaimRecord, ClaimStatus, PayloadFingerprint};
use idem_kernel_contracts::policy::IdempotencyPolicy;
use idem_kernel_contracts::{MonotonicTimeNs, ReasonCodeId};

pub mod reason_codes {
    use idem_kernel_contracts::ReasonCodeId;

    // Idempotency claim reason-code namespace.
    pub const IDEM_OK_CLAIMED: ReasonCodeId = ReasonCodeId(0x4944_0001);
    pub const IDEM_OK_REPLAY_COMMITTED: ReasonCodeId = ReasonCodeId(0x4944_0002);
    pub const IDEM_OK_STALE_CLAIM_SUPERSEDED: ReasonCodeId = ReasonCodeId(0x4944_0003);
    pub const IDEM_OK_ABANDONED_CLAIM_RECLAIMED: ReasonCodeId = ReasonCodeId(0x4944_0004);
    pub const IDEM_OK_EXPIRED_RECORD_REPLACED: ReasonCodeId = ReasonCodeId(0x4944_0005);
    pub const IDEM_OK_BYPASSED_NO_KEY: ReasonCodeId = ReasonCodeId(0x4944_0006);
    pub const IDEM_OK_REPLAY_CACHED: ReasonCodeId = ReasonCodeId(0x4944_0007);

    pub const IDEM_PENDING_BUSY: ReasonCodeId = ReasonCodeId(0x4944_0010);
    pub const IDEM_PAYLOAD_MISMATCH: ReasonCodeId = ReasonCodeId(0x4944_0011);
    pub const IDEM_KEY_REQUIRED: ReasonCodeId = ReasonCodeId(0x4944_0012);
    pub const IDEM_KEY_INVALID: ReasonCodeId = ReasonCodeId(0x4944_0013);

    pub const IDEM_EXECUTOR_FAILED: ReasonCodeId = ReasonCodeId(0x4944_00E1);
    pub const IDEM_EXECUTOR_TIMED_OUT: ReasonCodeId = ReasonCodeId(0x4944_00E2);
    pub const IDEM_LEDGER_UNAVAILABLE: ReasonCodeId = ReasonCodeId(0x4944_00F1);
    pub const IDEM_CONFLICT_ROUNDS_EXHAUSTED: ReasonCodeId = ReasonCodeId(0x4944_00F2);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimPolicyConfig {
    pub pending_staleness_ms: u64,
    pub retry_after_ms: u64,
    pub verify_payload_fingerprint: bool,
}

impl ClaimPolicyConfig {
    pub fn mvp_v1() -> Self {
        Self::from_policy(&IdempotencyPolicy::messaging_v1())
    }

    pub fn from_policy(policy: &IdempotencyPolicy) -> Self {
        Self {
            pending_staleness_ms: policy.pending_staleness_ms,
            retry_after_ms: policy.retry_after_ms,
            verify_payload_fingerprint: policy.verify_payload_fingerprint,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictAction {
    ReplayCommitted,
    RejectPayloadMismatch,
    PendingBusy { retry_after_ms: u64 },
    SupersedeStale,
    ReclaimAbandoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConflictDecision {
    pub action: ConflictAction,
    pub reason_code: ReasonCodeId,
}

impl ConflictDecision {
    fn new(action: ConflictAction, reason_code: ReasonCodeId) -> Self {
        Self {
            action,
            reason_code,
        }
    }
}

/// Decides what a caller does after its claim ran into an existing record.
#[derive(Debug, Clone)]
pub struct ClaimPolicyRuntime {
    config: ClaimPolicyConfig,
}

impl ClaimPolicyRuntime {
    pub fn new(config: ClaimPolicyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> ClaimPolicyConfig {
        self.config
    }

    pub fn evaluate_conflict(
        &self,
        existing: &ClaimRecord,
        fingerprint: &PayloadFingerprint,
        now: MonotonicTimeNs,
    ) -> ConflictDecision {
        if existing.is_expired(now) {
            return ConflictDecision::new(
                ConflictAction::SupersedeStale,
                reason_codes::IDEM_OK_EXPIRED_RECORD_REPLACED,
            );
        }

        let fingerprint_match = !self.config.verify_payload_fingerprint
            || existing.payload_fingerprint == *fingerprint;

        match existing.status {
            ClaimStatus::Committed if fingerprint_match => ConflictDecision::new(
                ConflictAction::ReplayCommitted,
                reason_codes::IDEM_OK_REPLAY_COMMITTED,
            ),
            ClaimStatus::Committed => ConflictDecision::new(
                ConflictAction::RejectPayloadMismatch,
                reason_codes::IDEM_PAYLOAD_MISMATCH,
            ),
            ClaimStatus::Failed => ConflictDecision::new(
                ConflictAction::ReclaimAbandoned,
                reason_codes::IDEM_OK_ABANDONED_CLAIM_RECLAIMED,
            ),
            ClaimStatus::Pending => {
                // A stale claim yields to any payload; only a live one can reject a mismatch.
                let age_ms = existing.pending_age_ms(now);
                if age_ms >= self.config.pending_staleness_ms {
                    return ConflictDecision::new(
                        ConflictAction::SupersedeStale,
                        reason_codes::IDEM_OK_STALE_CLAIM_SUPERSEDED,
                    );
                }
                if !fingerprint_match {
                    return ConflictDecision::new(
                        ConflictAction::RejectPayloadMismatch,
                        reason_codes::IDEM_PAYLOAD_MISMATCH,
                    );
                }
                // Never ask the caller to wait past the point the claim turns stale.
                let until_stale_ms = self.config.pending_staleness_ms - age_ms;
                ConflictDecision::new(
                    ConflictAction::PendingBusy {
                        retry_after_ms: self.config.retry_after_ms.min(until_stale_ms).max(1),
                    },
                    reason_codes::IDEM_PENDING_BUSY,
                )
            }
        }
    }
}
