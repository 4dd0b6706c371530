#![forbid(unsafe_code)]

use crate::common::validate_range;
use crate::idempotency::{MAX_RECORD_TTL_MS, MIN_RECORD_TTL_MS};
use crate::{ContractViolation, SchemaVersion, Validate};

pub const POLICY_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

pub const MAX_PENDING_WAIT_MS: u64 = 60_000;

/// Per-operation-class idempotency settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdempotencyPolicy {
    pub schema_version: SchemaVersion,
    /// Validity window of a committed record and its cache entry.
    pub ttl_ms: u64,
    /// A Pending claim older than this is treated as abandoned.
    pub pending_staleness_ms: u64,
    pub execution_timeout_ms: u64,
    /// How long a caller may wait on a concurrent in-flight claim before getting PendingBusy.
    pub pending_wait_ms: u64,
    pub pending_poll_interval_ms: u64,
    pub retry_after_ms: u64,
    pub key_required: bool,
    pub verify_payload_fingerprint: bool,
}

impl IdempotencyPolicy {
    pub fn messaging_v1() -> Self {
        Self {
            schema_version: POLICY_CONTRACT_VERSION,
            ttl_ms: 10 * 60_000,
            pending_staleness_ms: 30_000,
            execution_timeout_ms: 10_000,
            pending_wait_ms: 0,
            pending_poll_interval_ms: 25,
            retry_after_ms: 1_000,
            key_required: false,
            verify_payload_fingerprint: true,
        }
    }

    pub fn file_sync_v1() -> Self {
        Self {
            ttl_ms: 30 * 60_000,
            pending_staleness_ms: 120_000,
            execution_timeout_ms: 60_000,
            retry_after_ms: 5_000,
            ..Self::messaging_v1()
        }
    }

    pub fn payments_v1() -> Self {
        Self {
            ttl_ms: 24 * 3_600_000,
            pending_staleness_ms: 120_000,
            execution_timeout_ms: 30_000,
            retry_after_ms: 2_000,
            key_required: true,
            ..Self::messaging_v1()
        }
    }
}

impl Validate for IdempotencyPolicy {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != POLICY_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "idempotency_policy.schema_version",
                reason: "must match POLICY_CONTRACT_VERSION",
            });
        }
        validate_range(
            "idempotency_policy.ttl_ms",
            self.ttl_ms,
            MIN_RECORD_TTL_MS,
            MAX_RECORD_TTL_MS,
        )?;
        validate_range(
            "idempotency_policy.pending_staleness_ms",
            self.pending_staleness_ms,
            1,
            self.ttl_ms.saturating_sub(1),
        )?;
        validate_range(
            "idempotency_policy.execution_timeout_ms",
            self.execution_timeout_ms,
            1,
            self.pending_staleness_ms,
        )?;
        validate_range(
            "idempotency_policy.pending_wait_ms",
            self.pending_wait_ms,
            0,
            MAX_PENDING_WAIT_MS,
        )?;
        validate_range(
            "idempotency_policy.pending_poll_interval_ms",
            self.pending_poll_interval_ms,
            1,
            self.pending_staleness_ms,
        )?;
        validate_range(
            "idempotency_policy.retry_after_ms",
            self.retry_after_ms,
            1,
            self.pending_staleness_ms,
        )?;
        Ok(())
    }
}
