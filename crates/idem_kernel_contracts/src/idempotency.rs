#![forbid(unsafe_code)]

use crate::common::{validate_ascii_token, validate_lower_hex, validate_range};
use crate::envelope::ResponseEnvelope;
use crate::{ContractViolation, MonotonicTimeNs, SchemaVersion, Validate};

pub const IDEMPOTENCY_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

pub const ENDPOINT_ID_MAX_LEN: usize = 64;
pub const IDEMPOTENCY_KEY_MAX_LEN: usize = 128;
pub const CLAIM_TOKEN_HEX_LEN: usize = 32;
pub const PAYLOAD_FINGERPRINT_HEX_LEN: usize = 64;

pub const MIN_RECORD_TTL_MS: u64 = 1_000;
pub const MAX_RECORD_TTL_MS: u64 = 7 * 24 * 3_600_000;

/// Write endpoint a key is scoped to, e.g. `messages.send`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EndpointId(String);

impl EndpointId {
    pub fn new(id: impl Into<String>) -> Result<Self, ContractViolation> {
        let v = Self(id.into());
        v.validate()?;
        Ok(v)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for EndpointId {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_ascii_token("endpoint_id", &self.0, ENDPOINT_ID_MAX_LEN)?;
        if self.0.contains(':') {
            return Err(ContractViolation::InvalidValue {
                field: "endpoint_id",
                reason: "must not contain ':'",
            });
        }
        Ok(())
    }
}

/// Client-generated token naming one logical write intent. Opaque: no structure is assumed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn new(key: impl Into<String>) -> Result<Self, ContractViolation> {
        let v = Self(key.into());
        v.validate()?;
        Ok(v)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for IdempotencyKey {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_ascii_token("idempotency_key", &self.0, IDEMPOTENCY_KEY_MAX_LEN)
    }
}

/// The unit of uniqueness in the ledger: a key is only unique within its endpoint.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ScopedKey {
    pub endpoint_id: EndpointId,
    pub idempotency_key: IdempotencyKey,
}

impl ScopedKey {
    pub fn new(endpoint_id: EndpointId, idempotency_key: IdempotencyKey) -> Self {
        Self {
            endpoint_id,
            idempotency_key,
        }
    }

    pub fn cache_key(&self) -> String {
        format!(
            "{}:{}",
            self.endpoint_id.as_str(),
            self.idempotency_key.as_str()
        )
    }
}

impl std::fmt::Display for ScopedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.cache_key())
    }
}

impl Validate for ScopedKey {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.endpoint_id.validate()?;
        self.idempotency_key.validate()
    }
}

/// Identifies one claimant. Commits and abandons are fenced on it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClaimToken(String);

impl ClaimToken {
    pub fn new(token: impl Into<String>) -> Result<Self, ContractViolation> {
        let v = Self(token.into());
        v.validate()?;
        Ok(v)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for ClaimToken {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_lower_hex("claim_token", &self.0, CLAIM_TOKEN_HEX_LEN)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PayloadFingerprint(String);

impl PayloadFingerprint {
    pub fn new(hex: impl Into<String>) -> Result<Self, ContractViolation> {
        let v = Self(hex.into());
        v.validate()?;
        Ok(v)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for PayloadFingerprint {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_lower_hex("payload_fingerprint", &self.0, PAYLOAD_FINGERPRINT_HEX_LEN)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClaimStatus {
    Pending,
    Committed,
    /// Tombstone left by an abandoned claim. A new claim replaces it.
    Failed,
}

impl ClaimStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ClaimStatus::Pending => "PENDING",
            ClaimStatus::Committed => "COMMITTED",
            ClaimStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ContractViolation> {
        match s {
            "PENDING" => Ok(ClaimStatus::Pending),
            "COMMITTED" => Ok(ClaimStatus::Committed),
            "FAILED" => Ok(ClaimStatus::Failed),
            _ => Err(ContractViolation::InvalidValue {
                field: "claim_record.status",
                reason: "must be PENDING, COMMITTED or FAILED",
            }),
        }
    }
}

/// Input for an atomic claim (or supersede) against the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimAttempt {
    pub schema_version: SchemaVersion,
    pub key: ScopedKey,
    pub claim_token: ClaimToken,
    pub payload_fingerprint: PayloadFingerprint,
    pub now: MonotonicTimeNs,
    pub ttl_ms: u64,
}

impl ClaimAttempt {
    pub fn v1(
        key: ScopedKey,
        claim_token: ClaimToken,
        payload_fingerprint: PayloadFingerprint,
        now: MonotonicTimeNs,
        ttl_ms: u64,
    ) -> Result<Self, ContractViolation> {
        let a = Self {
            schema_version: IDEMPOTENCY_CONTRACT_VERSION,
            key,
            claim_token,
            payload_fingerprint,
            now,
            ttl_ms,
        };
        a.validate()?;
        Ok(a)
    }

    pub fn expires_at(&self) -> MonotonicTimeNs {
        self.now.saturating_add_ms(self.ttl_ms)
    }
}

impl Validate for ClaimAttempt {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != IDEMPOTENCY_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "claim_attempt.schema_version",
                reason: "must match IDEMPOTENCY_CONTRACT_VERSION",
            });
        }
        self.key.validate()?;
        self.claim_token.validate()?;
        self.payload_fingerprint.validate()?;
        if self.now.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "claim_attempt.now",
                reason: "must be > 0",
            });
        }
        validate_range(
            "claim_attempt.ttl_ms",
            self.ttl_ms,
            MIN_RECORD_TTL_MS,
            MAX_RECORD_TTL_MS,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimRecord {
    pub schema_version: SchemaVersion,
    pub key: ScopedKey,
    pub claim_token: ClaimToken,
    pub status: ClaimStatus,
    pub payload_fingerprint: PayloadFingerprint,
    pub response: Option<ResponseEnvelope>,
    /// 1 for the first claimant; incremented each time a stale or failed claim is replaced.
    pub attempt: u32,
    pub created_at: MonotonicTimeNs,
    pub claimed_at: MonotonicTimeNs,
    pub committed_at: Option<MonotonicTimeNs>,
    pub expires_at: MonotonicTimeNs,
}

impl ClaimRecord {
    /// First claim for a key (or a key whose previous record expired).
    pub fn pending_v1(attempt: &ClaimAttempt) -> Result<Self, ContractViolation> {
        let r = Self {
            schema_version: IDEMPOTENCY_CONTRACT_VERSION,
            key: attempt.key.clone(),
            claim_token: attempt.claim_token.clone(),
            status: ClaimStatus::Pending,
            payload_fingerprint: attempt.payload_fingerprint.clone(),
            response: None,
            attempt: 1,
            created_at: attempt.now,
            claimed_at: attempt.now,
            committed_at: None,
            expires_at: attempt.expires_at(),
        };
        r.validate()?;
        Ok(r)
    }

    /// Replacement claim for a stale Pending record or a Failed tombstone.
    pub fn superseding_v1(&self, attempt: &ClaimAttempt) -> Result<Self, ContractViolation> {
        if self.status == ClaimStatus::Committed {
            return Err(ContractViolation::InvalidValue {
                field: "claim_record.status",
                reason: "committed records are write-once",
            });
        }
        let r = Self {
            schema_version: IDEMPOTENCY_CONTRACT_VERSION,
            key: attempt.key.clone(),
            claim_token: attempt.claim_token.clone(),
            status: ClaimStatus::Pending,
            payload_fingerprint: attempt.payload_fingerprint.clone(),
            response: None,
            attempt: self.attempt.saturating_add(1),
            created_at: self.created_at.min(attempt.now),
            claimed_at: attempt.now,
            committed_at: None,
            expires_at: attempt.expires_at(),
        };
        r.validate()?;
        Ok(r)
    }

    /// Rebuilds a persisted row. Used by ledgers that store records outside process memory.
    #[allow(clippy::too_many_arguments)]
    pub fn from_parts_v1(
        key: ScopedKey,
        claim_token: ClaimToken,
        status: ClaimStatus,
        payload_fingerprint: PayloadFingerprint,
        response: Option<ResponseEnvelope>,
        attempt: u32,
        created_at: MonotonicTimeNs,
        claimed_at: MonotonicTimeNs,
        committed_at: Option<MonotonicTimeNs>,
        expires_at: MonotonicTimeNs,
    ) -> Result<Self, ContractViolation> {
        let r = Self {
            schema_version: IDEMPOTENCY_CONTRACT_VERSION,
            key,
            claim_token,
            status,
            payload_fingerprint,
            response,
            attempt,
            created_at,
            claimed_at,
            committed_at,
            expires_at,
        };
        r.validate()?;
        Ok(r)
    }

    pub fn committed(
        &self,
        envelope: ResponseEnvelope,
        now: MonotonicTimeNs,
        expires_at: MonotonicTimeNs,
    ) -> Result<Self, ContractViolation> {
        if self.status != ClaimStatus::Pending {
            return Err(ContractViolation::InvalidValue {
                field: "claim_record.status",
                reason: "only PENDING records can commit",
            });
        }
        if !envelope.is_committable() {
            return Err(ContractViolation::InvalidValue {
                field: "claim_record.response",
                reason: "failure responses must not be committed",
            });
        }
        let r = Self {
            status: ClaimStatus::Committed,
            response: Some(envelope),
            committed_at: Some(now),
            expires_at,
            ..self.clone()
        };
        r.validate()?;
        Ok(r)
    }

    pub fn failed(&self) -> Result<Self, ContractViolation> {
        if self.status != ClaimStatus::Pending {
            return Err(ContractViolation::InvalidValue {
                field: "claim_record.status",
                reason: "only PENDING records can be abandoned",
            });
        }
        Ok(Self {
            status: ClaimStatus::Failed,
            ..self.clone()
        })
    }

    pub fn is_expired(&self, now: MonotonicTimeNs) -> bool {
        self.expires_at <= now
    }

    pub fn pending_age_ms(&self, now: MonotonicTimeNs) -> u64 {
        now.ms_since(self.claimed_at)
    }
}

impl Validate for ClaimRecord {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != IDEMPOTENCY_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "claim_record.schema_version",
                reason: "must match IDEMPOTENCY_CONTRACT_VERSION",
            });
        }
        self.key.validate()?;
        self.claim_token.validate()?;
        self.payload_fingerprint.validate()?;
        if self.attempt == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "claim_record.attempt",
                reason: "must be >= 1",
            });
        }
        if self.claimed_at < self.created_at {
            return Err(ContractViolation::InvalidValue {
                field: "claim_record.claimed_at",
                reason: "must be >= created_at",
            });
        }
        if self.expires_at <= self.created_at {
            return Err(ContractViolation::InvalidValue {
                field: "claim_record.expires_at",
                reason: "must be > created_at",
            });
        }
        let committed = self.status == ClaimStatus::Committed;
        if committed != self.response.is_some() {
            return Err(ContractViolation::InvalidValue {
                field: "claim_record.response",
                reason: "must be present iff status is COMMITTED",
            });
        }
        if committed != self.committed_at.is_some() {
            return Err(ContractViolation::InvalidValue {
                field: "claim_record.committed_at",
                reason: "must be present iff status is COMMITTED",
            });
        }
        if let Some(envelope) = &self.response {
            envelope.validate()?;
        }
        Ok(())
    }
}
