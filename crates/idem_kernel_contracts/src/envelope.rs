#![forbid(unsafe_code)]

use crate::common::validate_range;
use crate::idempotency::{PayloadFingerprint, PAYLOAD_FINGERPRINT_HEX_LEN};
use crate::{ContractViolation, SchemaVersion, Validate};

pub const ENVELOPE_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

pub const ENVELOPE_BODY_MAX_BYTES: usize = 1024 * 1024;
pub const ENVELOPE_CONTENT_TYPE_MAX_LEN: usize = 128;
pub const CONTENT_TYPE_JSON: &str = "application/json";

const CACHED_REPLAY_MAGIC: &[u8; 4] = b"IDRP";
const CACHED_REPLAY_CODEC_VERSION: u8 = 1;

/// The executor's result, stored verbatim and replayed byte-for-byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseEnvelope {
    pub schema_version: SchemaVersion,
    pub status_code: u16,
    pub content_type: String,
    pub body: Vec<u8>,
}

impl ResponseEnvelope {
    pub fn v1(
        status_code: u16,
        content_type: impl Into<String>,
        body: Vec<u8>,
    ) -> Result<Self, ContractViolation> {
        let e = Self {
            schema_version: ENVELOPE_CONTRACT_VERSION,
            status_code,
            content_type: content_type.into(),
            body,
        };
        e.validate()?;
        Ok(e)
    }

    pub fn json_v1(status_code: u16, body: Vec<u8>) -> Result<Self, ContractViolation> {
        Self::v1(status_code, CONTENT_TYPE_JSON, body)
    }

    /// 5xx results describe a failed execution and are never bound to a key.
    pub fn is_committable(&self) -> bool {
        self.status_code < 500
    }
}

impl Validate for ResponseEnvelope {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != ENVELOPE_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "response_envelope.schema_version",
                reason: "must match ENVELOPE_CONTRACT_VERSION",
            });
        }
        validate_range(
            "response_envelope.status_code",
            u64::from(self.status_code),
            100,
            599,
        )?;
        if self.content_type.trim().is_empty()
            || self.content_type.len() > ENVELOPE_CONTENT_TYPE_MAX_LEN
            || !self.content_type.bytes().all(|b| b.is_ascii() && !b.is_ascii_control())
        {
            return Err(ContractViolation::InvalidValue {
                field: "response_envelope.content_type",
                reason: "must be non-empty printable ASCII <= 128 chars",
            });
        }
        if self.body.len() > ENVELOPE_BODY_MAX_BYTES {
            return Err(ContractViolation::InvalidValue {
                field: "response_envelope.body",
                reason: "must be <= 1 MiB",
            });
        }
        Ok(())
    }
}

/// Key Store value: the committed envelope plus the fingerprint it was produced for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedReplay {
    pub payload_fingerprint: PayloadFingerprint,
    pub envelope: ResponseEnvelope,
}

impl CachedReplay {
    pub fn v1(
        payload_fingerprint: PayloadFingerprint,
        envelope: ResponseEnvelope,
    ) -> Result<Self, ContractViolation> {
        let c = Self {
            payload_fingerprint,
            envelope,
        };
        c.validate()?;
        Ok(c)
    }

    /// Layout: magic, codec version, fingerprint (64 ascii hex), status u16,
    /// content type (u16 len + bytes), body (u32 len + bytes). Integers big-endian.
    pub fn encode(&self) -> Vec<u8> {
        let ct = self.envelope.content_type.as_bytes();
        let body = &self.envelope.body;
        let mut out =
            Vec::with_capacity(4 + 1 + PAYLOAD_FINGERPRINT_HEX_LEN + 2 + 2 + ct.len() + 4 + body.len());
        out.extend_from_slice(CACHED_REPLAY_MAGIC);
        out.push(CACHED_REPLAY_CODEC_VERSION);
        out.extend_from_slice(self.payload_fingerprint.as_str().as_bytes());
        out.extend_from_slice(&self.envelope.status_code.to_be_bytes());
        out.extend_from_slice(&(ct.len() as u16).to_be_bytes());
        out.extend_from_slice(ct);
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.extend_from_slice(body);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ContractViolation> {
        let mut r = Reader { bytes, pos: 0 };
        if r.take(4)? != CACHED_REPLAY_MAGIC {
            return Err(corrupt("bad magic"));
        }
        if r.take(1)?[0] != CACHED_REPLAY_CODEC_VERSION {
            return Err(corrupt("unsupported codec version"));
        }
        let fp = std::str::from_utf8(r.take(PAYLOAD_FINGERPRINT_HEX_LEN)?)
            .map_err(|_| corrupt("fingerprint is not utf-8"))?;
        let payload_fingerprint = PayloadFingerprint::new(fp)?;
        let status_code = u16::from_be_bytes([r.u8()?, r.u8()?]);
        let ct_len = usize::from(u16::from_be_bytes([r.u8()?, r.u8()?]));
        let content_type = std::str::from_utf8(r.take(ct_len)?)
            .map_err(|_| corrupt("content type is not utf-8"))?
            .to_string();
        let body_len = u32::from_be_bytes([r.u8()?, r.u8()?, r.u8()?, r.u8()?]) as usize;
        if body_len > ENVELOPE_BODY_MAX_BYTES {
            return Err(corrupt("body length exceeds limit"));
        }
        let body = r.take(body_len)?.to_vec();
        if r.pos != bytes.len() {
            return Err(corrupt("trailing bytes"));
        }
        let envelope = ResponseEnvelope::v1(status_code, content_type, body)?;
        Self::v1(payload_fingerprint, envelope)
    }
}

impl Validate for CachedReplay {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.payload_fingerprint.validate()?;
        self.envelope.validate()?;
        if !self.envelope.is_committable() {
            return Err(ContractViolation::InvalidValue {
                field: "cached_replay.envelope",
                reason: "only committable envelopes are cached",
            });
        }
        Ok(())
    }
}

fn corrupt(reason: &'static str) -> ContractViolation {
    ContractViolation::InvalidValue {
        field: "cached_replay.bytes",
        reason,
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], ContractViolation> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| corrupt("truncated"))?;
        let out = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, ContractViolation> {
        Ok(self.take(1)?[0])
    }
}
