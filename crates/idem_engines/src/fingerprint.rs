#![forbid(unsafe_code)]

use std::fmt::Write as _;

use idem_kernel_contracts::idempotency::{EndpointId, PayloadFingerprint};
use idem_kernel_contracts::ContractViolation;
use sha2::{Digest, Sha256};

/// SHA-256 over `endpoint || 0x00 || payload`, lowercase hex.
///
/// The endpoint is folded in so the same bytes sent to two endpoints never
/// share a fingerprint.
pub fn payload_fingerprint(
    endpoint_id: &EndpointId,
    payload: &[u8],
) -> Result<PayloadFingerprint, ContractViolation> {
    let mut hasher = Sha256::new();
    hasher.update(endpoint_id.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(payload);
    PayloadFingerprint::new(lower_hex(&hasher.finalize()))
}

pub(crate) fn lower_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(id: &str) -> EndpointId {
        EndpointId::new(id).unwrap()
    }

    #[test]
    fn at_fingerprint_01_known_digest() {
        let fp = payload_fingerprint(&endpoint("messages.send"), b"hello").unwrap();
        assert_eq!(
            fp.as_str(),
            "6c8effb91d2f5038b393013a0b3a0233b2dc3ae1bb14334c891dbc608a34879c"
        );
    }

    #[test]
    fn at_fingerprint_02_same_payload_same_endpoint_matches() {
        let body = br#"{"from":"user123","to":"user456","message":"Hey there!"}"#;
        assert_eq!(
            payload_fingerprint(&endpoint("messages.send"), body).unwrap(),
            payload_fingerprint(&endpoint("messages.send"), body).unwrap()
        );
    }

    #[test]
    fn at_fingerprint_03_endpoint_and_payload_both_discriminate() {
        let a = payload_fingerprint(&endpoint("messages.send"), b"x").unwrap();
        let b = payload_fingerprint(&endpoint("files.sync"), b"x").unwrap();
        let c = payload_fingerprint(&endpoint("messages.send"), b"y").unwrap();
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn at_fingerprint_04_lower_hex_pads_each_byte() {
        assert_eq!(lower_hex(&[0x00, 0x0f, 0xab]), "000fab");
    }
}
