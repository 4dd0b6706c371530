#![forbid(unsafe_code)]

use idem_kernel_contracts::idempotency::ClaimToken;
use idem_kernel_contracts::ContractViolation;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::fingerprint::lower_hex;

const MESSAGE_ID_RANDOM_BYTES: usize = 12;

/// 128 random bits as 32 lowercase hex chars.
pub fn fresh_claim_token() -> Result<ClaimToken, ContractViolation> {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    ClaimToken::new(lower_hex(&bytes))
}

pub fn fresh_message_id() -> String {
    let mut bytes = [0u8; MESSAGE_ID_RANDOM_BYTES];
    OsRng.fill_bytes(&mut bytes);
    format!("msg_{}", lower_hex(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_ids_01_claim_tokens_are_distinct_and_well_formed() {
        let a = fresh_claim_token().unwrap();
        let b = fresh_claim_token().unwrap();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
    }

    #[test]
    fn at_ids_02_message_id_shape() {
        let id = fresh_message_id();
        assert!(id.starts_with("msg_"));
        assert_eq!(id.len(), 4 + 24);
        assert!(id[4..].bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()));
    }
}
