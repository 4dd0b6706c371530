#![forbid(unsafe_code)]

pub mod claim_policy;
pub mod fingerprint;
pub mod ids;
pub mod message_send;
