#![forbid(unsafe_code)]

pub mod common;
pub mod envelope;
pub mod idempotency;
pub mod message;
pub mod policy;

pub use common::{ContractViolation, MonotonicTimeNs, ReasonCodeId, SchemaVersion, Validate};
