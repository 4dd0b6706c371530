#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::common::validate_ascii_token;
use crate::{ContractViolation, MonotonicTimeNs, Validate};

pub const MESSAGE_TEXT_MAX_CHARS: usize = 4_096;
pub const MESSAGE_PARTY_ID_MAX_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSendRequest {
    pub from: String,
    pub to: String,
    pub message: String,
}

impl MessageSendRequest {
    pub fn v1(
        from: impl Into<String>,
        to: impl Into<String>,
        message: impl Into<String>,
    ) -> Result<Self, ContractViolation> {
        let r = Self {
            from: from.into(),
            to: to.into(),
            message: message.into(),
        };
        r.validate()?;
        Ok(r)
    }
}

impl Validate for MessageSendRequest {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_ascii_token("message_send_request.from", &self.from, MESSAGE_PARTY_ID_MAX_LEN)?;
        validate_ascii_token("message_send_request.to", &self.to, MESSAGE_PARTY_ID_MAX_LEN)?;
        if self.from == self.to {
            return Err(ContractViolation::InvalidValue {
                field: "message_send_request.to",
                reason: "must differ from sender",
            });
        }
        if self.message.trim().is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "message_send_request.message",
                reason: "must not be empty",
            });
        }
        if self.message.chars().count() > MESSAGE_TEXT_MAX_CHARS {
            return Err(ContractViolation::InvalidValue {
                field: "message_send_request.message",
                reason: "must be <= 4096 chars",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSendReceipt {
    pub message_id: String,
    pub from: String,
    pub to: String,
    pub message: String,
    pub accepted_at_ns: u64,
}

impl MessageSendReceipt {
    pub fn v1(
        message_id: String,
        request: &MessageSendRequest,
        accepted_at: MonotonicTimeNs,
    ) -> Result<Self, ContractViolation> {
        let r = Self {
            message_id,
            from: request.from.clone(),
            to: request.to.clone(),
            message: request.message.clone(),
            accepted_at_ns: accepted_at.0,
        };
        r.validate()?;
        Ok(r)
    }
}

impl Validate for MessageSendReceipt {
    fn validate(&self) -> Result<(), ContractViolation> {
        if !self.message_id.starts_with("msg_") {
            return Err(ContractViolation::InvalidValue {
                field: "message_send_receipt.message_id",
                reason: "must start with msg_",
            });
        }
        validate_ascii_token("message_send_receipt.message_id", &self.message_id, 64)?;
        if self.accepted_at_ns == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "message_send_receipt.accepted_at_ns",
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}
