#![forbid(unsafe_code)]

use idem_kernel_contracts::envelope::ResponseEnvelope;
use idem_kernel_contracts::message::{MessageSendReceipt, MessageSendRequest};
use idem_kernel_contracts::{ContractViolation, MonotonicTimeNs, Validate};
use serde_json::json;

use crate::ids::fresh_message_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageSendConfig {
    pub max_payload_bytes: usize,
}

impl MessageSendConfig {
    pub fn mvp_v1() -> Self {
        Self {
            max_payload_bytes: 16 * 1024,
        }
    }
}

/// Accepts a message send and answers with a receipt envelope.
///
/// Client errors come back as committable 4xx envelopes: the same bad payload
/// under the same key replays the same rejection.
#[derive(Debug, Clone)]
pub struct MessageSendRuntime {
    config: MessageSendConfig,
}

impl MessageSendRuntime {
    pub fn new(config: MessageSendConfig) -> Self {
        Self { config }
    }

    pub fn run(
        &self,
        payload: &[u8],
        accepted_at: MonotonicTimeNs,
    ) -> Result<ResponseEnvelope, ContractViolation> {
        if payload.len() > self.config.max_payload_bytes {
            return rejection(
                413,
                json!({
                    "error": "payload_too_large",
                    "max_payload_bytes": self.config.max_payload_bytes,
                }),
            );
        }

        let request: MessageSendRequest = match serde_json::from_slice(payload) {
            Ok(r) => r,
            Err(err) => {
                return rejection(
                    400,
                    json!({ "error": "invalid_json", "reason": err.to_string() }),
                )
            }
        };
        if let Err(violation) = request.validate() {
            return rejection(
                400,
                json!({ "error": "invalid_request", "reason": violation.to_string() }),
            );
        }

        let receipt = MessageSendReceipt::v1(fresh_message_id(), &request, accepted_at)?;
        let body = serde_json::to_vec(&receipt).map_err(|_| ContractViolation::InvalidValue {
            field: "message_send_receipt",
            reason: "must serialize to json",
        })?;
        ResponseEnvelope::json_v1(201, body)
    }
}

fn rejection(
    status_code: u16,
    body: serde_json::Value,
) -> Result<ResponseEnvelope, ContractViolation> {
    ResponseEnvelope::json_v1(status_code, body.to_string().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime() -> MessageSendRuntime {
        MessageSendRuntime::new(MessageSendConfig::mvp_v1())
    }

    #[test]
    fn at_message_send_01_accepts_and_mints_message_id() {
        let env = runtime()
            .run(
                br#"{"from":"user123","to":"user456","message":"Hey there!"}"#,
                MonotonicTimeNs(42),
            )
            .unwrap();
        assert_eq!(env.status_code, 201);
        let receipt: MessageSendReceipt = serde_json::from_slice(&env.body).unwrap();
        assert!(receipt.message_id.starts_with("msg_"));
        assert_eq!(receipt.to, "user456");
        assert_eq!(receipt.accepted_at_ns, 42);
    }

    #[test]
    fn at_message_send_02_each_run_mints_a_new_id() {
        let body = br#"{"from":"user123","to":"user456","message":"Hey there!"}"#;
        let a = runtime().run(body, MonotonicTimeNs(1)).unwrap();
        let b = runtime().run(body, MonotonicTimeNs(1)).unwrap();
        assert_ne!(a.body, b.body);
    }

    #[test]
    fn at_message_send_03_client_errors_are_committable() {
        let bad_json = runtime().run(b"{not json", MonotonicTimeNs(1)).unwrap();
        assert_eq!(bad_json.status_code, 400);
        assert!(bad_json.is_committable());

        let self_send = runtime()
            .run(
                br#"{"from":"user123","to":"user123","message":"hi"}"#,
                MonotonicTimeNs(1),
            )
            .unwrap();
        assert_eq!(self_send.status_code, 400);
        let body: serde_json::Value = serde_json::from_slice(&self_send.body).unwrap();
        assert_eq!(body["error"], "invalid_request");
    }

    #[test]
    fn at_message_send_04_oversized_payload_rejected() {
        let rt = MessageSendRuntime::new(MessageSendConfig {
            max_payload_bytes: 8,
        });
        let env = rt
            .run(br#"{"from":"a","to":"b","message":"c"}"#, MonotonicTimeNs(1))
            .unwrap();
        assert_eq!(env.status_code, 413);
    }
}
