#![forbid(unsafe_code)]

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use idem_engines::message_send::MessageSendRuntime;
use idem_kernel_contracts::envelope::ResponseEnvelope;

use crate::clock::Clock;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutorError {
    #[error("write executor failed: {reason}")]
    Failed { reason: String },
    #[error("write executor exceeded {timeout_ms}ms")]
    TimedOut { timeout_ms: u64 },
    #[error("write executor panicked")]
    Panicked,
    #[error("write executor returned non-committable status {status_code}")]
    Uncommittable { status_code: u16 },
}

/// The business operation behind an idempotent endpoint. Opaque to the
/// coordinator, which invokes it at most once per claimed key.
pub trait WriteExecutor: Send + Sync + 'static {
    fn execute(&self, payload: &[u8]) -> Result<ResponseEnvelope, ExecutorError>;
}

impl<F> WriteExecutor for F
where
    F: Fn(&[u8]) -> Result<ResponseEnvelope, ExecutorError> + Send + Sync + 'static,
{
    fn execute(&self, payload: &[u8]) -> Result<ResponseEnvelope, ExecutorError> {
        self(payload)
    }
}

/// Runs the executor on its own thread and waits at most `timeout`.
///
/// On timeout the worker thread is left to finish on its own; its result is
/// dropped. A worker that panics closes the channel without sending.
pub fn run_with_timeout<E>(
    executor: Arc<E>,
    payload: Vec<u8>,
    timeout: Duration,
) -> Result<ResponseEnvelope, ExecutorError>
where
    E: WriteExecutor + ?Sized,
{
    let (tx, rx) = mpsc::sync_channel(1);
    thread::Builder::new()
        .name("idem-write-executor".to_string())
        .spawn(move || {
            let out = executor.execute(&payload);
            let _ = tx.send(out);
        })
        .map_err(|err| ExecutorError::Failed {
            reason: format!("failed to spawn executor thread: {err}"),
        })?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => Err(ExecutorError::TimedOut {
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }),
        Err(RecvTimeoutError::Disconnected) => Err(ExecutorError::Panicked),
    }
}

/// Messaging write executor: stamps each accepted message with the clock.
#[derive(Debug)]
pub struct MessageSendExecutor<C: Clock> {
    runtime: MessageSendRuntime,
    clock: C,
}

impl<C: Clock> MessageSendExecutor<C> {
    pub fn new(runtime: MessageSendRuntime, clock: C) -> Self {
        Self { runtime, clock }
    }
}

impl<C: Clock + 'static> WriteExecutor for MessageSendExecutor<C> {
    fn execute(&self, payload: &[u8]) -> Result<ResponseEnvelope, ExecutorError> {
        self.runtime
            .run(payload, self.clock.now())
            .map_err(|violation| ExecutorError::Failed {
                reason: violation.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use idem_engines::message_send::MessageSendConfig;

    fn ok_envelope() -> Result<ResponseEnvelope, ExecutorError> {
        Ok(ResponseEnvelope::json_v1(201, b"{}".to_vec()).unwrap())
    }

    #[test]
    fn at_executor_01_closure_result_passes_through() {
        let exec = Arc::new(|_p: &[u8]| ok_envelope());
        let out = run_with_timeout(exec, Vec::new(), Duration::from_secs(5)).unwrap();
        assert_eq!(out.status_code, 201);

        let failing = Arc::new(|_p: &[u8]| -> Result<ResponseEnvelope, ExecutorError> {
            Err(ExecutorError::Failed {
                reason: "downstream refused".to_string(),
            })
        });
        assert!(matches!(
            run_with_timeout(failing, Vec::new(), Duration::from_secs(5)),
            Err(ExecutorError::Failed { .. })
        ));
    }

    #[test]
    fn at_executor_02_slow_executor_times_out() {
        let exec = Arc::new(|_p: &[u8]| -> Result<ResponseEnvelope, ExecutorError> {
            thread::sleep(Duration::from_millis(300));
            ok_envelope()
        });
        assert_eq!(
            run_with_timeout(exec, Vec::new(), Duration::from_millis(20)),
            Err(ExecutorError::TimedOut { timeout_ms: 20 })
        );
    }

    #[test]
    fn at_executor_03_panic_is_contained() {
        let exec = Arc::new(|_p: &[u8]| -> Result<ResponseEnvelope, ExecutorError> {
            panic!("executor blew up");
        });
        assert_eq!(
            run_with_timeout(exec, Vec::new(), Duration::from_secs(5)),
            Err(ExecutorError::Panicked)
        );
    }

    #[test]
    fn at_executor_04_message_executor_uses_clock() {
        let exec = MessageSendExecutor::new(
            MessageSendRuntime::new(MessageSendConfig::mvp_v1()),
            ManualClock::starting_at_ms(7),
        );
        let env = exec
            .execute(br#"{"from":"user123","to":"user456","message":"Hey there!"}"#)
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&env.body).unwrap();
        assert_eq!(body["accepted_at_ns"], 7_000_000);
    }
}
