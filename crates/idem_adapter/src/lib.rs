#![forbid(unsafe_code)]

use std::env;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::header::{HeaderName, HeaderValue, CONTENT_TYPE, RETRY_AFTER};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use idem_engines::message_send::{MessageSendConfig, MessageSendRuntime};
use idem_kernel_contracts::envelope::ResponseEnvelope;
use idem_kernel_contracts::idempotency::{
    ClaimRecord, EndpointId, IdempotencyKey, ScopedKey, MAX_RECORD_TTL_MS, MIN_RECORD_TTL_MS,
};
use idem_kernel_contracts::policy::{IdempotencyPolicy, MAX_PENDING_WAIT_MS};
use idem_kernel_contracts::{MonotonicTimeNs, Validate};
use idem_os::{
    Clock, ExecuteOutcome, ExecutorError, ExpirySweep, IdempotencyCoordinator, IdempotencyError,
    IdempotentWriteRequest, MessageSendExecutor, SweepPassMetrics, SystemClock,
};
use idem_storage::{
    DurableLedger, InMemoryKeyStore, InMemoryLedger, KeyStore, LedgerError, NullKeyStore,
    SqliteLedger,
};

pub const MESSAGE_SEND_ENDPOINT: &str = "messages.send";
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";
pub const IDEMPOTENT_REPLAYED_HEADER: &str = "idempotent-replayed";

pub mod reason_codes {
    use idem_kernel_contracts::ReasonCodeId;

    pub const ADAPTER_SWEEP_PASS_FAILED: ReasonCodeId = ReasonCodeId(0xAD71_0001);
    pub const ADAPTER_BLOCKING_TASK_FAILED: ReasonCodeId = ReasonCodeId(0xAD71_0002);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterConfig {
    pub bind: String,
    pub policy: IdempotencyPolicy,
    /// SQLite file for the durable ledger; `None` keeps the ledger in memory.
    pub ledger_path: Option<PathBuf>,
    pub cache_enabled: bool,
    pub cache_max_entries: usize,
    pub sweep_enabled: bool,
    pub sweep_interval_ms: u64,
    pub sweep_batch_limit: usize,
}

impl AdapterConfig {
    pub fn mvp_v1() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
            policy: IdempotencyPolicy::messaging_v1(),
            ledger_path: None,
            cache_enabled: true,
            cache_max_entries: 100_000,
            sweep_enabled: true,
            sweep_interval_ms: 30_000,
            sweep_batch_limit: 500,
        }
    }

    pub fn from_env() -> Result<Self, String> {
        Self::from_env_var_map(|key| env::var(key).ok())
    }

    /// Every override is range-filtered; out-of-range or unparsable values
    /// fall back to the preset.
    pub fn from_env_var_map<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::mvp_v1();
        let preset = defaults.policy;
        let policy = IdempotencyPolicy {
            ttl_ms: parse_u64(&lookup, "IDEM_TTL_MS", MIN_RECORD_TTL_MS, MAX_RECORD_TTL_MS)
                .unwrap_or(preset.ttl_ms),
            pending_staleness_ms: parse_u64(
                &lookup,
                "IDEM_PENDING_STALENESS_MS",
                1,
                MAX_RECORD_TTL_MS,
            )
            .unwrap_or(preset.pending_staleness_ms),
            execution_timeout_ms: parse_u64(&lookup, "IDEM_EXECUTION_TIMEOUT_MS", 1, 600_000)
                .unwrap_or(preset.execution_timeout_ms),
            pending_wait_ms: parse_u64(&lookup, "IDEM_PENDING_WAIT_MS", 0, MAX_PENDING_WAIT_MS)
                .unwrap_or(preset.pending_wait_ms),
            key_required: parse_bool(&lookup, "IDEM_KEY_REQUIRED").unwrap_or(preset.key_required),
            verify_payload_fingerprint: parse_bool(&lookup, "IDEM_VERIFY_PAYLOAD")
                .unwrap_or(preset.verify_payload_fingerprint),
            ..preset
        };
        policy
            .validate()
            .map_err(|err| format!("invalid idempotency policy from environment: {err}"))?;

        Ok(Self {
            bind: lookup("IDEM_HTTP_BIND")
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.bind),
            policy,
            ledger_path: lookup("IDEM_LEDGER_PATH")
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            cache_enabled: parse_bool(&lookup, "IDEM_CACHE_ENABLED")
                .unwrap_or(defaults.cache_enabled),
            cache_max_entries: parse_u64(&lookup, "IDEM_CACHE_MAX_ENTRIES", 1, 10_000_000)
                .map(|v| v as usize)
                .unwrap_or(defaults.cache_max_entries),
            sweep_enabled: parse_bool(&lookup, "IDEM_SWEEP_ENABLED")
                .unwrap_or(defaults.sweep_enabled),
            sweep_interval_ms: parse_u64(&lookup, "IDEM_SWEEP_INTERVAL_MS", 100, 3_600_000)
                .unwrap_or(defaults.sweep_interval_ms),
            sweep_batch_limit: parse_u64(&lookup, "IDEM_SWEEP_BATCH_LIMIT", 1, 10_000)
                .map(|v| v as usize)
                .unwrap_or(defaults.sweep_batch_limit),
        })
    }
}

fn parse_u64<F>(lookup: &F, key: &str, min: u64, max: u64) -> Option<u64>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|v| (min..=max).contains(v))
}

fn parse_bool<F>(lookup: &F, key: &str) -> Option<bool>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key).and_then(|v| match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AdapterErrorResponse {
    pub status: String,
    pub outcome: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Default)]
pub struct AdapterSweepHealth {
    pub enabled: bool,
    pub passes: u64,
    pub failures: u64,
    pub scanned: u64,
    pub deleted: u64,
    pub skipped: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AdapterHealthResponse {
    pub status: String,
    pub outcome: String,
    pub reason: Option<String>,
    pub ledger_backend: String,
    pub cache_enabled: bool,
    pub sweep: AdapterSweepHealth,
}

/// Admin view of one ledger record.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct IdempotencyRecordView {
    pub endpoint_id: String,
    pub idempotency_key: String,
    pub status: String,
    pub attempt: u32,
    pub created_at_ns: u64,
    pub claimed_at_ns: u64,
    pub committed_at_ns: Option<u64>,
    pub expires_at_ns: u64,
    pub response_status: Option<u16>,
    pub response_content_type: Option<String>,
    pub response_body_b64: Option<String>,
}

impl IdempotencyRecordView {
    fn from_record(record: &ClaimRecord) -> Self {
        let response = record.response.as_ref();
        Self {
            endpoint_id: record.key.endpoint_id.as_str().to_string(),
            idempotency_key: record.key.idempotency_key.as_str().to_string(),
            status: record.status.as_str().to_string(),
            attempt: record.attempt,
            created_at_ns: record.created_at.0,
            claimed_at_ns: record.claimed_at.0,
            committed_at_ns: record.committed_at.map(|t| t.0),
            expires_at_ns: record.expires_at.0,
            response_status: response.map(|r| r.status_code),
            response_content_type: response.map(|r| r.content_type.clone()),
            response_body_b64: response.map(|r| BASE64.encode(&r.body)),
        }
    }
}

type SharedKeyStore = Arc<dyn KeyStore>;
type SharedLedger = Arc<dyn DurableLedger>;
type SharedClock = Arc<dyn Clock>;

/// Everything one HTTP process needs. Shared across handlers without a global
/// lock: the coordinator serializes per key through the ledger.
pub struct AdapterRuntime {
    config: AdapterConfig,
    endpoint: EndpointId,
    coordinator: IdempotencyCoordinator<SharedKeyStore, SharedLedger, SharedClock>,
    executor: Arc<MessageSendExecutor<SharedClock>>,
    sweep: ExpirySweep<SharedLedger, SharedClock>,
    ledger: SharedLedger,
    ledger_backend: &'static str,
    sweep_health: Mutex<AdapterSweepHealth>,
}

impl std::fmt::Debug for AdapterRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRuntime")
            .field("config", &self.config)
            .field("ledger_backend", &self.ledger_backend)
            .finish_non_exhaustive()
    }
}

impl AdapterRuntime {
    pub fn from_config(config: AdapterConfig) -> Result<Self, String> {
        let (ledger, backend): (SharedLedger, &'static str) = match config.ledger_path.as_ref() {
            Some(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent).map_err(|err| {
                        format!(
                            "failed to create ledger directory '{}': {err}",
                            parent.display()
                        )
                    })?;
                }
                let ledger = SqliteLedger::open(path).map_err(|err| {
                    format!("failed to open ledger '{}': {err}", path.display())
                })?;
                (Arc::new(ledger), "sqlite")
            }
            None => (Arc::new(InMemoryLedger::new()), "memory"),
        };
        let key_store: SharedKeyStore = if config.cache_enabled {
            Arc::new(InMemoryKeyStore::new(config.cache_max_entries))
        } else {
            Arc::new(NullKeyStore)
        };
        Self::with_parts(config, key_store, ledger, backend, Arc::new(SystemClock::new()))
    }

    pub fn with_parts(
        config: AdapterConfig,
        key_store: SharedKeyStore,
        ledger: SharedLedger,
        ledger_backend: &'static str,
        clock: SharedClock,
    ) -> Result<Self, String> {
        let endpoint = EndpointId::new(MESSAGE_SEND_ENDPOINT)
            .map_err(|err| format!("invalid endpoint id: {err}"))?;
        let coordinator =
            IdempotencyCoordinator::new(config.policy, key_store, ledger.clone(), clock.clone())
                .map_err(|err| format!("invalid idempotency policy: {err}"))?;
        let executor = Arc::new(MessageSendExecutor::new(
            MessageSendRuntime::new(MessageSendConfig::mvp_v1()),
            clock.clone(),
        ));
        let sweep_health = AdapterSweepHealth {
            enabled: config.sweep_enabled,
            ..AdapterSweepHealth::default()
        };
        Ok(Self {
            endpoint,
            coordinator,
            executor,
            sweep: ExpirySweep::new(ledger.clone(), clock),
            ledger,
            ledger_backend,
            sweep_health: Mutex::new(sweep_health),
            config,
        })
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    /// Blocking: runs claim resolution to completion regardless of the caller.
    pub fn send_message(
        &self,
        idempotency_key: Option<String>,
        body: Vec<u8>,
    ) -> Result<ExecuteOutcome, IdempotencyError> {
        let request = IdempotentWriteRequest::v1(self.endpoint.clone(), idempotency_key, body);
        self.coordinator.execute(request, self.executor.clone())
    }

    pub fn record_view(&self, key: &str) -> Result<Option<IdempotencyRecordView>, String> {
        let key = IdempotencyKey::new(key).map_err(|err| format!("invalid key: {err}"))?;
        let record = self
            .ledger
            .read(&ScopedKey::new(self.endpoint.clone(), key))
            .map_err(|err| err.to_string())?;
        Ok(record.as_ref().map(IdempotencyRecordView::from_record))
    }

    pub fn run_sweep_pass(&self) -> Result<SweepPassMetrics, LedgerError> {
        let result = self.sweep.run_pass(self.config.sweep_batch_limit);
        if let Ok(mut health) = self.sweep_health.lock() {
            health.passes += 1;
            match &result {
                Ok(m) => {
                    health.scanned += m.scanned;
                    health.deleted += m.deleted;
                    health.skipped += m.skipped;
                }
                Err(_) => health.failures += 1,
            }
        }
        result
    }

    pub fn health_report(&self) -> AdapterHealthResponse {
        let sweep = self
            .sweep_health
            .lock()
            .map(|h| h.clone())
            .unwrap_or_default();
        // A zero-row expiry scan exercises the ledger without touching records.
        let probe = self.ledger.read_expired(MonotonicTimeNs(1), 0);
        let (status, outcome, reason) = match probe {
            Ok(_) => ("ok", "HEALTHY", None),
            Err(err) => ("error", "UNHEALTHY", Some(err.to_string())),
        };
        AdapterHealthResponse {
            status: status.to_string(),
            outcome: outcome.to_string(),
            reason,
            ledger_backend: self.ledger_backend.to_string(),
            cache_enabled: self.config.cache_enabled,
            sweep,
        }
    }
}

pub fn router(runtime: Arc<AdapterRuntime>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/messages", post(send_message))
        .route("/v1/idempotency/:key", get(read_record))
        .with_state(runtime)
}

async fn healthz(State(runtime): State<Arc<AdapterRuntime>>) -> Response {
    let report = match tokio::task::spawn_blocking(move || runtime.health_report()).await {
        Ok(report) => report,
        Err(err) => return blocking_task_failed(err),
    };
    let status = if report.status == "ok" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report)).into_response()
}

async fn send_message(
    State(runtime): State<Arc<AdapterRuntime>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let key = match headers.get(IDEMPOTENCY_KEY_HEADER) {
        None => None,
        Some(v) => match v.to_str() {
            Ok(v) => Some(v.to_string()),
            Err(_) => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    "KEY_REJECTED",
                    "idempotency key must be visible ASCII".to_string(),
                    None,
                )
            }
        },
    };

    // The blocking task owns the claim: if this future is dropped the claim
    // still commits or abandons.
    let result =
        tokio::task::spawn_blocking(move || runtime.send_message(key, body.to_vec())).await;
    match result {
        Ok(Ok(outcome)) => envelope_response(&outcome.envelope, outcome.disposition.is_replay()),
        Ok(Err(err)) => idempotency_error_response(&err),
        Err(err) => blocking_task_failed(err),
    }
}

async fn read_record(
    State(runtime): State<Arc<AdapterRuntime>>,
    Path(key): Path<String>,
) -> Response {
    let result = tokio::task::spawn_blocking(move || runtime.record_view(&key)).await;
    match result {
        Ok(Ok(Some(view))) => (StatusCode::OK, Json(view)).into_response(),
        Ok(Ok(None)) => error_response(
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            "no record for this idempotency key".to_string(),
            None,
        ),
        Ok(Err(reason)) => {
            error_response(StatusCode::BAD_REQUEST, "KEY_REJECTED", reason, None)
        }
        Err(err) => blocking_task_failed(err),
    }
}

fn envelope_response(envelope: &ResponseEnvelope, replayed: bool) -> Response {
    let status =
        StatusCode::from_u16(envelope.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut headers = HeaderMap::new();
    let content_type = HeaderValue::from_str(&envelope.content_type)
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
    headers.insert(CONTENT_TYPE, content_type);
    headers.insert(
        HeaderName::from_static(IDEMPOTENT_REPLAYED_HEADER),
        HeaderValue::from_static(if replayed { "true" } else { "false" }),
    );
    (status, headers, envelope.body.clone()).into_response()
}

fn idempotency_error_response(err: &IdempotencyError) -> Response {
    let (status, outcome, retry_after_ms) = match err {
        IdempotencyError::KeyRequired | IdempotencyError::InvalidKey(_) => {
            (StatusCode::BAD_REQUEST, "KEY_REJECTED", None)
        }
        IdempotencyError::PayloadMismatch => {
            (StatusCode::UNPROCESSABLE_ENTITY, "PAYLOAD_MISMATCH", None)
        }
        IdempotencyError::PendingBusy { retry_after_ms } => {
            (StatusCode::CONFLICT, "IN_FLIGHT", Some(*retry_after_ms))
        }
        IdempotencyError::ExecutorFailure(ExecutorError::TimedOut { .. }) => {
            (StatusCode::GATEWAY_TIMEOUT, "EXECUTOR_FAILED", None)
        }
        IdempotencyError::ExecutorFailure(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "EXECUTOR_FAILED", None)
        }
        IdempotencyError::LedgerUnavailable(_) => {
            (StatusCode::SERVICE_UNAVAILABLE, "LEDGER_UNAVAILABLE", None)
        }
    };
    if status.is_server_error() {
        tracing::warn!(
            reason_code = err.reason_code().0,
            error = %err,
            "idempotent write failed"
        );
    }
    error_response(status, outcome, err.to_string(), retry_after_ms)
}

fn error_response(
    status: StatusCode,
    outcome: &str,
    reason: String,
    retry_after_ms: Option<u64>,
) -> Response {
    let body = Json(AdapterErrorResponse {
        status: "error".to_string(),
        outcome: outcome.to_string(),
        reason,
    });
    match retry_after_ms {
        Some(ms) => {
            let mut headers = HeaderMap::new();
            headers.insert(RETRY_AFTER, HeaderValue::from(retry_after_secs(ms)));
            (status, headers, body).into_response()
        }
        None => (status, body).into_response(),
    }
}

/// Retry-After carries whole seconds; never advertise zero.
pub fn retry_after_secs(retry_after_ms: u64) -> u64 {
    retry_after_ms.div_ceil(1_000).max(1)
}

fn blocking_task_failed(err: tokio::task::JoinError) -> Response {
    tracing::error!(
        reason_code = reason_codes::ADAPTER_BLOCKING_TASK_FAILED.0,
        error = %err,
        "blocking adapter task failed"
    );
    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        "INTERNAL_ERROR",
        "adapter task failed".to_string(),
        None,
    )
}
