#![forbid(unsafe_code)]

//! SQLite-backed durable ledger. The `UNIQUE (endpoint_id, idempotency_key)`
//! constraint is the claim primitive; every read-decide-write runs inside an
//! IMMEDIATE transaction so concurrent processes sharing the file serialize on
//! the write lock.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use idem_kernel_contracts::envelope::ResponseEnvelope;
use idem_kernel_contracts::idempotency::{
    ClaimAttempt, ClaimRecord, ClaimStatus, ClaimToken, EndpointId, IdempotencyKey,
    PayloadFingerprint, ScopedKey,
};
use idem_kernel_contracts::{ContractViolation, MonotonicTimeNs, Validate};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};

use crate::ledger::{ClaimOutcome, DurableLedger, LedgerError};

const SQLITE_LEDGER_SCHEMA_VERSION: i64 = 1;
const SQLITE_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SELECT_COLUMNS: &str = "endpoint_id, idempotency_key, claim_token, status, \
     payload_fingerprint, response_status, response_content_type, response_body, attempt, \
     created_at_ns, claimed_at_ns, committed_at_ns, expires_at_ns";

pub struct SqliteLedger {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteLedger").finish_non_exhaustive()
    }
}

impl SqliteLedger {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let conn = Connection::open(path.as_ref()).map_err(map_sqlite_err)?;
        conn.query_row("PRAGMA journal_mode=WAL", [], |r| r.get::<_, String>(0))
            .map_err(map_sqlite_err)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, LedgerError> {
        let conn = Connection::open_in_memory().map_err(map_sqlite_err)?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, LedgerError> {
        conn.busy_timeout(SQLITE_BUSY_TIMEOUT)
            .map_err(map_sqlite_err)?;
        migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, LedgerError> {
        self.conn.lock().map_err(|_| LedgerError::Unavailable {
            reason: "sqlite ledger lock poisoned".to_string(),
        })
    }
}

fn migrate(conn: &Connection) -> Result<(), LedgerError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS idem_schema_migrations (
          version INTEGER PRIMARY KEY,
          name TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS idempotency_claims (
          endpoint_id TEXT NOT NULL,
          idempotency_key TEXT NOT NULL,
          claim_token TEXT NOT NULL,
          status TEXT NOT NULL CHECK (status IN ('PENDING', 'COMMITTED', 'FAILED')),
          payload_fingerprint TEXT NOT NULL,
          response_status INTEGER,
          response_content_type TEXT,
          response_body BLOB,
          attempt INTEGER NOT NULL,
          created_at_ns INTEGER NOT NULL,
          claimed_at_ns INTEGER NOT NULL,
          committed_at_ns INTEGER,
          expires_at_ns INTEGER NOT NULL,
          UNIQUE (endpoint_id, idempotency_key)
        );
        CREATE INDEX IF NOT EXISTS idempotency_claims_expires_at
          ON idempotency_claims (expires_at_ns);
        "#,
    )
    .map_err(map_sqlite_err)?;
    conn.execute(
        "INSERT OR IGNORE INTO idem_schema_migrations (version, name) VALUES (?1, ?2)",
        params![SQLITE_LEDGER_SCHEMA_VERSION, "idempotency_claims"],
    )
    .map_err(map_sqlite_err)?;
    let current: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM idem_schema_migrations",
            [],
            |r| r.get(0),
        )
        .map_err(map_sqlite_err)?;
    if current > SQLITE_LEDGER_SCHEMA_VERSION {
        return Err(LedgerError::Corrupt {
            reason: format!(
                "ledger schema version {current} is newer than supported {SQLITE_LEDGER_SCHEMA_VERSION}"
            ),
        });
    }
    Ok(())
}

fn map_sqlite_err(err: rusqlite::Error) -> LedgerError {
    LedgerError::Unavailable {
        reason: format!("sqlite ledger: {err}"),
    }
}

fn ns_to_sql(t: MonotonicTimeNs) -> Result<i64, LedgerError> {
    i64::try_from(t.0).map_err(|_| {
        LedgerError::ContractViolation(ContractViolation::InvalidValue {
            field: "claim_record.timestamp",
            reason: "must fit in a signed 64-bit column",
        })
    })
}

fn sql_to_ns(field: &str, v: i64) -> Result<MonotonicTimeNs, LedgerError> {
    u64::try_from(v)
        .map(MonotonicTimeNs)
        .map_err(|_| LedgerError::Corrupt {
            reason: format!("{field} is negative"),
        })
}

struct RawClaimRow {
    endpoint_id: String,
    idempotency_key: String,
    claim_token: String,
    status: String,
    payload_fingerprint: String,
    response_status: Option<i64>,
    response_content_type: Option<String>,
    response_body: Option<Vec<u8>>,
    attempt: i64,
    created_at_ns: i64,
    claimed_at_ns: i64,
    committed_at_ns: Option<i64>,
    expires_at_ns: i64,
}

fn map_raw_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawClaimRow> {
    Ok(RawClaimRow {
        endpoint_id: row.get(0)?,
        idempotency_key: row.get(1)?,
        claim_token: row.get(2)?,
        status: row.get(3)?,
        payload_fingerprint: row.get(4)?,
        response_status: row.get(5)?,
        response_content_type: row.get(6)?,
        response_body: row.get(7)?,
        attempt: row.get(8)?,
        created_at_ns: row.get(9)?,
        claimed_at_ns: row.get(10)?,
        committed_at_ns: row.get(11)?,
        expires_at_ns: row.get(12)?,
    })
}

fn corrupt(v: ContractViolation) -> LedgerError {
    LedgerError::Corrupt {
        reason: v.to_string(),
    }
}

impl RawClaimRow {
    fn into_record(self) -> Result<ClaimRecord, LedgerError> {
        let key = ScopedKey::new(
            EndpointId::new(self.endpoint_id).map_err(corrupt)?,
            IdempotencyKey::new(self.idempotency_key).map_err(corrupt)?,
        );
        let response = match (
            self.response_status,
            self.response_content_type,
            self.response_body,
        ) {
            (Some(status), Some(content_type), Some(body)) => {
                let status = u16::try_from(status).map_err(|_| LedgerError::Corrupt {
                    reason: "response_status out of range".to_string(),
                })?;
                Some(ResponseEnvelope::v1(status, content_type, body).map_err(corrupt)?)
            }
            (None, None, None) => None,
            _ => {
                return Err(LedgerError::Corrupt {
                    reason: "partial response columns".to_string(),
                })
            }
        };
        let attempt = u32::try_from(self.attempt).map_err(|_| LedgerError::Corrupt {
            reason: "attempt out of range".to_string(),
        })?;
        let committed_at = self
            .committed_at_ns
            .map(|v| sql_to_ns("committed_at_ns", v))
            .transpose()?;
        ClaimRecord::from_parts_v1(
            key,
            ClaimToken::new(self.claim_token).map_err(corrupt)?,
            ClaimStatus::parse(&self.status).map_err(corrupt)?,
            PayloadFingerprint::new(self.payload_fingerprint).map_err(corrupt)?,
            response,
            attempt,
            sql_to_ns("created_at_ns", self.created_at_ns)?,
            sql_to_ns("claimed_at_ns", self.claimed_at_ns)?,
            committed_at,
            sql_to_ns("expires_at_ns", self.expires_at_ns)?,
        )
        .map_err(corrupt)
    }
}

fn read_row(conn: &Connection, key: &ScopedKey) -> Result<Option<ClaimRecord>, LedgerError> {
    let sql = format!(
        "SELECT {SELECT_COLUMNS} FROM idempotency_claims \
         WHERE endpoint_id = ?1 AND idempotency_key = ?2"
    );
    conn.query_row(
        &sql,
        params![key.endpoint_id.as_str(), key.idempotency_key.as_str()],
        map_raw_row,
    )
    .optional()
    .map_err(map_sqlite_err)?
    .map(RawClaimRow::into_record)
    .transpose()
}

/// Inserts a Pending row. Returns false when the unique key already holds a row.
fn insert_row(conn: &Connection, r: &ClaimRecord) -> Result<bool, LedgerError> {
    let inserted = conn.execute(
        "INSERT INTO idempotency_claims
         (endpoint_id, idempotency_key, claim_token, status, payload_fingerprint,
          response_status, response_content_type, response_body, attempt,
          created_at_ns, claimed_at_ns, committed_at_ns, expires_at_ns)
         VALUES (?1, ?2, ?3, 'PENDING', ?4, NULL, NULL, NULL, ?5, ?6, ?7, NULL, ?8)",
        params![
            r.key.endpoint_id.as_str(),
            r.key.idempotency_key.as_str(),
            r.claim_token.as_str(),
            r.payload_fingerprint.as_str(),
            i64::from(r.attempt),
            ns_to_sql(r.created_at)?,
            ns_to_sql(r.claimed_at)?,
            ns_to_sql(r.expires_at)?,
        ],
    );
    match inserted {
        Ok(_) => Ok(true),
        Err(rusqlite::Error::SqliteFailure(err, _))
            if err.code == ErrorCode::ConstraintViolation =>
        {
            Ok(false)
        }
        Err(e) => Err(map_sqlite_err(e)),
    }
}

fn read_existing(conn: &Connection, key: &ScopedKey) -> Result<ClaimRecord, LedgerError> {
    read_row(conn, key)?.ok_or_else(|| LedgerError::Corrupt {
        reason: "unique violation without a visible row".to_string(),
    })
}

/// Overwrites a record with a fresh Pending claim, guarded on the token being replaced.
fn replace_with_pending(
    conn: &Connection,
    previous_token: &ClaimToken,
    r: &ClaimRecord,
) -> Result<usize, LedgerError> {
    conn.execute(
        "UPDATE idempotency_claims
         SET claim_token = ?3, status = 'PENDING', payload_fingerprint = ?4,
             response_status = NULL, response_content_type = NULL, response_body = NULL,
             attempt = ?5, created_at_ns = ?6, claimed_at_ns = ?7, committed_at_ns = NULL,
             expires_at_ns = ?8
         WHERE endpoint_id = ?1 AND idempotency_key = ?2 AND claim_token = ?9",
        params![
            r.key.endpoint_id.as_str(),
            r.key.idempotency_key.as_str(),
            r.claim_token.as_str(),
            r.payload_fingerprint.as_str(),
            i64::from(r.attempt),
            ns_to_sql(r.created_at)?,
            ns_to_sql(r.claimed_at)?,
            ns_to_sql(r.expires_at)?,
            previous_token.as_str(),
        ],
    )
    .map_err(map_sqlite_err)
}

impl DurableLedger for SqliteLedger {
    fn claim(&self, attempt: &ClaimAttempt) -> Result<ClaimOutcome, LedgerError> {
        attempt.validate()?;
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(map_sqlite_err)?;

        let outcome = match read_row(&tx, &attempt.key)? {
            None => {
                let record = ClaimRecord::pending_v1(attempt)?;
                if insert_row(&tx, &record)? {
                    ClaimOutcome::Claimed(record)
                } else {
                    ClaimOutcome::Conflict(read_existing(&tx, &attempt.key)?)
                }
            }
            Some(existing) if existing.is_expired(attempt.now) => {
                let record = ClaimRecord::pending_v1(attempt)?;
                replace_with_pending(&tx, &existing.claim_token, &record)?;
                ClaimOutcome::Claimed(record)
            }
            Some(existing) if existing.status == ClaimStatus::Failed => {
                let record = existing.superseding_v1(attempt)?;
                replace_with_pending(&tx, &existing.claim_token, &record)?;
                ClaimOutcome::Claimed(record)
            }
            Some(existing) => ClaimOutcome::Conflict(existing),
        };

        tx.commit().map_err(map_sqlite_err)?;
        Ok(outcome)
    }

    fn supersede(
        &self,
        stale: &ClaimRecord,
        attempt: &ClaimAttempt,
    ) -> Result<ClaimOutcome, LedgerError> {
        attempt.validate()?;
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(map_sqlite_err)?;

        let outcome = match read_row(&tx, &attempt.key)? {
            None => {
                let record = ClaimRecord::pending_v1(attempt)?;
                if insert_row(&tx, &record)? {
                    ClaimOutcome::Claimed(record)
                } else {
                    ClaimOutcome::Conflict(read_existing(&tx, &attempt.key)?)
                }
            }
            Some(existing) if existing.is_expired(attempt.now) => {
                let record = ClaimRecord::pending_v1(attempt)?;
                replace_with_pending(&tx, &existing.claim_token, &record)?;
                ClaimOutcome::Claimed(record)
            }
            Some(existing)
                if existing.claim_token == stale.claim_token
                    && existing.status != ClaimStatus::Committed =>
            {
                let record = existing.superseding_v1(attempt)?;
                replace_with_pending(&tx, &existing.claim_token, &record)?;
                ClaimOutcome::Claimed(record)
            }
            Some(existing) => ClaimOutcome::Conflict(existing),
        };

        tx.commit().map_err(map_sqlite_err)?;
        Ok(outcome)
    }

    fn commit(
        &self,
        key: &ScopedKey,
        token: &ClaimToken,
        envelope: &ResponseEnvelope,
        now: MonotonicTimeNs,
        expires_at: MonotonicTimeNs,
    ) -> Result<ClaimRecord, LedgerError> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(map_sqlite_err)?;

        let committed = match read_row(&tx, key)? {
            Some(r) if r.claim_token == *token && r.status == ClaimStatus::Pending => {
                r.committed(envelope.clone(), now, expires_at)?
            }
            _ => {
                return Err(LedgerError::ClaimLost {
                    key: key.cache_key(),
                })
            }
        };
        let updated = tx
            .execute(
                "UPDATE idempotency_claims
                 SET status = 'COMMITTED', response_status = ?4, response_content_type = ?5,
                     response_body = ?6, committed_at_ns = ?7, expires_at_ns = ?8
                 WHERE endpoint_id = ?1 AND idempotency_key = ?2 AND claim_token = ?3
                   AND status = 'PENDING'",
                params![
                    key.endpoint_id.as_str(),
                    key.idempotency_key.as_str(),
                    token.as_str(),
                    i64::from(envelope.status_code),
                    envelope.content_type.as_str(),
                    envelope.body.as_slice(),
                    ns_to_sql(now)?,
                    ns_to_sql(expires_at)?,
                ],
            )
            .map_err(map_sqlite_err)?;
        if updated != 1 {
            return Err(LedgerError::ClaimLost {
                key: key.cache_key(),
            });
        }
        tx.commit().map_err(map_sqlite_err)?;
        Ok(committed)
    }

    fn abandon(
        &self,
        key: &ScopedKey,
        token: &ClaimToken,
        _now: MonotonicTimeNs,
    ) -> Result<bool, LedgerError> {
        let conn = self.lock()?;
        let updated = conn
            .execute(
                "UPDATE idempotency_claims SET status = 'FAILED'
                 WHERE endpoint_id = ?1 AND idempotency_key = ?2 AND claim_token = ?3
                   AND status = 'PENDING'",
                params![
                    key.endpoint_id.as_str(),
                    key.idempotency_key.as_str(),
                    token.as_str()
                ],
            )
            .map_err(map_sqlite_err)?;
        Ok(updated == 1)
    }

    fn read(&self, key: &ScopedKey) -> Result<Option<ClaimRecord>, LedgerError> {
        let conn = self.lock()?;
        read_row(&conn, key)
    }

    fn read_expired(
        &self,
        now: MonotonicTimeNs,
        limit: usize,
    ) -> Result<Vec<ClaimRecord>, LedgerError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM idempotency_claims \
             WHERE expires_at_ns <= ?1 ORDER BY expires_at_ns LIMIT ?2"
        );
        let mut stmt = conn.prepare(&sql).map_err(map_sqlite_err)?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt
            .query_map(params![ns_to_sql(now)?, limit], map_raw_row)
            .map_err(map_sqlite_err)?;
        let mut out = Vec::new();
        for raw in rows {
            out.push(raw.map_err(map_sqlite_err)?.into_record()?);
        }
        Ok(out)
    }

    fn delete_expired(
        &self,
        key: &ScopedKey,
        now: MonotonicTimeNs,
    ) -> Result<bool, LedgerError> {
        let conn = self.lock()?;
        let deleted = conn
            .execute(
                "DELETE FROM idempotency_claims
                 WHERE endpoint_id = ?1 AND idempotency_key = ?2 AND expires_at_ns <= ?3",
                params![
                    key.endpoint_id.as_str(),
                    key.idempotency_key.as_str(),
                    ns_to_sql(now)?
                ],
            )
            .map_err(map_sqlite_err)?;
        Ok(deleted == 1)
    }
}
