#![forbid(unsafe_code)]

use std::sync::{Arc, Barrier};
use std::thread;

use idem_kernel_contracts::envelope::ResponseEnvelope;
use idem_kernel_contracts::idempotency::{
    ClaimAttempt, ClaimStatus, ClaimToken, EndpointId, IdempotencyKey, PayloadFingerprint,
    ScopedKey,
};
use idem_kernel_contracts::MonotonicTimeNs;
use idem_storage::{ClaimOutcome, DurableLedger, InMemoryLedger, LedgerError, SqliteLedger};

const TTL_MS: u64 = 600_000;

fn ms(v: u64) -> MonotonicTimeNs {
    MonotonicTimeNs(v * 1_000_000)
}

fn key(k: &str) -> ScopedKey {
    ScopedKey::new(
        EndpointId::new("messages.send").unwrap(),
        IdempotencyKey::new(k).unwrap(),
    )
}

fn token(n: u32) -> ClaimToken {
    ClaimToken::new(format!("{n:032x}")).unwrap()
}

fn fingerprint(c: char) -> PayloadFingerprint {
    PayloadFingerprint::new(c.to_string().repeat(64)).unwrap()
}

fn attempt(k: &str, t: u32, now_ms: u64) -> ClaimAttempt {
    ClaimAttempt::v1(key(k), token(t), fingerprint('a'), ms(now_ms), TTL_MS).unwrap()
}

fn envelope(body: &str) -> ResponseEnvelope {
    ResponseEnvelope::json_v1(201, body.as_bytes().to_vec()).unwrap()
}

fn ledgers() -> Vec<(&'static str, Box<dyn DurableLedger>)> {
    vec![
        ("memory", Box::new(InMemoryLedger::new())),
        ("sqlite", Box::new(SqliteLedger::open_in_memory().unwrap())),
    ]
}

#[test]
fn at_ledger_db_01_first_claim_wins_second_conflicts() {
    for (name, l) in ledgers() {
        let first = l.claim(&attempt("abc123xyz", 1, 1_000)).unwrap();
        let ClaimOutcome::Claimed(record) = first else {
            panic!("{name}: first claim must win");
        };
        assert_eq!(record.status, ClaimStatus::Pending);
        assert_eq!(record.attempt, 1);

        match l.claim(&attempt("abc123xyz", 2, 1_001)).unwrap() {
            ClaimOutcome::Conflict(existing) => {
                assert_eq!(existing.claim_token, token(1), "{name}");
                assert_eq!(existing.status, ClaimStatus::Pending, "{name}");
            }
            other => panic!("{name}: expected conflict, got {other:?}"),
        }
    }
}

#[test]
fn at_ledger_db_02_keys_are_scoped_per_endpoint() {
    for (name, l) in ledgers() {
        l.claim(&attempt("shared", 1, 1_000)).unwrap();
        let other_endpoint = ClaimAttempt::v1(
            ScopedKey::new(
                EndpointId::new("files.sync").unwrap(),
                IdempotencyKey::new("shared").unwrap(),
            ),
            token(2),
            fingerprint('a'),
            ms(1_000),
            TTL_MS,
        )
        .unwrap();
        assert!(
            matches!(l.claim(&other_endpoint).unwrap(), ClaimOutcome::Claimed(_)),
            "{name}"
        );
    }
}

#[test]
fn at_ledger_db_03_commit_is_fenced_on_token_and_write_once() {
    for (name, l) in ledgers() {
        l.claim(&attempt("k", 1, 1_000)).unwrap();

        let lost = l.commit(&key("k"), &token(9), &envelope("{}"), ms(1_100), ms(601_100));
        assert!(matches!(lost, Err(LedgerError::ClaimLost { .. })), "{name}");

        let committed = l
            .commit(
                &key("k"),
                &token(1),
                &envelope(r#"{"message_id":"msg_1"}"#),
                ms(1_100),
                ms(601_100),
            )
            .unwrap();
        assert_eq!(committed.status, ClaimStatus::Committed);
        assert_eq!(committed.expires_at, ms(601_100));

        let again = l.commit(
            &key("k"),
            &token(1),
            &envelope(r#"{"message_id":"msg_2"}"#),
            ms(1_200),
            ms(601_200),
        );
        assert!(matches!(again, Err(LedgerError::ClaimLost { .. })), "{name}");

        let stored = l.read(&key("k")).unwrap().unwrap();
        assert_eq!(
            stored.response.unwrap().body,
            br#"{"message_id":"msg_1"}"#.to_vec(),
            "{name}"
        );
    }
}

#[test]
fn at_ledger_db_04_abandon_leaves_tombstone_that_reclaims_immediately() {
    for (name, l) in ledgers() {
        l.claim(&attempt("k", 1, 1_000)).unwrap();
        assert!(!l.abandon(&key("k"), &token(2), ms(1_010)).unwrap(), "{name}");
        assert!(l.abandon(&key("k"), &token(1), ms(1_010)).unwrap(), "{name}");
        assert_eq!(
            l.read(&key("k")).unwrap().unwrap().status,
            ClaimStatus::Failed
        );

        match l.claim(&attempt("k", 2, 1_020)).unwrap() {
            ClaimOutcome::Claimed(r) => {
                assert_eq!(r.attempt, 2, "{name}");
                assert_eq!(r.claim_token, token(2), "{name}");
                assert_eq!(r.created_at, ms(1_000), "{name}");
            }
            other => panic!("{name}: failed tombstone must be reclaimable, got {other:?}"),
        }
    }
}

#[test]
fn at_ledger_db_05_supersede_is_compare_and_swap() {
    for (name, l) in ledgers() {
        let ClaimOutcome::Claimed(stale) = l.claim(&attempt("k", 1, 1_000)).unwrap() else {
            panic!("{name}: claim");
        };

        let won = l.supersede(&stale, &attempt("k", 2, 40_000)).unwrap();
        assert!(matches!(won, ClaimOutcome::Claimed(ref r) if r.attempt == 2), "{name}");

        // A second recoverer holding the same stale snapshot loses.
        match l.supersede(&stale, &attempt("k", 3, 40_001)).unwrap() {
            ClaimOutcome::Conflict(current) => assert_eq!(current.claim_token, token(2)),
            other => panic!("{name}: expected conflict, got {other:?}"),
        }

        // The superseded claimant can neither commit nor abandon.
        assert!(matches!(
            l.commit(&key("k"), &token(1), &envelope("{}"), ms(40_002), ms(640_002)),
            Err(LedgerError::ClaimLost { .. })
        ));
        assert!(!l.abandon(&key("k"), &token(1), ms(40_002)).unwrap());
    }
}

#[test]
fn at_ledger_db_06_supersede_never_replaces_committed() {
    for (name, l) in ledgers() {
        let ClaimOutcome::Claimed(pending) = l.claim(&attempt("k", 1, 1_000)).unwrap() else {
            panic!("{name}: claim");
        };
        l.commit(&key("k"), &token(1), &envelope("{}"), ms(1_001), ms(601_001))
            .unwrap();
        assert!(
            matches!(
                l.supersede(&pending, &attempt("k", 2, 50_000)).unwrap(),
                ClaimOutcome::Conflict(ref r) if r.status == ClaimStatus::Committed
            ),
            "{name}"
        );
    }
}

#[test]
fn at_ledger_db_07_expired_record_is_claimable_as_new_operation() {
    for (name, l) in ledgers() {
        l.claim(&attempt("k", 1, 1_000)).unwrap();
        l.commit(&key("k"), &token(1), &envelope("{}"), ms(1_001), ms(601_001))
            .unwrap();

        match l.claim(&attempt("k", 2, 601_001)).unwrap() {
            ClaimOutcome::Claimed(r) => {
                assert_eq!(r.attempt, 1, "{name}");
                assert_eq!(r.created_at, ms(601_001), "{name}");
                assert!(r.response.is_none(), "{name}");
            }
            other => panic!("{name}: expected fresh claim, got {other:?}"),
        }
    }
}

#[test]
fn at_ledger_db_08_expiry_scan_and_conditional_delete() {
    for (name, l) in ledgers() {
        l.claim(&attempt("old", 1, 1_000)).unwrap();
        l.claim(&attempt("new", 2, 500_000)).unwrap();

        let now = ms(601_000);
        let expired = l.read_expired(now, 10).unwrap();
        assert_eq!(expired.len(), 1, "{name}");
        assert_eq!(expired[0].key, key("old"));

        // Re-claimed between scan and delete: the delete must not remove it.
        l.claim(&attempt("old", 3, 601_000)).unwrap();
        assert!(!l.delete_expired(&key("old"), now).unwrap(), "{name}");
        assert!(l.read(&key("old")).unwrap().is_some(), "{name}");

        assert!(l.delete_expired(&key("new"), ms(1_100_000)).unwrap(), "{name}");
        assert!(l.read(&key("new")).unwrap().is_none(), "{name}");
    }
}

#[test]
fn at_ledger_db_09_concurrent_claims_have_exactly_one_winner() {
    let ledgers: Vec<Arc<dyn DurableLedger>> = vec![
        Arc::new(InMemoryLedger::new()),
        Arc::new(SqliteLedger::open_in_memory().unwrap()),
    ];
    for l in ledgers {
        let barrier = Arc::new(Barrier::new(16));
        let handles: Vec<_> = (0..16u32)
            .map(|i| {
                let l = l.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    l.claim(&attempt("race", i + 1, 1_000)).unwrap()
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|o| matches!(o, ClaimOutcome::Claimed(_)))
            .count();
        assert_eq!(winners, 1);
    }
}

#[test]
fn at_ledger_db_10_in_memory_outage_fails_closed() {
    let l = InMemoryLedger::new();
    l.set_available(false);
    assert!(matches!(
        l.claim(&attempt("k", 1, 1_000)),
        Err(LedgerError::Unavailable { .. })
    ));
    l.set_available(true);
    assert!(matches!(
        l.claim(&attempt("k", 1, 1_000)),
        Ok(ClaimOutcome::Claimed(_))
    ));
}

#[test]
fn at_ledger_db_11_sqlite_commit_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.db");
    {
        let l = SqliteLedger::open(&path).unwrap();
        l.claim(&attempt("durable", 1, 1_000)).unwrap();
        l.commit(
            &key("durable"),
            &token(1),
            &envelope(r#"{"message_id":"msg_durable"}"#),
            ms(1_001),
            ms(601_001),
        )
        .unwrap();
    }
    let reopened = SqliteLedger::open(&path).unwrap();
    let r = reopened.read(&key("durable")).unwrap().unwrap();
    assert_eq!(r.status, ClaimStatus::Committed);
    assert_eq!(
        r.response.unwrap().body,
        br#"{"message_id":"msg_durable"}"#.to_vec()
    );
    assert!(matches!(
        reopened.claim(&attempt("durable", 2, 2_000)).unwrap(),
        ClaimOutcome::Conflict(_)
    ));
}

#[test]
fn at_ledger_db_12_connections_sharing_a_file_have_one_winner() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shared.db");
    let connections: Vec<Arc<SqliteLedger>> = (0..8)
        .map(|_| Arc::new(SqliteLedger::open(&path).unwrap()))
        .collect();

    for round in 0..10u32 {
        let barrier = Arc::new(Barrier::new(connections.len()));
        let handles: Vec<_> = connections
            .iter()
            .enumerate()
            .map(|(i, l)| {
                let l = l.clone();
                let barrier = barrier.clone();
                let t = round * 100 + i as u32 + 1;
                thread::spawn(move || {
                    barrier.wait();
                    l.claim(&attempt(&format!("shared-{round}"), t, 1_000)).unwrap()
                })
            })
            .collect();
        let winners: Vec<ClaimToken> = handles
            .into_iter()
            .filter_map(|h| match h.join().unwrap() {
                ClaimOutcome::Claimed(r) => Some(r.claim_token),
                ClaimOutcome::Conflict(_) => None,
            })
            .collect();
        assert_eq!(winners.len(), 1, "round {round}");

        let stored = connections[0]
            .read(&key(&format!("shared-{round}")))
            .unwrap()
            .unwrap();
        assert_eq!(stored.claim_token, winners[0]);
    }
}

#[test]
fn at_ledger_db_13_sqlite_rejects_timestamps_beyond_signed_range() {
    let l = SqliteLedger::open_in_memory().unwrap();
    let far_future = MonotonicTimeNs(i64::MAX as u64 + 1);
    let a = ClaimAttempt::v1(key("far"), token(1), fingerprint('a'), far_future, TTL_MS).unwrap();
    assert!(matches!(
        l.claim(&a),
        Err(LedgerError::ContractViolation(_))
    ));
    assert!(l.read(&key("far")).unwrap().is_none());
}
