#![forbid(unsafe_code)]

use std::sync::Arc;
use std::thread;

use idem_kernel_contracts::envelope::{CachedReplay, ResponseEnvelope};
use idem_kernel_contracts::idempotency::PayloadFingerprint;
use idem_kernel_contracts::MonotonicTimeNs;
use idem_storage::{CacheEntry, InMemoryKeyStore, KeyStore, NullKeyStore};

fn ms(v: u64) -> MonotonicTimeNs {
    MonotonicTimeNs(v * 1_000_000)
}

fn replay_bytes(body: &str) -> Vec<u8> {
    CachedReplay::v1(
        PayloadFingerprint::new("c".repeat(64)).unwrap(),
        ResponseEnvelope::json_v1(201, body.as_bytes().to_vec()).unwrap(),
    )
    .unwrap()
    .encode()
}

#[test]
fn at_keystore_db_01_cached_replay_round_trips_through_store() {
    let store: Arc<dyn KeyStore> = Arc::new(InMemoryKeyStore::new(16));
    let bytes = replay_bytes(r#"{"message_id":"msg_abc"}"#);
    store
        .set_with_expiry(
            CacheEntry::v1("messages.send:abc123xyz".into(), bytes.clone(), 600_000).unwrap(),
            ms(1_000),
        )
        .unwrap();

    let hit = store.get("messages.send:abc123xyz", ms(2_000)).unwrap().unwrap();
    assert_eq!(hit, bytes);
    let decoded = CachedReplay::decode(&hit).unwrap();
    assert_eq!(decoded.envelope.body, br#"{"message_id":"msg_abc"}"#.to_vec());

    assert_eq!(store.get("messages.send:abc123xyz", ms(601_000)).unwrap(), None);
}

#[test]
fn at_keystore_db_02_concurrent_writers_converge_on_identical_value() {
    let store = Arc::new(InMemoryKeyStore::new(16));
    let bytes = replay_bytes(r#"{"message_id":"msg_same"}"#);
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let store = store.clone();
            let bytes = bytes.clone();
            thread::spawn(move || {
                store
                    .set_with_expiry(
                        CacheEntry::v1("messages.send:k".into(), bytes, 60_000).unwrap(),
                        ms(1),
                    )
                    .unwrap();
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(store.len(), 1);
    assert_eq!(store.get("messages.send:k", ms(2)).unwrap(), Some(bytes));
}

#[test]
fn at_keystore_db_03_null_store_is_a_permanent_miss() {
    let store: Arc<dyn KeyStore> = Arc::new(NullKeyStore);
    store
        .set_with_expiry(
            CacheEntry::v1("messages.send:k".into(), replay_bytes("{}"), 60_000).unwrap(),
            ms(1),
        )
        .unwrap();
    assert_eq!(store.get("messages.send:k", ms(2)).unwrap(), None);
}
