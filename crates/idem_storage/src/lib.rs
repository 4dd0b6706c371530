#![forbid(unsafe_code)]

pub mod key_store;
pub mod ledger;
pub mod sqlite_ledger;

pub use key_store::{CacheEntry, InMemoryKeyStore, KeyStore, KeyStoreError, NullKeyStore};
pub use ledger::{ClaimOutcome, DurableLedger, InMemoryLedger, LedgerError};
pub use sqlite_ledger::SqliteLedger;
