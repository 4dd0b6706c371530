#![forbid(unsafe_code)]

use idem_kernel_contracts::idempotency::ClaimStatus;
use idem_storage::{DurableLedger, LedgerError};

use crate::clock::Clock;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepPassMetrics {
    pub scanned: u64,
    pub deleted: u64,
    /// Read as expired, then re-claimed before the delete landed.
    pub skipped: u64,
    pub committed: u64,
    pub pending: u64,
    pub failed: u64,
}

impl SweepPassMetrics {
    pub fn absorb(&mut self, other: SweepPassMetrics) {
        self.scanned += other.scanned;
        self.deleted += other.deleted;
        self.skipped += other.skipped;
        self.committed += other.committed;
        self.pending += other.pending;
        self.failed += other.failed;
    }
}

/// Removes records past `expires_at`. Cleanup only: claims already treat an
/// expired record as absent, so a late or skipped pass changes nothing but
/// storage size.
#[derive(Debug)]
pub struct ExpirySweep<L: DurableLedger, C: Clock> {
    ledger: L,
    clock: C,
}

impl<L: DurableLedger, C: Clock> ExpirySweep<L, C> {
    pub fn new(ledger: L, clock: C) -> Self {
        Self { ledger, clock }
    }

    pub fn run_pass(&self, limit: usize) -> Result<SweepPassMetrics, LedgerError> {
        let now = self.clock.now();
        let expired = self.ledger.read_expired(now, limit)?;
        let mut metrics = SweepPassMetrics::default();
        for record in &expired {
            metrics.scanned += 1;
            match record.status {
                ClaimStatus::Committed => metrics.committed += 1,
                ClaimStatus::Pending => metrics.pending += 1,
                ClaimStatus::Failed => metrics.failed += 1,
            }
            if self.ledger.delete_expired(&record.key, now)? {
                metrics.deleted += 1;
            } else {
                metrics.skipped += 1;
            }
        }
        if metrics.scanned > 0 {
            tracing::info!(
                scanned = metrics.scanned,
                deleted = metrics.deleted,
                skipped = metrics.skipped,
                "expiry sweep pass"
            );
        }
        Ok(metrics)
    }
}
