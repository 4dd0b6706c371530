#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use idem_kernel_contracts::common::ms_to_ns;
use idem_kernel_contracts::MonotonicTimeNs;

pub trait Clock: Send + Sync {
    fn now(&self) -> MonotonicTimeNs;
}

impl<T: Clock + ?Sized> Clock for Arc<T> {
    fn now(&self) -> MonotonicTimeNs {
        (**self).now()
    }
}

/// Wall clock in nanoseconds since the Unix epoch. Never returns 0 and never
/// goes backwards within one process.
#[derive(Debug, Default)]
pub struct SystemClock {
    last: AtomicU64,
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> MonotonicTimeNs {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
            .unwrap_or(1)
            .max(1);
        let prev = self.last.fetch_max(wall, Ordering::SeqCst);
        MonotonicTimeNs(prev.max(wall))
    }
}

/// Test clock advanced by hand.
#[derive(Debug)]
pub struct ManualClock {
    now_ns: AtomicU64,
}

impl ManualClock {
    pub fn starting_at_ms(ms: u64) -> Self {
        Self {
            now_ns: AtomicU64::new(ms_to_ns(ms).max(1)),
        }
    }

    pub fn advance_ms(&self, ms: u64) {
        self.now_ns.fetch_add(ms_to_ns(ms), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> MonotonicTimeNs {
        MonotonicTimeNs(self.now_ns.load(Ordering::SeqCst))
    }
}
