#![forbid(unsafe_code)]

pub mod clock;
pub mod coordinator;
pub mod executor;
pub mod sweep;

pub use clock::{Clock, ManualClock, SystemClock};
pub use coordinator::{
    Disposition, ExecuteOutcome, IdempotencyCoordinator, IdempotencyError, IdempotentWriteRequest,
    ReplaySource,
};
pub use executor::{ExecutorError, MessageSendExecutor, WriteExecutor};
pub use sweep::{ExpirySweep, SweepPassMetrics};
