//! Periodic synchronization of every configured source into the store.

mod backoff;
mod clock;
mod handle;
mod orchestrator;
mod scheduler;

#[cfg(test)]
pub(crate) mod test_support;

pub use backoff::BackoffPolicy;
pub use clock::{Clock, ManualClock, SystemClock};
pub use handle::{SourceStatus, SyncCommand, SyncHandle, SyncHandleError, SyncStatus};
pub use orchestrator::{Health, SourceOutcome, SourceReport, SyncError, SyncOrchestrator, TickReport};
pub use scheduler::{create_scheduler, SyncScheduler};
