//! Scheduler error types.

use thiserror::Error;

/// Errors that can occur in background jobs.
///
/// Per-record failures inside a sweep or a feed batch are logged and counted
/// in the job's report instead of being returned.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// A store call failed outside of any single record.
    #[error("Store error: {0}")]
    Store(#[from] store::StoreError),

    /// The debt ledger could not be read.
    #[error("Debt ledger error: {0}")]
    Ledger(String),
}

/// Result type for scheduler operations.
pub type Result<T> = std::result::Result<T, SchedulerError>;
