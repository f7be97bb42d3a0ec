//! Background jobs of the reservation lifecycle.
//!
//! This crate provides:
//! - [`PeriodicJob`], a single-flight interval runner for any [`Job`]
//! - [`ExpirationSweeper`], which expires unapproved orders, releases finished
//!   occupations and frees orphaned reservations
//! - [`DebtFeed`], which approves pending orders the debt ledger reports as paid

pub mod debt_feed;
pub mod error;
pub mod job;
pub mod sweeper;

pub use debt_feed::{
    DebtFeed, DebtLedger, FeedReport, HttpDebtLedger, InMemoryDebtLedger, LedgerConfig,
    LedgerRecord, SETTLED_STATUSES,
};
pub use error::{Result, SchedulerError};
pub use job::{Job, PeriodicJob, TickOutcome};
pub use sweeper::{ExpirationSweeper, SweepReport};
