//! Persistence for the stall reservation lifecycle.
//!
//! Three stores own one entity each: [`StallRegistry`] for stalls,
//! [`RequestStore`] for citizen requests and [`OrderStore`] for reservation
//! orders. Every state change is a conditional single-document update, which
//! is what keeps concurrent postulations and sweeps consistent without
//! cross-document transactions.

pub mod error;
pub mod memory;
pub mod order;
pub mod person;
pub mod postgres;
pub mod request;
pub mod stall;
pub mod store;

pub use error::{Result, StoreError};
pub use memory::{FailPoint, InMemoryStore};
pub use order::{
    DEFAULT_APPROVAL_GRACE_HOURS, ExternalPayment, IntegratedPayment, LedgerPayment,
    ManualPayment, NewOrder, OrderPatch, OrderReference, OrderState, ReservationOrder,
};
pub use person::{Citizen, Occupant};
pub use postgres::PostgresStore;
pub use request::{NewRequest, Request, RequestPatch, RequestState};
pub use stall::{NewStall, Stall, StallState};
pub use store::{OrderStore, RequestStore, ReservationStore, StallRegistry};
