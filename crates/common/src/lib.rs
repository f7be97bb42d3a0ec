//! Shared identifiers and time source for the stall reservation system.

pub mod clock;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use types::{BlockId, MarketId, OrderId, RequestId, StallId};
