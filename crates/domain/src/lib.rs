//! Domain layer for the stall reservation lifecycle.
//!
//! This crate provides:
//! - The closed error taxonomy shared by every service ([`DomainError`], [`ErrorKind`])
//! - Request creation and cancellation ([`RequestService`])
//! - Order approval and rejection ([`ApprovalService`])
//! - Order lookup by id or zero-padded reference ([`OrderLocator`])

pub mod approval;
pub mod error;
pub mod locator;
pub mod requests;

pub use approval::ApprovalService;
pub use error::{DomainError, ErrorKind, Result};
pub use locator::OrderLocator;
pub use requests::RequestService;
