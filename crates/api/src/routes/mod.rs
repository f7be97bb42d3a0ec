//! HTTP route handlers.

pub mod health;
pub mod orders;
pub mod requests;
pub mod stalls;
pub mod sweeper;

use crate::error::ApiError;

/// Parses a UUID path segment into a typed id.
pub(crate) fn parse_id<T: std::str::FromStr>(raw: &str, what: &str) -> Result<T, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid {what} id: {raw}")))
}
