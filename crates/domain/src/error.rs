//! Domain error types.

use common::StallId;
use serde::Serialize;
use store::{StallState, StoreError};
use thiserror::Error;

/// Closed classification of domain failures.
///
/// Callers branch on the kind rather than on messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad input or a transition requested from the wrong state.
    Validation,
    NotFound,
    /// A concurrent claim won the stall first. Retryable.
    Conflict,
    /// The citizen or stall already takes part in an active request, order or occupation.
    DuplicateClaim,
    /// An external collaborator (registration, ledger) failed.
    External,
    /// Storage or other infrastructure failure.
    Infrastructure,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::DuplicateClaim => "duplicate_claim",
            ErrorKind::External => "external",
            ErrorKind::Infrastructure => "infrastructure",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur during domain operations.
#[derive(Debug, Error)]
pub enum DomainError {
    /// Invalid input.
    #[error("Invalid input: {0}")]
    Validation(String),

    /// The entity is not in a state that allows the requested transition.
    #[error("{entity} {id} is in state {actual}, expected one of [{expected}]")]
    InvalidState {
        entity: &'static str,
        id: String,
        expected: String,
        actual: String,
    },

    /// The stall is not free for a new request.
    #[error("Stall {stall_id} is not available (state {state})")]
    StallNotFree { stall_id: StallId, state: StallState },

    /// Another postulation reserved the stall first.
    #[error("Stall {0} was claimed concurrently")]
    StallClaimed(StallId),

    /// Entity not found.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// The citizen or stall already holds an active claim.
    #[error("Duplicate claim: {0}")]
    DuplicateClaim(String),

    /// A store error with no domain meaning.
    #[error("Store error: {0}")]
    Store(StoreError),
}

impl DomainError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        DomainError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            DomainError::Validation(_)
            | DomainError::InvalidState { .. }
            | DomainError::StallNotFree { .. } => ErrorKind::Validation,
            DomainError::StallClaimed(_) => ErrorKind::Conflict,
            DomainError::NotFound { .. } => ErrorKind::NotFound,
            DomainError::DuplicateClaim(_) => ErrorKind::DuplicateClaim,
            DomainError::Store(_) => ErrorKind::Infrastructure,
        }
    }

    /// True only for lost races on the stall claim.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }
}

impl From<StoreError> for DomainError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { entity, id } => DomainError::NotFound { entity, id },
            StoreError::StateConflict {
                entity,
                id,
                expected,
                actual,
            } => DomainError::InvalidState {
                entity,
                id,
                expected,
                actual,
            },
            other => DomainError::Store(other),
        }
    }
}

/// Convenience type alias for domain results.
pub type Result<T> = std::result::Result<T, DomainError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_map_to_kinds() {
        let missing: DomainError = StoreError::NotFound {
            entity: "Order",
            id: "0007".into(),
        }
        .into();
        assert_eq!(missing.kind(), ErrorKind::NotFound);

        let conflict: DomainError = StoreError::StateConflict {
            entity: "Order",
            id: "0007".into(),
            expected: "EN_SOLICITUD".into(),
            actual: "ASIGNADA".into(),
        }
        .into();
        assert_eq!(conflict.kind(), ErrorKind::Validation);
        assert!(!conflict.is_retryable());

        let corrupt: DomainError = StoreError::Corrupt("bad".into()).into();
        assert_eq!(corrupt.kind(), ErrorKind::Infrastructure);
    }

    #[test]
    fn only_lost_claims_are_retryable() {
        assert!(DomainError::StallClaimed(StallId::new()).is_retryable());
        assert!(!DomainError::DuplicateClaim("x".into()).is_retryable());
        assert!(!DomainError::Validation("x".into()).is_retryable());
    }

    #[test]
    fn kind_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&ErrorKind::DuplicateClaim).unwrap(),
            "\"duplicate_claim\""
        );
        assert_eq!(ErrorKind::NotFound.to_string(), "not_found");
    }
}
