//! Saga error types.

use domain::{DomainError, ErrorKind};
use store::StoreError;
use thiserror::Error;

/// Errors that can occur during saga operations.
#[derive(Debug, Error)]
pub enum SagaError {
    /// A guard, validation or store failure.
    #[error(transparent)]
    Domain(#[from] DomainError),

    /// The external registration failed. Surfaced after compensation.
    #[error("External registration failed: {0}")]
    Registration(String),

    /// The notification gateway failed. Logged, never surfaced by the saga.
    #[error("Notification failed: {0}")]
    Notification(String),

    /// Concurrent postulations kept taking the same order reference.
    #[error("Could not allocate a unique order reference after {attempts} attempts")]
    ReferenceExhausted { attempts: u32 },
}

impl SagaError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SagaError::Domain(e) => e.kind(),
            SagaError::Registration(_) | SagaError::Notification(_) => ErrorKind::External,
            SagaError::ReferenceExhausted { .. } => ErrorKind::Conflict,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }
}

impl From<StoreError> for SagaError {
    fn from(e: StoreError) -> Self {
        SagaError::Domain(e.into())
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
