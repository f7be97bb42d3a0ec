use thiserror::Error;

/// Errors that can occur when interacting with the reservation stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The document does not exist.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// A conditional update found the document in a state other than the
    /// expected one. Nothing was written.
    #[error("{entity} {id} is in state {actual}, expected one of [{expected}]")]
    StateConflict {
        entity: &'static str,
        id: String,
        expected: String,
        actual: String,
    },

    /// An order with the same human-readable reference already exists.
    #[error("Order reference already exists: {0}")]
    DuplicateReference(String),

    /// A stored value could not be decoded into the domain model.
    #[error("Corrupt stored value: {0}")]
    Corrupt(String),

    /// The backend could not serve the call; retrying later may succeed.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub(crate) fn not_found(entity: &'static str, id: impl ToString) -> Self {
        StoreError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub(crate) fn state_conflict<S: std::fmt::Display>(
        entity: &'static str,
        id: impl ToString,
        expected: &[S],
        actual: S,
    ) -> Self {
        let expected = expected
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        StoreError::StateConflict {
            entity,
            id: id.to_string(),
            expected,
            actual: actual.to_string(),
        }
    }

    /// Returns true if the error means a conditional precondition did not hold.
    pub fn is_state_conflict(&self) -> bool {
        matches!(self, StoreError::StateConflict { .. })
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
