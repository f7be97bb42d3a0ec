//! Citizen request creation and cancellation.

use std::sync::Arc;

use common::{Clock, RequestId};
use store::{NewRequest, Request, RequestPatch, RequestState, ReservationStore, StallState};

use crate::error::{DomainError, Result};

/// Creates and cancels citizen requests.
///
/// Uniqueness checks here are existence queries, not locks. The conditional
/// stall reservation at postulation time is what actually enforces one claim
/// per stall.
#[derive(Clone)]
pub struct RequestService<S: ReservationStore> {
    store: S,
    clock: Arc<dyn Clock>,
}

impl<S: ReservationStore> RequestService<S> {
    pub fn new(store: S, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Validates and inserts a new request in `Requested`.
    #[tracing::instrument(skip(self, input), fields(stall_id = %input.stall_id))]
    pub async fn create(&self, input: NewRequest) -> Result<Request> {
        if input.start_date > input.end_date {
            return Err(DomainError::Validation(
                "start date must not be after end date".to_string(),
            ));
        }
        let national_id = input.citizen.national_id.trim();
        if national_id.is_empty() {
            return Err(DomainError::Validation("national id is required".to_string()));
        }
        if input.citizen.full_name.trim().is_empty() {
            return Err(DomainError::Validation("name is required".to_string()));
        }

        let stall = self
            .store
            .stall(input.stall_id)
            .await?
            .ok_or_else(|| DomainError::not_found("Stall", input.stall_id))?;
        if !stall.is_active {
            return Err(DomainError::Validation(format!("stall {} is inactive", stall.id)));
        }
        if stall.state != StallState::Free {
            return Err(DomainError::StallNotFree {
                stall_id: stall.id,
                state: stall.state,
            });
        }

        if self
            .store
            .has_blocking_request_for_citizen(national_id, None)
            .await?
        {
            tracing::warn!(national_id, "citizen already holds an open request");
            return Err(DomainError::DuplicateClaim(format!(
                "citizen {national_id} already holds an open request"
            )));
        }
        if self.store.has_blocking_request_for_stall(stall.id).await? {
            tracing::warn!(stall_id = %stall.id, "stall already has an open request");
            return Err(DomainError::DuplicateClaim(format!(
                "stall {} already has an open request",
                stall.id
            )));
        }

        let request = Request::new(input, &stall, self.clock.now());
        self.store.insert_request(request.clone()).await?;

        tracing::info!(request_id = %request.id, manual = request.manual, "request created");
        Ok(request)
    }

    /// Cancels a request that has not been postulated yet.
    #[tracing::instrument(skip(self))]
    pub async fn cancel(&self, id: RequestId) -> Result<Request> {
        let request = self
            .store
            .transition_request(
                id,
                Some(&[RequestState::Requested]),
                RequestState::Cancelled,
                RequestPatch::new(),
            )
            .await?;
        tracing::info!(request_id = %id, "request cancelled");
        Ok(request)
    }

    pub async fn request(&self, id: RequestId) -> Result<Request> {
        self.store
            .request(id)
            .await?
            .ok_or_else(|| DomainError::not_found("Request", id))
    }
}
