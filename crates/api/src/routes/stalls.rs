//! Stall lookups.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use common::StallId;
use domain::DomainError;
use saga::{NotificationService, RegistrationService};
use store::{ReservationOrder, ReservationStore, Stall};

use crate::AppState;
use crate::error::ApiError;
use crate::routes::parse_id;

/// GET /stalls/{id}
pub async fn get<S, R, N>(
    State(state): State<Arc<AppState<S, R, N>>>,
    Path(id): Path<String>,
) -> Result<Json<Stall>, ApiError>
where
    S: ReservationStore,
    R: RegistrationService + 'static,
    N: NotificationService,
{
    let id: StallId = parse_id(&id, "stall")?;
    let stall = state
        .store
        .stall(id)
        .await
        .map_err(DomainError::from)?
        .ok_or_else(|| DomainError::not_found("Stall", id))?;
    Ok(Json(stall))
}

/// GET /stalls/{id}/pending-order — most recent order awaiting approval.
pub async fn pending_order<S, R, N>(
    State(state): State<Arc<AppState<S, R, N>>>,
    Path(id): Path<String>,
) -> Result<Json<ReservationOrder>, ApiError>
where
    S: ReservationStore,
    R: RegistrationService + 'static,
    N: NotificationService,
{
    let id: StallId = parse_id(&id, "stall")?;
    Ok(Json(state.approvals.latest_pending_for_stall(id).await?))
}
