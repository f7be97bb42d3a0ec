//! Citizen request endpoints: creation, cancellation and postulation.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use common::RequestId;
use saga::{NotificationService, RegistrationService};
use store::{NewRequest, Request, ReservationOrder, ReservationStore};

use crate::AppState;
use crate::error::ApiError;
use crate::extract::CallerIp;
use crate::routes::parse_id;

/// POST /requests — create a request for a free stall.
#[tracing::instrument(skip(state, input), fields(stall_id = %input.stall_id))]
pub async fn create<S, R, N>(
    State(state): State<Arc<AppState<S, R, N>>>,
    Json(input): Json<NewRequest>,
) -> Result<(StatusCode, Json<Request>), ApiError>
where
    S: ReservationStore,
    R: RegistrationService + 'static,
    N: NotificationService,
{
    let request = state.requests.create(input).await?;
    Ok((StatusCode::CREATED, Json(request)))
}

/// GET /requests/{id}
pub async fn get<S, R, N>(
    State(state): State<Arc<AppState<S, R, N>>>,
    Path(id): Path<String>,
) -> Result<Json<Request>, ApiError>
where
    S: ReservationStore,
    R: RegistrationService + 'static,
    N: NotificationService,
{
    let id: RequestId = parse_id(&id, "request")?;
    Ok(Json(state.requests.request(id).await?))
}

/// POST /requests/{id}/cancel — only while not yet postulated.
#[tracing::instrument(skip(state))]
pub async fn cancel<S, R, N>(
    State(state): State<Arc<AppState<S, R, N>>>,
    Path(id): Path<String>,
) -> Result<Json<Request>, ApiError>
where
    S: ReservationStore,
    R: RegistrationService + 'static,
    N: NotificationService,
{
    let id: RequestId = parse_id(&id, "request")?;
    Ok(Json(state.requests.cancel(id).await?))
}

/// POST /requests/{id}/postulate — run the postulation saga.
///
/// Returns the pending order with its payment envelope.
#[tracing::instrument(skip(state))]
pub async fn postulate<S, R, N>(
    State(state): State<Arc<AppState<S, R, N>>>,
    Path(id): Path<String>,
    CallerIp(ip): CallerIp,
) -> Result<(StatusCode, Json<ReservationOrder>), ApiError>
where
    S: ReservationStore,
    R: RegistrationService + 'static,
    N: NotificationService,
{
    let id: RequestId = parse_id(&id, "request")?;
    let order = state.saga.postulate(id, &ip).await?;
    Ok((StatusCode::CREATED, Json(order)))
}
