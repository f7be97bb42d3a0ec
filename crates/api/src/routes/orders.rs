//! Order lookup, approval and rejection endpoints.
//!
//! Every `{key}` accepts either the order id or its zero-padded reference.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use domain::OrderLocator;
use saga::{NotificationService, RegistrationService};
use serde::Deserialize;
use store::{ReservationOrder, ReservationStore};

use crate::AppState;
use crate::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct ManualApprovalRequest {
    pub operator: String,
}

/// GET /orders/{key}
pub async fn get<S, R, N>(
    State(state): State<Arc<AppState<S, R, N>>>,
    Path(key): Path<String>,
) -> Result<Json<ReservationOrder>, ApiError>
where
    S: ReservationStore,
    R: RegistrationService + 'static,
    N: NotificationService,
{
    let locator = OrderLocator::parse(&key)?;
    Ok(Json(state.approvals.find_order(&locator).await?))
}

/// POST /orders/{key}/approve
#[tracing::instrument(skip(state))]
pub async fn approve<S, R, N>(
    State(state): State<Arc<AppState<S, R, N>>>,
    Path(key): Path<String>,
) -> Result<Json<ReservationOrder>, ApiError>
where
    S: ReservationStore,
    R: RegistrationService + 'static,
    N: NotificationService,
{
    let locator = OrderLocator::parse(&key)?;
    Ok(Json(state.approvals.approve(&locator).await?))
}

/// POST /orders/{key}/approve-manual — approve on behalf of an operator.
#[tracing::instrument(skip(state, body))]
pub async fn approve_manual<S, R, N>(
    State(state): State<Arc<AppState<S, R, N>>>,
    Path(key): Path<String>,
    Json(body): Json<ManualApprovalRequest>,
) -> Result<Json<ReservationOrder>, ApiError>
where
    S: ReservationStore,
    R: RegistrationService + 'static,
    N: NotificationService,
{
    let locator = OrderLocator::parse(&key)?;
    Ok(Json(
        state
            .approvals
            .approve_manual(&locator, &body.operator)
            .await?,
    ))
}

/// POST /orders/{key}/reject
#[tracing::instrument(skip(state))]
pub async fn reject<S, R, N>(
    State(state): State<Arc<AppState<S, R, N>>>,
    Path(key): Path<String>,
) -> Result<Json<ReservationOrder>, ApiError>
where
    S: ReservationStore,
    R: RegistrationService + 'static,
    N: NotificationService,
{
    let locator = OrderLocator::parse(&key)?;
    Ok(Json(state.approvals.reject(&locator).await?))
}
