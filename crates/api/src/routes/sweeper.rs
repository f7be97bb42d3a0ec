//! Manual sweeper trigger for operations and testing.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use saga::{NotificationService, RegistrationService};
use scheduler::{SweepReport, TickOutcome};
use serde::Serialize;
use store::ReservationStore;

use crate::AppState;

#[derive(Debug, Serialize)]
pub struct SweepResponse {
    /// `"ran"` or `"skipped"` when a sweep was already in progress.
    pub status: &'static str,
    pub report: Option<SweepReport>,
}

/// POST /sweeper/run — run one sweep now, unless one is in progress.
#[tracing::instrument(skip(state))]
pub async fn run<S, R, N>(State(state): State<Arc<AppState<S, R, N>>>) -> Json<SweepResponse>
where
    S: ReservationStore,
    R: RegistrationService + 'static,
    N: NotificationService,
{
    let response = match state.sweeper.tick().await {
        TickOutcome::Ran(report) => SweepResponse {
            status: "ran",
            report: Some(report),
        },
        TickOutcome::Skipped => SweepResponse {
            status: "skipped",
            report: None,
        },
    };
    Json(response)
}
