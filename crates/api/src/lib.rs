//! HTTP API for the stall reservation lifecycle.
//!
//! Exposes request creation, postulation, approval and rejection, stall
//! lookups and a manual sweeper trigger, with structured logging (tracing)
//! and Prometheus metrics.

pub mod config;
pub mod error;
pub mod extract;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use common::Clock;
use domain::{ApprovalService, RequestService};
use metrics_exporter_prometheus::PrometheusHandle;
use saga::{NotificationService, PostulationSaga, RegistrationService, SagaConfig};
use scheduler::{ExpirationSweeper, PeriodicJob};
use store::ReservationStore;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared application state accessible from all handlers.
pub struct AppState<S, R, N>
where
    S: ReservationStore,
    R: RegistrationService + 'static,
    N: NotificationService,
{
    pub store: S,
    pub requests: RequestService<S>,
    pub approvals: ApprovalService<S>,
    pub saga: PostulationSaga<S, R, N>,
    /// Shared with the background loop so manual runs respect single-flight.
    pub sweeper: Arc<PeriodicJob<ExpirationSweeper<S>>>,
}

impl<S, R, N> AppState<S, R, N>
where
    S: ReservationStore,
    R: RegistrationService + 'static,
    N: NotificationService,
{
    /// Wires every service around one store and one clock.
    pub fn new(
        store: S,
        registration: R,
        notifier: N,
        clock: Arc<dyn Clock>,
        saga_config: SagaConfig,
        sweep_interval: std::time::Duration,
    ) -> Self {
        Self {
            requests: RequestService::new(store.clone(), clock.clone()),
            approvals: ApprovalService::new(store.clone(), clock.clone()),
            saga: PostulationSaga::new(
                store.clone(),
                registration,
                notifier,
                clock.clone(),
                saga_config,
            ),
            sweeper: Arc::new(PeriodicJob::new(
                ExpirationSweeper::new(store.clone(), clock),
                sweep_interval,
            )),
            store,
        }
    }
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<S, R, N>(state: Arc<AppState<S, R, N>>, metrics_handle: PrometheusHandle) -> Router
where
    S: ReservationStore,
    R: RegistrationService + 'static,
    N: NotificationService,
{
    // Scrape endpoint: postulation, approval, sweeper and debt feed counters.
    let metrics_router = Router::new().route(
        "/metrics",
        get(move || std::future::ready(metrics_handle.render())),
    );

    Router::new()
        .route("/health", get(routes::health::check))
        .route("/requests", post(routes::requests::create::<S, R, N>))
        .route("/requests/{id}", get(routes::requests::get::<S, R, N>))
        .route("/requests/{id}/cancel", post(routes::requests::cancel::<S, R, N>))
        .route(
            "/requests/{id}/postulate",
            post(routes::requests::postulate::<S, R, N>),
        )
        .route("/orders/{key}", get(routes::orders::get::<S, R, N>))
        .route("/orders/{key}/approve", post(routes::orders::approve::<S, R, N>))
        .route(
            "/orders/{key}/approve-manual",
            post(routes::orders::approve_manual::<S, R, N>),
        )
        .route("/orders/{key}/reject", post(routes::orders::reject::<S, R, N>))
        .route("/stalls/{id}", get(routes::stalls::get::<S, R, N>))
        .route(
            "/stalls/{id}/pending-order",
            get(routes::stalls::pending_order::<S, R, N>),
        )
        .route("/sweeper/run", post(routes::sweeper::run::<S, R, N>))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}
