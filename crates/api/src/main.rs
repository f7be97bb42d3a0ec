//! API server entry point.

use std::sync::Arc;

use api::config::{Config, LogFormat};
use common::{Clock, SystemClock};
use domain::ApprovalService;
use saga::{HttpNotificationService, HttpRegistrationService};
use scheduler::{DebtFeed, HttpDebtLedger, PeriodicJob};
use store::{InMemoryStore, NewStall, PostgresStore, ReservationStore};
use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Loads catalog stalls from `STALL_SEED_FILE`. Failures are logged, not fatal.
async fn seed_stalls<S: ReservationStore>(store: &S, path: &str, clock: &dyn Clock) {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) => {
            tracing::error!(%path, error = %e, "could not read stall seed file");
            return;
        }
    };
    let stalls: Vec<NewStall> = match serde_json::from_str(&raw) {
        Ok(stalls) => stalls,
        Err(e) => {
            tracing::error!(%path, error = %e, "invalid stall seed file");
            return;
        }
    };

    let mut seeded = 0;
    for stall in stalls {
        let code = stall.code.clone();
        match store.insert_stall(stall.into_stall(clock.now())).await {
            Ok(()) => seeded += 1,
            Err(e) => tracing::warn!(%code, error = %e, "stall not seeded"),
        }
    }
    tracing::info!(seeded, "stalls seeded");
}

async fn run<S: ReservationStore>(
    store: S,
    clock: Arc<dyn Clock>,
    config: Config,
    metrics_handle: metrics_exporter_prometheus::PrometheusHandle,
) {
    if let Some(path) = &config.stall_seed_file {
        seed_stalls(&store, path, clock.as_ref()).await;
    }

    // 1. Build services
    let registration =
        HttpRegistrationService::new(config.registration()).expect("failed to build registration client");
    if config.registration_session_url.is_none() || config.registration_save_url.is_none() {
        tracing::warn!("external registration not configured, integrated postulations will fail");
    }
    let notifier =
        HttpNotificationService::new(config.notification()).expect("failed to build notification client");
    let state = Arc::new(api::AppState::new(
        store.clone(),
        registration,
        notifier,
        clock.clone(),
        config.saga(),
        config.sweep_interval,
    ));

    // 2. Start background jobs
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut jobs = vec![state.sweeper.clone().spawn(shutdown_rx.clone())];
    if let Some(ledger_config) = config.ledger() {
        let ledger = HttpDebtLedger::new(ledger_config).expect("failed to build ledger client");
        let feed = DebtFeed::new(
            store.clone(),
            ledger,
            ApprovalService::new(store.clone(), clock.clone()),
        );
        let job = Arc::new(PeriodicJob::new(feed, config.debt_sync_interval));
        jobs.push(job.spawn(shutdown_rx));
    } else {
        tracing::info!("debt ledger not configured, feed disabled");
    }

    // 3. Serve
    let app = api::create_app(state, metrics_handle);
    let addr = config.addr();
    tracing::info!(%addr, "starting API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .expect("server error");

    // 4. Stop background jobs
    let _ = shutdown_tx.send(true);
    for job in jobs {
        if let Err(e) = job.await {
            tracing::error!(error = %e, "background job ended abnormally");
        }
    }
    tracing::info!("server shut down gracefully");
}

#[tokio::main]
async fn main() {
    let config = Config::from_env();
    init_tracing(&config);

    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    match config.database_url.clone() {
        Some(url) => {
            let pool = sqlx::postgres::PgPoolOptions::new()
                .max_connections(10)
                .connect(&url)
                .await
                .expect("failed to connect to PostgreSQL");
            let store = PostgresStore::with_clock(pool, clock.clone());
            store
                .run_migrations()
                .await
                .expect("failed to run migrations");
            tracing::info!("using PostgreSQL store");
            run(store, clock, config, metrics_handle).await;
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory store");
            run(InMemoryStore::with_clock(clock.clone()), clock, config, metrics_handle).await;
        }
    }
}
