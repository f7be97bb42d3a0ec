//! Integration tests: postulation → approval → sweeper and debt feed.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use common::{Clock, ManualClock, MarketId, StallId};
use domain::{ApprovalService, OrderLocator, RequestService};
use saga::{InMemoryNotificationService, InMemoryRegistrationService, PostulationSaga, SagaConfig};
use scheduler::{
    DebtFeed, ExpirationSweeper, HttpDebtLedger, InMemoryDebtLedger, LedgerConfig, PeriodicJob,
    SchedulerError, TickOutcome,
};
use serde_json::json;
use store::{
    Citizen, ExternalPayment, InMemoryStore, NewRequest, NewStall, OrderState, OrderStore,
    RequestState, RequestStore, ReservationOrder, StallRegistry, StallState,
};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 9, 12, 0, 0).unwrap()
}

struct Harness {
    store: InMemoryStore,
    clock: ManualClock,
    requests: RequestService<InMemoryStore>,
    approvals: ApprovalService<InMemoryStore>,
    saga: PostulationSaga<InMemoryStore, InMemoryRegistrationService, InMemoryNotificationService>,
    sweeper: ExpirationSweeper<InMemoryStore>,
}

impl Harness {
    fn new() -> Self {
        let clock = ManualClock::new(t0());
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let store = InMemoryStore::with_clock(shared.clone());
        Self {
            requests: RequestService::new(store.clone(), shared.clone()),
            approvals: ApprovalService::new(store.clone(), shared.clone()),
            saga: PostulationSaga::new(
                store.clone(),
                InMemoryRegistrationService::new(),
                InMemoryNotificationService::new(),
                shared.clone(),
                SagaConfig::default(),
            ),
            sweeper: ExpirationSweeper::new(store.clone(), shared),
            store,
            clock,
        }
    }

    async fn stall(&self, code: &str) -> StallId {
        let stall = NewStall::new(code, "Puesto", MarketId::new()).into_stall(t0());
        self.store.insert_stall(stall.clone()).await.unwrap();
        stall.id
    }

    /// Creates and postulates a request for 2025-01-10..2025-01-20.
    async fn postulate(&self, stall_id: StallId, national_id: &str, manual: bool) -> ReservationOrder {
        let request = self
            .requests
            .create(NewRequest {
                stall_id,
                citizen: Citizen::new("Ana", national_id).with_phone("0987654321"),
                start_date: Utc.with_ymd_and_hms(2025, 1, 10, 0, 0, 0).unwrap(),
                end_date: Utc.with_ymd_and_hms(2025, 1, 20, 0, 0, 0).unwrap(),
                manual,
                operator: None,
            })
            .await
            .unwrap();
        self.saga.postulate(request.id, "127.0.0.1").await.unwrap()
    }
}

#[tokio::test]
async fn test_unapproved_order_expires_and_citizen_can_retry() {
    let h = Harness::new();
    let stall_id = h.stall("MC-T-001").await;
    let order = h.postulate(stall_id, "1712345678", true).await;

    h.clock.advance(Duration::hours(24) + Duration::seconds(1));
    let report = h.sweeper.sweep().await;
    assert_eq!(report.orders_expired, 1);

    let expired = h.store.order(order.id).await.unwrap().unwrap();
    assert_eq!(expired.state, OrderState::Expired);
    let stall = h.store.stall(stall_id).await.unwrap().unwrap();
    assert_eq!(stall.state, StallState::Free);
    let request = h.store.request(order.request_id).await.unwrap().unwrap();
    assert_eq!(request.state, RequestState::Requested);
    assert!(request.order_id.is_none());

    let retry = h.saga.postulate(order.request_id, "127.0.0.1").await.unwrap();
    assert_eq!(retry.reference.as_str(), "0002");
    assert_eq!(retry.state, OrderState::Pending);
}

#[tokio::test]
async fn test_finished_occupation_is_released() {
    let h = Harness::new();
    let stall_id = h.stall("MC-T-002").await;
    let order = h.postulate(stall_id, "1712345678", true).await;
    h.approvals.approve(&OrderLocator::Id(order.id)).await.unwrap();

    h.clock.set(order.end_date + Duration::minutes(1));
    let report = h.sweeper.sweep().await;
    assert_eq!(report.occupations_released, 1);
    assert_eq!(report.failures, 0);

    let released = h.store.order(order.id).await.unwrap().unwrap();
    assert_eq!(released.state, OrderState::Released);
    assert_eq!(released.released_at, Some(h.clock.now()));

    let stall = h.store.stall(stall_id).await.unwrap().unwrap();
    assert_eq!(stall.state, StallState::Free);
    assert!(stall.current_occupant.is_none());
    let entry = stall
        .occupant_history
        .iter()
        .find(|o| o.person.national_id == released.occupant.national_id)
        .expect("released occupant in history");
    assert_eq!(entry.actual_end, Some(h.clock.now()));
    assert_eq!(entry.planned_start, order.start_date);

    let request = h.store.request(order.request_id).await.unwrap().unwrap();
    assert_eq!(request.state, RequestState::Finalized);
}

#[tokio::test]
async fn test_sweeper_is_idempotent() {
    let h = Harness::new();
    let first = h.stall("MC-T-003").await;
    let second = h.stall("MC-T-004").await;
    let expiring = h.postulate(first, "1712345678", true).await;
    let occupied = h.postulate(second, "0102030405", true).await;
    h.approvals.approve(&OrderLocator::Id(occupied.id)).await.unwrap();

    h.clock.set(occupied.end_date + Duration::hours(1));
    let report = h.sweeper.sweep().await;
    assert_eq!(report.orders_expired, 1);
    assert_eq!(report.occupations_released, 1);

    let orders = h.store.all_orders().await;
    let stalls = h.store.all_stalls().await;
    let again = h.sweeper.sweep().await;
    assert!(again.is_empty());
    assert_eq!(h.store.all_orders().await, orders);
    assert_eq!(h.store.order(expiring.id).await.unwrap().unwrap().state, OrderState::Expired);

    let mut after = h.store.all_stalls().await;
    let mut before = stalls;
    after.sort_by_key(|s| s.code.clone());
    before.sort_by_key(|s| s.code.clone());
    assert_eq!(after, before);
}

#[tokio::test]
async fn test_periodic_sweeper_tick_reports() {
    let h = Harness::new();
    let stall_id = h.stall("MC-T-005").await;
    h.postulate(stall_id, "1712345678", true).await;
    h.clock.advance(Duration::hours(30));

    let job = PeriodicJob::new(h.sweeper.clone(), std::time::Duration::from_secs(60));
    match job.tick().await {
        TickOutcome::Ran(report) => assert_eq!(report.orders_expired, 1),
        TickOutcome::Skipped => panic!("tick should run"),
    }
    let report = job.tick().await.into_output().unwrap();
    assert!(report.is_empty());
}

#[tokio::test]
async fn test_debt_feed_approves_settled_orders() {
    let h = Harness::new();
    let stall_id = h.stall("MC-T-045").await;
    let order = h.postulate(stall_id, "1712345678", false).await;

    let ledger = InMemoryDebtLedger::new();
    ledger.push_record(json!({
        "EST_FACTURA": "RECAUDADO",
        "ID_EXPOSITOR": 1712345678u64,
        "COD_PUESTO": "045",
        "SOLIC": 991,
        "VALOR": 25.0,
    }));
    ledger.push_record(json!({
        "EST_FACTURA": "PENDIENTE",
        "ID_EXPOSITOR": "1712345678",
        "COD_PUESTO": "045",
    }));
    let feed = DebtFeed::new(h.store.clone(), ledger.clone(), h.approvals.clone());

    let report = feed.sync().await;
    assert_eq!(report.fetched, 2);
    assert_eq!(report.settled, 1);
    assert_eq!(report.approved, 1);

    let approved = h.store.order(order.id).await.unwrap().unwrap();
    assert_eq!(approved.state, OrderState::Assigned);
    match approved.external_payment {
        Some(ExternalPayment::Ledger(payment)) => {
            assert_eq!(payment.record["SOLIC"], 991);
            assert_eq!(payment.record["VALOR"], 25.0);
        }
        other => panic!("unexpected payment {other:?}"),
    }
    let stall = h.store.stall(stall_id).await.unwrap().unwrap();
    assert_eq!(stall.state, StallState::Occupied);

    // Already approved: the record no longer matches a pending order.
    let report = feed.sync().await;
    assert_eq!(report.approved, 0);
    assert_eq!(report.unmatched, 1);
}

#[tokio::test]
async fn test_debt_feed_skips_unmatched_and_survives_fetch_errors() {
    let h = Harness::new();
    let ledger = InMemoryDebtLedger::new();
    ledger.push_record(json!({
        "EST_FACTURA": "PEND_CONCILIACION",
        "ID_EXPOSITOR": "1712345678",
        "COD_PUESTO": "999",
    }));
    ledger.push_record(json!({ "EST_FACTURA": "RECAUDADO" }));
    let feed = DebtFeed::new(h.store.clone(), ledger.clone(), h.approvals.clone());

    let report = feed.sync().await;
    assert_eq!(report.settled, 2);
    assert_eq!(report.unmatched, 2);
    assert_eq!(report.failures, 0);

    ledger.set_fail_on_fetch(true);
    let report = feed.sync().await;
    assert_eq!(report.fetched, 0);
}

#[tokio::test]
async fn test_http_ledger_reads_json_array() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/mercados/getDeudas"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "EST_FACTURA": "RECAUDADO", "ID_EXPOSITOR": "1712345678", "COD_PUESTO": 45 },
            "garbage",
            { "EST_FACTURA": "PENDIENTE" },
        ])))
        .mount(&server)
        .await;

    let ledger = HttpDebtLedger::new(LedgerConfig {
        url: Some(format!("{}/mercados/getDeudas", server.uri())),
        ..LedgerConfig::default()
    })
    .unwrap();

    use scheduler::DebtLedger;
    let records = ledger.fetch().await.unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].stall_code().as_deref(), Some("45"));
}

#[tokio::test]
async fn test_http_ledger_errors() {
    use scheduler::DebtLedger;

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/down"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/object"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": [] })))
        .mount(&server)
        .await;

    let down = HttpDebtLedger::new(LedgerConfig {
        url: Some(format!("{}/down", server.uri())),
        ..LedgerConfig::default()
    })
    .unwrap();
    assert!(matches!(down.fetch().await, Err(SchedulerError::Ledger(_))));

    let object = HttpDebtLedger::new(LedgerConfig {
        url: Some(format!("{}/object", server.uri())),
        ..LedgerConfig::default()
    })
    .unwrap();
    assert!(object.fetch().await.unwrap().is_empty());
}
