//! Integration tests for the API server.

use std::sync::{Arc, OnceLock};
use std::time::Duration as StdDuration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::{DateTime, TimeZone, Utc};
use common::{Clock, ManualClock, MarketId, StallId};
use metrics_exporter_prometheus::PrometheusHandle;
use saga::{InMemoryNotificationService, InMemoryRegistrationService, SagaConfig};
use serde_json::{Value, json};
use store::{InMemoryStore, NewStall, StallRegistry};
use tower::ServiceExt;

type TestState = api::AppState<InMemoryStore, InMemoryRegistrationService, InMemoryNotificationService>;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

fn get_metrics_handle() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            builder
                .install_recorder()
                .expect("failed to install Prometheus recorder")
        })
        .clone()
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap()
}

struct TestApp {
    app: axum::Router,
    state: Arc<TestState>,
    store: InMemoryStore,
    clock: ManualClock,
    registration: InMemoryRegistrationService,
}

impl TestApp {
    fn new() -> Self {
        let clock = ManualClock::new(t0());
        let store = InMemoryStore::with_clock(Arc::new(clock.clone()));
        let registration = InMemoryRegistrationService::new();
        let state = Arc::new(api::AppState::new(
            store.clone(),
            registration.clone(),
            InMemoryNotificationService::new(),
            Arc::new(clock.clone()),
            SagaConfig::default(),
            StdDuration::from_secs(60),
        ));
        let app = api::create_app(state.clone(), get_metrics_handle());
        Self {
            app,
            state,
            store,
            clock,
            registration,
        }
    }

    async fn stall(&self, code: &str) -> StallId {
        let stall = NewStall::new(code, format!("Puesto {code}"), MarketId::new())
            .in_section("Legumbres")
            .into_stall(self.clock.now());
        self.store.insert_stall(stall.clone()).await.unwrap();
        stall.id
    }

    async fn send(&self, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&body).unwrap()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, json)
    }

    async fn create_request(&self, stall_id: StallId, national_id: &str, manual: bool) -> Value {
        let (status, body) = self
            .send(
                "POST",
                "/requests",
                Some(request_body(stall_id, national_id, manual)),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        body
    }
}

fn request_body(stall_id: StallId, national_id: &str, manual: bool) -> Value {
    json!({
        "stall_id": stall_id,
        "citizen": {
            "nombre": "Luis Andrade",
            "cedula": national_id,
            "telefono": "0991234567",
        },
        "start_date": "2025-03-02T00:00:00Z",
        "end_date": "2025-03-12T00:00:00Z",
        "manual": manual,
    })
}

#[tokio::test]
async fn test_health_check() {
    let app = TestApp::new();
    let (status, body) = app.send("GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_create_request() {
    let app = TestApp::new();
    let stall_id = app.stall("011").await;

    let body = app.create_request(stall_id, "1710000001", false).await;
    assert_eq!(body["estado"], "EN_SOLICITUD");
    assert_eq!(body["stall_id"], stall_id.to_string());
    assert_eq!(body["citizen"]["cedula"], "1710000001");

    let id = body["id"].as_str().unwrap();
    let (status, fetched) = app.send("GET", &format!("/requests/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["id"], id);
}

#[tokio::test]
async fn test_create_request_rejects_inverted_dates() {
    let app = TestApp::new();
    let stall_id = app.stall("012").await;

    let mut body = request_body(stall_id, "1710000002", false);
    body["start_date"] = json!("2025-03-20T00:00:00Z");
    let (status, error) = app.send("POST", "/requests", Some(body)).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error["kind"], "validation");
}

#[tokio::test]
async fn test_second_open_request_is_a_duplicate_claim() {
    let app = TestApp::new();
    let first = app.stall("013").await;
    let second = app.stall("014").await;
    app.create_request(first, "1710000003", false).await;

    let (status, error) = app
        .send("POST", "/requests", Some(request_body(second, "1710000003", false)))
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error["kind"], "duplicate_claim");
}

#[tokio::test]
async fn test_manual_postulation_and_approval_by_reference() {
    let app = TestApp::new();
    let stall_id = app.stall("021").await;
    let request = app.create_request(stall_id, "1710000004", true).await;
    let request_id = request["id"].as_str().unwrap();

    let (status, order) = app
        .send("POST", &format!("/requests/{request_id}/postulate"), None)
        .await;
    assert_eq!(status, StatusCode::CREATED, "{order}");
    assert_eq!(order["estado"], "EN_SOLICITUD");
    assert_eq!(order["reference"], "0001");
    assert_eq!(order["external_payment"]["tipo"], "manual");
    assert_eq!(order["external_payment"]["ip"], "unknown");
    assert_eq!(app.registration.registration_count(), 0);

    let (status, stall) = app.send("GET", &format!("/stalls/{stall_id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stall["estado"], "RESERVADO");

    let (status, pending) = app
        .send("GET", &format!("/stalls/{stall_id}/pending-order"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(pending["id"], order["id"]);

    // Short references are padded.
    let (status, approved) = app.send("POST", "/orders/1/approve", None).await;
    assert_eq!(status, StatusCode::OK, "{approved}");
    assert_eq!(approved["estado"], "ASIGNADA");

    let (_, stall) = app.send("GET", &format!("/stalls/{stall_id}"), None).await;
    assert_eq!(stall["estado"], "OCUPADO");
    assert_eq!(stall["current_occupant"]["cedula"], "1710000004");

    let (_, request) = app.send("GET", &format!("/requests/{request_id}"), None).await;
    assert_eq!(request["estado"], "APROBADA");
}

#[tokio::test]
async fn test_postulation_with_caller_ip() {
    let app = TestApp::new();
    let stall_id = app.stall("022").await;
    let request = app.create_request(stall_id, "1710000005", true).await;
    let request_id = request["id"].as_str().unwrap();

    let response = app
        .app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/requests/{request_id}/postulate"))
                .header("x-forwarded-for", "203.0.113.9, 10.0.0.1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let order: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(order["external_payment"]["ip"], "203.0.113.9");
}

#[tokio::test]
async fn test_get_and_reject_order_by_id() {
    let app = TestApp::new();
    let stall_id = app.stall("031").await;
    let request = app.create_request(stall_id, "1710000006", true).await;
    let request_id = request["id"].as_str().unwrap();
    let (_, order) = app
        .send("POST", &format!("/requests/{request_id}/postulate"), None)
        .await;
    let order_id = order["id"].as_str().unwrap();

    let (status, fetched) = app.send("GET", &format!("/orders/{order_id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["reference"], order["reference"]);

    let (status, rejected) = app
        .send("POST", &format!("/orders/{order_id}/reject"), None)
        .await;
    assert_eq!(status, StatusCode::OK, "{rejected}");
    assert_eq!(rejected["estado"], "RECHAZADA");

    let (_, stall) = app.send("GET", &format!("/stalls/{stall_id}"), None).await;
    assert_eq!(stall["estado"], "LIBRE");

    // Already rejected.
    let (status, _) = app
        .send("POST", &format!("/orders/{order_id}/approve"), None)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_manual_approval_records_operator() {
    let app = TestApp::new();
    let stall_id = app.stall("032").await;
    let request = app.create_request(stall_id, "1710000007", true).await;
    let request_id = request["id"].as_str().unwrap();
    let (_, order) = app
        .send("POST", &format!("/requests/{request_id}/postulate"), None)
        .await;
    let reference = order["reference"].as_str().unwrap();

    let (status, approved) = app
        .send(
            "POST",
            &format!("/orders/{reference}/approve-manual"),
            Some(json!({ "operator": "ventanilla-2" })),
        )
        .await;

    assert_eq!(status, StatusCode::OK, "{approved}");
    assert_eq!(approved["estado"], "ASIGNADA");
    assert_eq!(approved["operator"], "ventanilla-2");
}

#[tokio::test]
async fn test_unknown_order_is_404() {
    let app = TestApp::new();
    let (status, error) = app.send("GET", "/orders/0042", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(error["kind"], "not_found");
}

#[tokio::test]
async fn test_malformed_request_id_is_400() {
    let app = TestApp::new();
    let (status, error) = app.send("GET", "/requests/not-a-uuid", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error["kind"], "validation");
}

#[tokio::test]
async fn test_claimed_stall_is_409() {
    let app = TestApp::new();
    let stall_id = app.stall("041").await;
    let request = app.create_request(stall_id, "1710000008", true).await;
    let request_id = request["id"].as_str().unwrap();

    // Someone else wins the stall between request and postulation.
    app.store
        .try_reserve(stall_id, app.clock.now() + chrono::Duration::hours(1))
        .await
        .unwrap();

    let (status, error) = app
        .send("POST", &format!("/requests/{request_id}/postulate"), None)
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(error["kind"], "conflict");
}

#[tokio::test]
async fn test_registration_failure_is_502_and_compensated() {
    let app = TestApp::new();
    let stall_id = app.stall("051").await;
    let request = app.create_request(stall_id, "1710000009", false).await;
    let request_id = request["id"].as_str().unwrap();
    app.registration.set_fail_on_register(true);

    let (status, error) = app
        .send("POST", &format!("/requests/{request_id}/postulate"), None)
        .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(error["kind"], "external");

    let (_, stall) = app.send("GET", &format!("/stalls/{stall_id}"), None).await;
    assert_eq!(stall["estado"], "LIBRE");
    let (_, request) = app.send("GET", &format!("/requests/{request_id}"), None).await;
    assert_eq!(request["estado"], "EN_SOLICITUD");
    assert!(request["order_id"].is_null());
}

#[tokio::test]
async fn test_cancel_request() {
    let app = TestApp::new();
    let stall_id = app.stall("061").await;
    let request = app.create_request(stall_id, "1710000010", false).await;
    let request_id = request["id"].as_str().unwrap();

    let (status, cancelled) = app
        .send("POST", &format!("/requests/{request_id}/cancel"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cancelled["estado"], "CANCELADA");

    let (status, _) = app
        .send("POST", &format!("/requests/{request_id}/postulate"), None)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_sweeper_run_expires_unapproved_orders() {
    let app = TestApp::new();
    let stall_id = app.stall("071").await;
    let request = app.create_request(stall_id, "1710000011", true).await;
    let request_id = request["id"].as_str().unwrap();
    let (_, order) = app
        .send("POST", &format!("/requests/{request_id}/postulate"), None)
        .await;
    let order_id = order["id"].as_str().unwrap();

    let (status, body) = app.send("POST", "/sweeper/run", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ran");
    assert_eq!(body["report"]["orders_expired"], 0);

    app.clock
        .advance(SagaConfig::default().approval_grace + chrono::Duration::hours(1));
    let (_, body) = app.send("POST", "/sweeper/run", None).await;
    assert_eq!(body["report"]["orders_expired"], 1);

    let (_, order) = app.send("GET", &format!("/orders/{order_id}"), None).await;
    assert_eq!(order["estado"], "VENCIDA");
    let (_, stall) = app.send("GET", &format!("/stalls/{stall_id}"), None).await;
    assert_eq!(stall["estado"], "LIBRE");
    assert!(!app.state.sweeper.is_running());
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let app = TestApp::new();
    let stall_id = app.stall("081").await;
    let request = app.create_request(stall_id, "1710000012", true).await;
    let request_id = request["id"].as_str().unwrap();
    app.send("POST", &format!("/requests/{request_id}/postulate"), None)
        .await;

    let response = app
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("postulations_total"));
}
