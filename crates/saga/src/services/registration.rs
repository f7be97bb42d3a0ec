//! External registration service: trait, in-memory and HTTP implementations.
//!
//! The HTTP flow opens a session by uploading a supporting document, then
//! posts the registration payload carrying that session id. The raw body of
//! the second call is what ends up in the order's payment envelope.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use store::{Citizen, Stall};

use crate::error::SagaError;

/// Minimal PDF sent as the supporting document when opening a session.
const PLACEHOLDER_DOCUMENT: &[u8] = b"%PDF-1.4\n1 0 obj<</Type/Catalog>>endobj\ntrailer<</Root 1 0 R>>\n%%EOF\n";

/// Data sent to the registration service for one postulation.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationApplication {
    pub national_id: String,
    pub full_name: String,
    pub phone: String,
    pub email: String,
    pub province: String,
    pub city: String,
    /// Stall code as known by the municipal systems (suffix after `T-`).
    pub stall_code: String,
}

impl RegistrationApplication {
    pub fn new(occupant: &Citizen, stall: &Stall) -> Self {
        Self {
            national_id: occupant.national_id.trim().to_string(),
            full_name: occupant.full_name.clone(),
            phone: occupant.phone.clone(),
            email: occupant.email.clone(),
            province: occupant.province.clone(),
            city: occupant.city.clone(),
            stall_code: stall.external_code().to_string(),
        }
    }

    /// `CED` for 10-character national ids, `PAS` (passport) otherwise.
    pub fn id_type(&self) -> &'static str {
        if self.national_id.chars().count() == 10 {
            "CED"
        } else {
            "PAS"
        }
    }
}

/// Successful registration.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationReceipt {
    pub session_id: Option<String>,
    /// Raw response body of the registration call.
    pub response: Value,
}

/// Trait for the external registration/payment step of a postulation.
#[async_trait]
pub trait RegistrationService: Send + Sync {
    /// Registers the application. Any failure triggers compensation.
    async fn register(
        &self,
        application: &RegistrationApplication,
    ) -> Result<RegistrationReceipt, SagaError>;
}

#[derive(Debug, Default)]
struct InMemoryRegistrationState {
    registrations: Vec<RegistrationApplication>,
    next_id: u32,
    fail_on_register: bool,
}

/// In-memory registration service for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRegistrationService {
    state: Arc<RwLock<InMemoryRegistrationState>>,
}

impl InMemoryRegistrationService {
    /// Creates a new in-memory registration service.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configures the service to fail on register calls.
    pub fn set_fail_on_register(&self, fail: bool) {
        self.state.write().unwrap().fail_on_register = fail;
    }

    /// Returns the number of accepted registrations.
    pub fn registration_count(&self) -> usize {
        self.state.read().unwrap().registrations.len()
    }

    /// Returns the accepted registrations in call order.
    pub fn registrations(&self) -> Vec<RegistrationApplication> {
        self.state.read().unwrap().registrations.clone()
    }
}

#[async_trait]
impl RegistrationService for InMemoryRegistrationService {
    async fn register(
        &self,
        application: &RegistrationApplication,
    ) -> Result<RegistrationReceipt, SagaError> {
        let mut state = self.state.write().unwrap();

        if state.fail_on_register {
            return Err(SagaError::Registration(
                "registration service unavailable".to_string(),
            ));
        }

        state.next_id += 1;
        let session_id = format!("SES-{:04}", state.next_id);
        state.registrations.push(application.clone());

        Ok(RegistrationReceipt {
            session_id: Some(session_id.clone()),
            response: json!({ "success": true, "SESSION_ID": session_id }),
        })
    }
}

/// Connection settings and fixed integration codes for the registration service.
#[derive(Debug, Clone)]
pub struct RegistrationConfig {
    /// Endpoint receiving the supporting document; answers with a session id.
    pub session_url: Option<String>,
    /// Endpoint receiving the registration payload.
    pub save_url: Option<String>,
    pub timeout: Duration,
    pub event_code: u32,
    pub business_category: u32,
    pub block_code: String,
    pub reason: String,
    pub default_province: u32,
    pub default_city: u32,
    pub document: Vec<u8>,
    pub document_name: String,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            session_url: None,
            save_url: None,
            timeout: Duration::from_secs(15),
            event_code: 3,
            business_category: 13,
            block_code: "132".to_string(),
            reason: "Solicitud uso temporal".to_string(),
            default_province: 17,
            default_city: 177,
            document: PLACEHOLDER_DOCUMENT.to_vec(),
            document_name: "documento.pdf".to_string(),
        }
    }
}

/// Registration service speaking the municipal HTTP contract.
#[derive(Debug, Clone)]
pub struct HttpRegistrationService {
    client: reqwest::Client,
    config: RegistrationConfig,
}

impl HttpRegistrationService {
    pub fn new(config: RegistrationConfig) -> Result<Self, SagaError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| SagaError::Registration(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &RegistrationConfig {
        &self.config
    }

    /// Uploads the supporting document and returns the session id.
    async fn open_session(&self, url: &str) -> Result<String, SagaError> {
        let document = reqwest::multipart::Part::bytes(self.config.document.clone())
            .file_name(self.config.document_name.clone())
            .mime_str("application/pdf")
            .map_err(|e| SagaError::Registration(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .part("imagenes", document)
            .text("ids", "rec_1");

        let body = self
            .send(self.client.post(url).multipart(form), "session")
            .await?;
        extract_session_id(&body).ok_or_else(|| {
            SagaError::Registration("session response carried no SESSION_ID".to_string())
        })
    }

    /// Builds the registration payload for a session.
    pub fn payload(&self, application: &RegistrationApplication, session_id: &str) -> Value {
        let province = application
            .province
            .trim()
            .parse::<u32>()
            .ok()
            .filter(|p| *p != 0)
            .unwrap_or(self.config.default_province);
        let city = application
            .city
            .trim()
            .parse::<u32>()
            .ok()
            .filter(|c| *c != 0)
            .unwrap_or(self.config.default_city);

        json!({
            "SESSION_ID": session_id,
            "COD_EVENTO": self.config.event_code,
            "COD_CAT_NEGO": self.config.business_category,
            "COD_BLOQ": self.config.block_code,
            "CAN_PUESTO": 1,
            "SOL_MOTIVO": self.config.reason,
            "expositor": {
                "id": application.national_id,
                "codEvento": self.config.event_code,
                "nombre": application.full_name,
                "tipoId": application.id_type(),
                "telefono": application.phone,
                "correo": application.email,
                "provincia": province,
                "ciudad": city,
                "idRepLegal": "",
                "repLegal": null,
                "estado": "A",
                "artesano": "N",
                "sorteo": "N",
            },
            "puestos": [{
                "PUE_ESTADO": "P",
                "NUM_PUESTO": 1,
                "COD_PUESTO": application.stall_code,
            }],
        })
    }

    async fn send(&self, request: reqwest::RequestBuilder, call: &str) -> Result<Value, SagaError> {
        let started = std::time::Instant::now();
        let response = request.send().await.map_err(|e| {
            tracing::error!(call, error = %e, "registration request failed");
            SagaError::Registration(format!("{call} request failed: {e}"))
        })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| SagaError::Registration(format!("{call} response unreadable: {e}")))?;
        tracing::info!(call, status = status.as_u16(), elapsed_ms = started.elapsed().as_millis() as u64, "registration call finished");

        if !status.is_success() {
            return Err(SagaError::Registration(format!(
                "{call} returned HTTP {}",
                status.as_u16()
            )));
        }
        // Non-JSON bodies are kept verbatim.
        Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
    }
}

#[async_trait]
impl RegistrationService for HttpRegistrationService {
    #[tracing::instrument(skip(self, application), fields(stall_code = %application.stall_code))]
    async fn register(
        &self,
        application: &RegistrationApplication,
    ) -> Result<RegistrationReceipt, SagaError> {
        let (Some(session_url), Some(save_url)) =
            (self.config.session_url.as_deref(), self.config.save_url.as_deref())
        else {
            return Err(SagaError::Registration(
                "registration service is not configured".to_string(),
            ));
        };

        let session_id = self.open_session(session_url).await?;
        let payload = self.payload(application, &session_id);
        let response = self
            .send(self.client.post(save_url).json(&payload), "save")
            .await?;

        Ok(RegistrationReceipt {
            session_id: Some(session_id),
            response,
        })
    }
}

/// Finds the session id in `objData` (object or JSON-encoded string), then
/// at the root under any of the spellings the service has used.
pub fn extract_session_id(body: &Value) -> Option<String> {
    let object_data = match body.get("objData") {
        Some(Value::String(raw)) => serde_json::from_str::<Value>(raw).ok(),
        Some(other) => Some(other.clone()),
        None => None,
    };

    let candidates = object_data
        .as_ref()
        .and_then(|data| data.get("SESSION_ID"))
        .into_iter()
        .chain(
            ["SESSION_ID", "sessionId", "session_id"]
                .iter()
                .filter_map(|key| body.get(*key)),
        );

    candidates.into_iter().find_map(|value| match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use common::MarketId;
    use store::NewStall;

    fn application(national_id: &str) -> RegistrationApplication {
        let stall = NewStall::new("MC-T-045", "Puesto 45", MarketId::new()).into_stall(Utc::now());
        let citizen = Citizen::new("Ana Pérez", national_id)
            .with_phone("0987654321")
            .with_email("ana@example.com");
        RegistrationApplication::new(&citizen, &stall)
    }

    #[test]
    fn id_type_depends_on_length() {
        assert_eq!(application("1712345678").id_type(), "CED");
        assert_eq!(application("AB123456").id_type(), "PAS");
    }

    #[test]
    fn payload_uses_integration_codes_and_defaults() {
        let service = HttpRegistrationService::new(RegistrationConfig::default()).unwrap();
        let payload = service.payload(&application("1712345678"), "S-1");

        assert_eq!(payload["SESSION_ID"], "S-1");
        assert_eq!(payload["COD_EVENTO"], 3);
        assert_eq!(payload["COD_CAT_NEGO"], 13);
        assert_eq!(payload["COD_BLOQ"], "132");
        assert_eq!(payload["CAN_PUESTO"], 1);
        assert_eq!(payload["SOL_MOTIVO"], "Solicitud uso temporal");
        assert_eq!(payload["expositor"]["tipoId"], "CED");
        assert_eq!(payload["expositor"]["provincia"], 17);
        assert_eq!(payload["expositor"]["ciudad"], 177);
        assert!(payload["expositor"]["repLegal"].is_null());
        assert_eq!(payload["puestos"][0]["COD_PUESTO"], "045");
        assert_eq!(payload["puestos"][0]["PUE_ESTADO"], "P");
    }

    #[test]
    fn payload_keeps_numeric_location() {
        let service = HttpRegistrationService::new(RegistrationConfig::default()).unwrap();
        let mut app = application("1712345678");
        app.province = "18".into();
        app.city = "180".into();
        let payload = service.payload(&app, "S-1");
        assert_eq!(payload["expositor"]["provincia"], 18);
        assert_eq!(payload["expositor"]["ciudad"], 180);
    }

    #[test]
    fn session_id_lookup_order() {
        assert_eq!(
            extract_session_id(&json!({"objData": {"SESSION_ID": "A"}, "SESSION_ID": "B"})),
            Some("A".to_string())
        );
        assert_eq!(
            extract_session_id(&json!({"objData": "{\"SESSION_ID\": 77}"})),
            Some("77".to_string())
        );
        assert_eq!(
            extract_session_id(&json!({"sessionId": "C"})),
            Some("C".to_string())
        );
        assert_eq!(
            extract_session_id(&json!({"session_id": "D"})),
            Some("D".to_string())
        );
        assert_eq!(extract_session_id(&json!({"objData": "not json"})), None);
        assert_eq!(extract_session_id(&json!({"SESSION_ID": "  "})), None);
    }

    #[tokio::test]
    async fn in_memory_register_and_fail() {
        let service = InMemoryRegistrationService::new();
        let receipt = service.register(&application("1712345678")).await.unwrap();
        assert_eq!(receipt.session_id.as_deref(), Some("SES-0001"));
        assert_eq!(service.registration_count(), 1);

        service.set_fail_on_register(true);
        assert!(service.register(&application("1712345678")).await.is_err());
        assert_eq!(service.registration_count(), 1);
    }

    #[tokio::test]
    async fn unconfigured_http_service_fails() {
        let service = HttpRegistrationService::new(RegistrationConfig::default()).unwrap();
        let err = service.register(&application("1712345678")).await.unwrap_err();
        assert!(matches!(err, SagaError::Registration(_)));
    }
}
