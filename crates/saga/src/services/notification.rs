//! Assignment notification service: trait, in-memory and HTTP implementations.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::SagaError;

/// A notification that was (or would have been) sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub recipient: String,
    pub stall_name: String,
    pub location: String,
}

/// Trait for telling a citizen which stall was reserved for them.
///
/// Best effort only: the saga never waits on or rolls back because of it.
#[async_trait]
pub trait NotificationService: Send + Sync + 'static {
    async fn notify_assignment(&self, notification: Notification) -> Result<(), SagaError>;
}

#[derive(Debug, Default)]
struct InMemoryNotificationState {
    sent: Vec<Notification>,
    fail_on_notify: bool,
}

/// In-memory notification service for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryNotificationService {
    state: Arc<RwLock<InMemoryNotificationState>>,
}

impl InMemoryNotificationService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configures the service to fail on notify calls.
    pub fn set_fail_on_notify(&self, fail: bool) {
        self.state.write().unwrap().fail_on_notify = fail;
    }

    pub fn sent_count(&self) -> usize {
        self.state.read().unwrap().sent.len()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.state.read().unwrap().sent.clone()
    }
}

#[async_trait]
impl NotificationService for InMemoryNotificationService {
    async fn notify_assignment(&self, notification: Notification) -> Result<(), SagaError> {
        let mut state = self.state.write().unwrap();
        if state.fail_on_notify {
            return Err(SagaError::Notification("notification gateway down".to_string()));
        }
        state.sent.push(notification);
        Ok(())
    }
}

/// Connection settings for the notification gateway.
#[derive(Debug, Clone)]
pub struct NotificationConfig {
    /// Base URL; the recipient's digits are appended as the last path segment.
    pub base_url: Option<String>,
    /// Sent verbatim as the `Authorization` header.
    pub token: Option<String>,
    pub timeout: Duration,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            token: None,
            timeout: Duration::from_secs(15),
        }
    }
}

/// Notification gateway client. Without a base URL it only logs.
#[derive(Debug, Clone)]
pub struct HttpNotificationService {
    client: reqwest::Client,
    config: NotificationConfig,
}

impl HttpNotificationService {
    pub fn new(config: NotificationConfig) -> Result<Self, SagaError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| SagaError::Notification(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl NotificationService for HttpNotificationService {
    async fn notify_assignment(&self, notification: Notification) -> Result<(), SagaError> {
        let digits: String = notification
            .recipient
            .chars()
            .filter(char::is_ascii_digit)
            .collect();
        if digits.is_empty() {
            tracing::debug!("notification skipped, recipient has no digits");
            return Ok(());
        }
        let Some(base_url) = self.config.base_url.as_deref() else {
            tracing::info!(recipient = %digits, stall = %notification.stall_name, "notification gateway not configured, skipping");
            return Ok(());
        };

        let url = format!("{}/{}", base_url.trim_end_matches('/'), digits);
        let mut request = self.client.post(&url).form(&[
            ("puesto", notification.stall_name.as_str()),
            ("ubicacion", notification.location.as_str()),
        ]);
        if let Some(token) = &self.config.token {
            request = request.header(reqwest::header::AUTHORIZATION, token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| SagaError::Notification(e.to_string()))?;
        if !response.status().is_success() {
            return Err(SagaError::Notification(format!(
                "gateway returned HTTP {}",
                response.status().as_u16()
            )));
        }
        tracing::debug!(recipient = %digits, "notification sent");
        Ok(())
    }
}
