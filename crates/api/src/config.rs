//! Application configuration loaded from environment variables.

use std::time::Duration;

use saga::{NotificationConfig, RegistrationConfig, SagaConfig};
use scheduler::LedgerConfig;

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST` — bind address (default: `"0.0.0.0"`)
/// - `PORT` — listen port (default: `3000`)
/// - `RUST_LOG` — tracing filter directive (default: `"info"`)
/// - `LOG_FORMAT` — `text` or `json` (default: `text`)
/// - `DATABASE_URL` — PostgreSQL URL; the in-memory store is used when unset
/// - `APPROVAL_GRACE_HOURS` — approval deadline after postulation (default: `24`)
/// - `SWEEP_INTERVAL_SECS` — sweeper period (default: `60`)
/// - `DEBT_SYNC_INTERVAL_SECS` — debt feed period, `0` disables (default: `600`)
/// - `REGISTRATION_SESSION_URL`, `REGISTRATION_SAVE_URL` — external registration
/// - `NOTIFICATION_BASE_URL`, `NOTIFICATION_TOKEN` — assignment notifications
/// - `DEBT_LEDGER_URL` — debt ledger; the feed is disabled when unset
/// - `HTTP_TIMEOUT_SECS` — timeout of every outbound call (default: `15`)
/// - `STALL_SEED_FILE` — JSON array of stalls loaded at startup
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub approval_grace_hours: i64,
    pub sweep_interval: Duration,
    pub debt_sync_interval: Duration,
    pub registration_session_url: Option<String>,
    pub registration_save_url: Option<String>,
    pub notification_base_url: Option<String>,
    pub notification_token: Option<String>,
    pub debt_ledger_url: Option<String>,
    pub http_timeout: Duration,
    pub stall_seed_file: Option<String>,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration from any key lookup. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let number = |key: &str, default: u64| {
            text(key)
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(default)
        };
        let defaults = Self::default();

        Self {
            host: text("HOST").unwrap_or(defaults.host),
            port: text("PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            log_level: text("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: match text("LOG_FORMAT").as_deref() {
                Some(f) if f.eq_ignore_ascii_case("json") => LogFormat::Json,
                _ => LogFormat::Text,
            },
            database_url: text("DATABASE_URL"),
            approval_grace_hours: text("APPROVAL_GRACE_HOURS")
                .and_then(|v| v.parse::<i64>().ok())
                .filter(|h| *h > 0)
                .unwrap_or(defaults.approval_grace_hours),
            sweep_interval: Duration::from_secs(number("SWEEP_INTERVAL_SECS", 60).max(1)),
            debt_sync_interval: Duration::from_secs(number("DEBT_SYNC_INTERVAL_SECS", 600)),
            registration_session_url: text("REGISTRATION_SESSION_URL"),
            registration_save_url: text("REGISTRATION_SAVE_URL"),
            notification_base_url: text("NOTIFICATION_BASE_URL"),
            notification_token: text("NOTIFICATION_TOKEN"),
            debt_ledger_url: text("DEBT_LEDGER_URL"),
            http_timeout: Duration::from_secs(number("HTTP_TIMEOUT_SECS", 15).max(1)),
            stall_seed_file: text("STALL_SEED_FILE"),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn saga(&self) -> SagaConfig {
        SagaConfig::default().with_approval_grace_hours(self.approval_grace_hours)
    }

    pub fn registration(&self) -> RegistrationConfig {
        RegistrationConfig {
            session_url: self.registration_session_url.clone(),
            save_url: self.registration_save_url.clone(),
            timeout: self.http_timeout,
            ..RegistrationConfig::default()
        }
    }

    pub fn notification(&self) -> NotificationConfig {
        NotificationConfig {
            base_url: self.notification_base_url.clone(),
            token: self.notification_token.clone(),
            timeout: self.http_timeout,
        }
    }

    /// Ledger settings, or `None` when the debt feed is disabled.
    pub fn ledger(&self) -> Option<LedgerConfig> {
        if self.debt_sync_interval.is_zero() {
            return None;
        }
        self.debt_ledger_url.as_ref().map(|url| LedgerConfig {
            url: Some(url.clone()),
            timeout: self.http_timeout,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            database_url: None,
            approval_grace_hours: store::DEFAULT_APPROVAL_GRACE_HOURS,
            sweep_interval: Duration::from_secs(60),
            debt_sync_interval: Duration::from_secs(600),
            registration_session_url: None,
            registration_save_url: None,
            notification_base_url: None,
            notification_token: None,
            debt_ledger_url: None,
            http_timeout: Duration::from_secs(15),
            stall_seed_file: None,
        }
    }
}
