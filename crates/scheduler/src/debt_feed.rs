//! Debt synchronization feed: approves pending orders the ledger reports as paid.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use domain::{ApprovalService, OrderLocator};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use store::{ExternalPayment, LedgerPayment, ReservationStore};

use crate::error::{Result, SchedulerError};
use crate::job::Job;

/// Invoice statuses that count as paid.
pub const SETTLED_STATUSES: [&str; 2] = ["RECAUDADO", "PEND_CONCILIACION"];

/// One record of the debt ledger.
///
/// The ledger mixes strings and numbers for the same fields, so values are
/// read leniently. Every field, known or not, is kept and later attached to
/// the approved order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LedgerRecord(Map<String, Value>);

impl LedgerRecord {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    /// `EST_FACTURA`.
    pub fn status(&self) -> Option<String> {
        self.text("EST_FACTURA")
    }

    /// `ID_EXPOSITOR`: the citizen's national id.
    pub fn national_id(&self) -> Option<String> {
        self.text("ID_EXPOSITOR")
    }

    /// `COD_PUESTO`: the stall's external code.
    pub fn stall_code(&self) -> Option<String> {
        self.text("COD_PUESTO")
    }

    /// `SOLIC`: the ledger's own request number, only used in logs.
    pub fn request_number(&self) -> Option<String> {
        self.text("SOLIC")
    }

    pub fn is_settled(&self) -> bool {
        self.status()
            .is_some_and(|s| SETTLED_STATUSES.contains(&s.to_uppercase().as_str()))
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_fields(self) -> Map<String, Value> {
        self.0
    }

    fn text(&self, key: &str) -> Option<String> {
        match self.0.get(key)? {
            Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// Source of settlement records.
#[async_trait]
pub trait DebtLedger: Send + Sync + 'static {
    async fn fetch(&self) -> Result<Vec<LedgerRecord>>;
}

#[derive(Debug, Default)]
struct InMemoryLedgerState {
    records: Vec<LedgerRecord>,
    fail_on_fetch: bool,
}

/// In-memory ledger for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDebtLedger {
    state: Arc<RwLock<InMemoryLedgerState>>,
}

impl InMemoryDebtLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a record from a JSON object; non-objects are ignored.
    pub fn push_record(&self, record: Value) {
        if let Value::Object(fields) = record {
            self.state
                .write()
                .unwrap()
                .records
                .push(LedgerRecord::new(fields));
        }
    }

    pub fn set_fail_on_fetch(&self, fail: bool) {
        self.state.write().unwrap().fail_on_fetch = fail;
    }

    pub fn record_count(&self) -> usize {
        self.state.read().unwrap().records.len()
    }
}

#[async_trait]
impl DebtLedger for InMemoryDebtLedger {
    async fn fetch(&self) -> Result<Vec<LedgerRecord>> {
        let state = self.state.read().unwrap();
        if state.fail_on_fetch {
            return Err(SchedulerError::Ledger("ledger unavailable".to_string()));
        }
        Ok(state.records.clone())
    }
}

/// Connection settings for the HTTP ledger.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub url: Option<String>,
    pub timeout: Duration,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout: Duration::from_secs(15),
        }
    }
}

/// Ledger served over HTTP as a JSON array of records.
#[derive(Debug, Clone)]
pub struct HttpDebtLedger {
    client: reqwest::Client,
    config: LedgerConfig,
}

impl HttpDebtLedger {
    pub fn new(config: LedgerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| SchedulerError::Ledger(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl DebtLedger for HttpDebtLedger {
    async fn fetch(&self) -> Result<Vec<LedgerRecord>> {
        let Some(url) = self.config.url.as_deref() else {
            return Err(SchedulerError::Ledger("ledger URL is not configured".to_string()));
        };

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| SchedulerError::Ledger(e.to_string()))?;
        if !response.status().is_success() {
            return Err(SchedulerError::Ledger(format!(
                "ledger returned HTTP {}",
                response.status().as_u16()
            )));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| SchedulerError::Ledger(format!("invalid ledger body: {e}")))?;

        // Anything but an array of objects is an empty batch.
        let records = match body {
            Value::Array(items) => items
                .into_iter()
                .filter_map(|item| match item {
                    Value::Object(fields) => Some(LedgerRecord::new(fields)),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        };
        Ok(records)
    }
}

/// What one feed run did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FeedReport {
    pub fetched: u64,
    pub settled: u64,
    pub approved: u64,
    /// Settled records with no matching stall or pending order.
    pub unmatched: u64,
    pub failures: u64,
}

/// Polls the ledger and approves the pending orders it reports as paid.
pub struct DebtFeed<S: ReservationStore, L: DebtLedger> {
    store: S,
    ledger: L,
    approvals: ApprovalService<S>,
}

impl<S: ReservationStore, L: DebtLedger> DebtFeed<S, L> {
    pub fn new(store: S, ledger: L, approvals: ApprovalService<S>) -> Self {
        Self {
            store,
            ledger,
            approvals,
        }
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    /// Processes one ledger batch. A failing record is logged and skipped.
    #[tracing::instrument(skip(self))]
    pub async fn sync(&self) -> FeedReport {
        let mut report = FeedReport::default();

        let records = match self.ledger.fetch().await {
            Ok(records) => records,
            Err(e) => {
                tracing::error!(error = %e, "debt ledger fetch failed");
                return report;
            }
        };
        report.fetched = records.len() as u64;
        metrics::counter!("debt_feed_records_total").increment(report.fetched);
        if records.is_empty() {
            return report;
        }
        tracing::debug!(records = records.len(), "debt ledger batch received");

        for record in records {
            if !record.is_settled() {
                continue;
            }
            report.settled += 1;
            match self.apply(record).await {
                Ok(true) => report.approved += 1,
                Ok(false) => report.unmatched += 1,
                Err(e) => {
                    tracing::error!(error = %e, "debt ledger record failed");
                    report.failures += 1;
                }
            }
        }

        metrics::counter!("debt_feed_approvals_total").increment(report.approved);
        tracing::info!(
            fetched = report.fetched,
            settled = report.settled,
            approved = report.approved,
            unmatched = report.unmatched,
            failures = report.failures,
            "debt feed finished"
        );
        report
    }

    /// Approves the order a settled record points at. Returns false when
    /// there is nothing to match.
    async fn apply(&self, record: LedgerRecord) -> std::result::Result<bool, domain::DomainError> {
        let (Some(national_id), Some(code)) = (record.national_id(), record.stall_code()) else {
            tracing::warn!(solic = ?record.request_number(), "settled record without national id or stall code");
            return Ok(false);
        };

        let Some(stall) = self.store.stall_by_external_code(&code).await? else {
            tracing::warn!(stall_code = %code, "no stall for ledger stall code");
            return Ok(false);
        };
        let Some(order) = self.store.pending_order_for(&national_id, stall.id).await? else {
            tracing::debug!(%national_id, stall_code = %code, "no pending order for settled record");
            return Ok(false);
        };

        tracing::info!(order_id = %order.id, stall_code = %code, %national_id, "approving order settled in ledger");
        self.approvals.approve(&OrderLocator::Id(order.id)).await?;
        self.store
            .set_payment(
                order.id,
                ExternalPayment::Ledger(LedgerPayment {
                    record: record.into_fields(),
                }),
            )
            .await?;
        Ok(true)
    }
}

#[async_trait]
impl<S: ReservationStore, L: DebtLedger> Job for DebtFeed<S, L> {
    type Output = FeedReport;

    fn name(&self) -> &'static str {
        "debt_feed"
    }

    async fn run(&self) -> FeedReport {
        self.sync().await
    }
}
