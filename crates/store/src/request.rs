//! Citizen stall requests.

use chrono::{DateTime, Utc};
use common::{MarketId, OrderId, RequestId, StallId};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::person::Citizen;
use crate::stall::Stall;

/// The state of a request in its lifecycle.
///
/// ```text
/// Requested ──► Postulated ──┬──► Approved ──► Finalized
///     ▲  │                    ├──► Rejected
///     │  └──► Cancelled       └──► Requested   (expired or compensated)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum RequestState {
    #[default]
    #[serde(rename = "EN_SOLICITUD")]
    Requested,
    #[serde(rename = "POSTULADA")]
    Postulated,
    #[serde(rename = "APROBADA")]
    Approved,
    #[serde(rename = "RECHAZADA")]
    Rejected,
    #[serde(rename = "CANCELADA")]
    Cancelled,
    #[serde(rename = "FINALIZADA", alias = "LIBERADA")]
    Finalized,
}

impl RequestState {
    /// States in which a request blocks its citizen and its stall from
    /// being part of any other request.
    pub const BLOCKING: [RequestState; 3] = [
        RequestState::Requested,
        RequestState::Postulated,
        RequestState::Approved,
    ];

    pub fn is_blocking(&self) -> bool {
        Self::BLOCKING.contains(self)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestState::Rejected | RequestState::Cancelled | RequestState::Finalized
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestState::Requested => "EN_SOLICITUD",
            RequestState::Postulated => "POSTULADA",
            RequestState::Approved => "APROBADA",
            RequestState::Rejected => "RECHAZADA",
            RequestState::Cancelled => "CANCELADA",
            RequestState::Finalized => "FINALIZADA",
        }
    }
}

impl std::fmt::Display for RequestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for RequestState {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "EN_SOLICITUD" => Ok(RequestState::Requested),
            "POSTULADA" => Ok(RequestState::Postulated),
            "APROBADA" => Ok(RequestState::Approved),
            "RECHAZADA" => Ok(RequestState::Rejected),
            "CANCELADA" => Ok(RequestState::Cancelled),
            "FINALIZADA" | "LIBERADA" => Ok(RequestState::Finalized),
            other => Err(StoreError::Corrupt(format!(
                "unknown request state '{other}'"
            ))),
        }
    }
}

/// A citizen's declared intent to occupy a stall for a date range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub stall_id: StallId,
    pub market_id: MarketId,
    #[serde(default)]
    pub market_name: String,
    #[serde(default)]
    pub section: Option<String>,
    pub citizen: Citizen,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    #[serde(rename = "estado")]
    pub state: RequestState,
    #[serde(default)]
    pub order_id: Option<OrderId>,
    #[serde(default)]
    pub manual: bool,
    #[serde(default)]
    pub operator: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Request {
    /// Builds a fresh request against `stall`, denormalizing its market and
    /// section for querying.
    pub fn new(input: NewRequest, stall: &Stall, now: DateTime<Utc>) -> Self {
        let operator = input
            .operator
            .map(|o| o.trim().to_string())
            .filter(|o| !o.is_empty());
        let manual = input.manual || operator.is_some();
        Self {
            id: RequestId::new(),
            stall_id: stall.id,
            market_id: stall.market_id,
            market_name: stall.block_name.clone().unwrap_or_default(),
            section: stall.section.clone(),
            citizen: input.citizen,
            start_date: input.start_date,
            end_date: input.end_date,
            state: RequestState::Requested,
            order_id: None,
            manual,
            operator,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Input for creating a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRequest {
    pub stall_id: StallId,
    pub citizen: Citizen,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    /// Operator-entered record that bypasses the external integration.
    #[serde(default)]
    pub manual: bool,
    #[serde(default)]
    pub operator: Option<String>,
}

/// Optional fields written together with a request state transition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestPatch {
    /// `Some(Some(id))` links an order, `Some(None)` clears the link.
    pub order_id: Option<Option<OrderId>>,
    pub manual: Option<bool>,
    pub operator: Option<String>,
}

impl RequestPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn link_order(mut self, order_id: OrderId) -> Self {
        self.order_id = Some(Some(order_id));
        self
    }

    pub fn clear_order(mut self) -> Self {
        self.order_id = Some(None);
        self
    }

    /// Tags the request as handled manually by `operator`.
    pub fn by_operator(mut self, operator: impl Into<String>) -> Self {
        self.manual = Some(true);
        self.operator = Some(operator.into());
        self
    }

    pub(crate) fn apply(self, request: &mut Request) {
        if let Some(order_id) = self.order_id {
            request.order_id = order_id;
        }
        if let Some(manual) = self.manual {
            request.manual = manual;
        }
        if let Some(operator) = self.operator {
            request.operator = Some(operator);
        }
    }
}
