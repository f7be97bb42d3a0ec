//! Reservation orders: the time-boxed record the sweeper acts on.

use chrono::{DateTime, Duration, Utc};
use common::{MarketId, OrderId, RequestId, StallId};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::person::Citizen;

/// Grace period between postulation and the approval deadline.
pub const DEFAULT_APPROVAL_GRACE_HOURS: i64 = 24;

/// The state of a reservation order.
///
/// ```text
/// Pending ──┬──► Assigned / Occupied ──► Released
///           ├──► Rejected
///           └──► Expired
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum OrderState {
    /// Waiting for approval (or for the external payment to settle).
    #[default]
    #[serde(rename = "EN_SOLICITUD")]
    Pending,
    #[serde(rename = "ASIGNADA")]
    Assigned,
    #[serde(rename = "OCUPADA")]
    Occupied,
    #[serde(rename = "LIBERADA")]
    Released,
    #[serde(rename = "RECHAZADA")]
    Rejected,
    #[serde(rename = "VENCIDA")]
    Expired,
}

impl OrderState {
    /// States in which an order holds (or is about to hold) its stall.
    pub const ACTIVE: [OrderState; 3] = [
        OrderState::Pending,
        OrderState::Assigned,
        OrderState::Occupied,
    ];

    /// States in which the citizen is occupying the stall.
    pub const OCCUPYING: [OrderState; 2] = [OrderState::Assigned, OrderState::Occupied];

    pub fn is_active(&self) -> bool {
        Self::ACTIVE.contains(self)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderState::Pending => "EN_SOLICITUD",
            OrderState::Assigned => "ASIGNADA",
            OrderState::Occupied => "OCUPADA",
            OrderState::Released => "LIBERADA",
            OrderState::Rejected => "RECHAZADA",
            OrderState::Expired => "VENCIDA",
        }
    }
}

impl std::fmt::Display for OrderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for OrderState {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "EN_SOLICITUD" => Ok(OrderState::Pending),
            "ASIGNADA" => Ok(OrderState::Assigned),
            "OCUPADA" => Ok(OrderState::Occupied),
            "LIBERADA" => Ok(OrderState::Released),
            "RECHAZADA" => Ok(OrderState::Rejected),
            "VENCIDA" => Ok(OrderState::Expired),
            other => Err(StoreError::Corrupt(format!("unknown order state '{other}'"))),
        }
    }
}

/// Zero-padded human-readable order reference, e.g. `"0007"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderReference(String);

impl OrderReference {
    /// Minimum rendered width.
    pub const WIDTH: usize = 4;

    pub fn from_sequence(sequence: u64) -> Self {
        Self(format!("{:0width$}", sequence, width = Self::WIDTH))
    }

    /// Normalizes user input (`"7"`, `" 0007 "`) to the stored form.
    pub fn parse(input: &str) -> Self {
        Self(format!("{:0>width$}", input.trim(), width = Self::WIDTH))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for OrderReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Payment/registration evidence attached to an order.
///
/// Each producer has its own variant; only the third-party response body is
/// kept as an opaque blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tipo")]
pub enum ExternalPayment {
    /// Synthesized locally for operator-entered postulations.
    #[serde(rename = "manual")]
    Manual(ManualPayment),
    /// Response of the external registration service.
    #[serde(rename = "integracion")]
    Integrated(IntegratedPayment),
    /// Settlement record picked up from the debt ledger.
    #[serde(rename = "deuda")]
    Ledger(LedgerPayment),
}

impl ExternalPayment {
    pub fn kind(&self) -> &'static str {
        match self {
            ExternalPayment::Manual(_) => "manual",
            ExternalPayment::Integrated(_) => "integracion",
            ExternalPayment::Ledger(_) => "deuda",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualPayment {
    #[serde(rename = "creadoPor")]
    pub created_by: String,
    pub ip: String,
    #[serde(rename = "fecha")]
    pub at: DateTime<Utc>,
    #[serde(rename = "detalle")]
    pub note: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegratedPayment {
    #[serde(rename = "sessionId", default)]
    pub session_id: Option<String>,
    #[serde(rename = "respuesta")]
    pub response: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerPayment {
    #[serde(flatten)]
    pub record: serde_json::Map<String, serde_json::Value>,
}

/// A time-boxed reservation or occupation of one stall by one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReservationOrder {
    pub id: OrderId,
    pub sequence: u64,
    pub reference: OrderReference,
    pub stall_id: StallId,
    pub request_id: RequestId,
    pub market_id: MarketId,
    #[serde(default)]
    pub section: Option<String>,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    #[serde(rename = "estado")]
    pub state: OrderState,
    pub approve_before: DateTime<Utc>,
    #[serde(default)]
    pub release_at: Option<DateTime<Utc>>,
    pub occupant: Citizen,
    #[serde(default)]
    pub external_payment: Option<ExternalPayment>,
    #[serde(default)]
    pub observation: Option<String>,
    #[serde(default)]
    pub manual: bool,
    #[serde(default)]
    pub operator: Option<String>,
    #[serde(default)]
    pub assigned_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expired_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub released_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub rejected_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ReservationOrder {
    /// Creates a pending order whose approval deadline is `now + grace`.
    pub fn new(input: NewOrder, now: DateTime<Utc>, grace: Duration) -> Self {
        Self {
            id: OrderId::new(),
            sequence: input.sequence,
            reference: OrderReference::from_sequence(input.sequence),
            stall_id: input.stall_id,
            request_id: input.request_id,
            market_id: input.market_id,
            section: input.section,
            start_date: input.start_date,
            end_date: input.end_date,
            state: OrderState::Pending,
            approve_before: now + grace,
            release_at: None,
            occupant: input.occupant,
            external_payment: input.external_payment,
            observation: None,
            manual: input.manual,
            operator: input.operator,
            assigned_at: None,
            expired_at: None,
            released_at: None,
            rejected_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// True once the occupation window or the scheduled release has passed.
    pub fn is_due_for_release(&self, now: DateTime<Utc>) -> bool {
        OrderState::OCCUPYING.contains(&self.state)
            && (self.release_at.is_some_and(|at| at <= now) || self.end_date <= now)
    }

    /// True when a pending order missed its approval deadline.
    pub fn is_due_for_expiry(&self, now: DateTime<Utc>) -> bool {
        self.state == OrderState::Pending && self.approve_before <= now
    }

    /// Stamps the audit timestamp that belongs to entering `state`.
    pub(crate) fn stamp(&mut self, state: OrderState, at: DateTime<Utc>) {
        match state {
            OrderState::Assigned | OrderState::Occupied => self.assigned_at = Some(at),
            OrderState::Released => self.released_at = Some(at),
            OrderState::Rejected => self.rejected_at = Some(at),
            OrderState::Expired => self.expired_at = Some(at),
            OrderState::Pending => self.assigned_at = None,
        }
    }
}

/// Input for creating an order.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub sequence: u64,
    pub stall_id: StallId,
    pub request_id: RequestId,
    pub market_id: MarketId,
    pub section: Option<String>,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub occupant: Citizen,
    pub external_payment: Option<ExternalPayment>,
    pub manual: bool,
    pub operator: Option<String>,
}

/// Optional fields written together with an order state transition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrderPatch {
    pub release_at: Option<DateTime<Utc>>,
    pub external_payment: Option<ExternalPayment>,
    pub observation: Option<String>,
    pub manual: Option<bool>,
    pub operator: Option<String>,
}

impl OrderPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn release_at(mut self, at: DateTime<Utc>) -> Self {
        self.release_at = Some(at);
        self
    }

    pub fn observation(mut self, text: impl Into<String>) -> Self {
        self.observation = Some(text.into());
        self
    }

    pub fn payment(mut self, payment: ExternalPayment) -> Self {
        self.external_payment = Some(payment);
        self
    }

    pub fn by_operator(mut self, operator: impl Into<String>) -> Self {
        self.manual = Some(true);
        self.operator = Some(operator.into());
        self
    }

    pub(crate) fn apply(self, order: &mut ReservationOrder) {
        if let Some(at) = self.release_at {
            order.release_at = Some(at);
        }
        if let Some(payment) = self.external_payment {
            order.external_payment = Some(payment);
        }
        if let Some(text) = self.observation {
            order.observation = Some(text);
        }
        if let Some(manual) = self.manual {
            order.manual = manual;
        }
        if let Some(operator) = self.operator {
            order.operator = Some(operator);
        }
    }
}
