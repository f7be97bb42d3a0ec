//! Stall documents and their occupancy state.

use chrono::{DateTime, Utc};
use common::{BlockId, MarketId, StallId};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::person::Occupant;

/// Occupancy state of a stall.
///
/// ```text
/// Free ──try_reserve──► Reserved ──assign/occupy──► Occupied
///  ▲                       │                           │
///  └──release / expiry─────┘◄──────────vacate──────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum StallState {
    #[default]
    #[serde(rename = "LIBRE", alias = "disponible", alias = "DISPONIBLE", alias = "available")]
    Free,
    #[serde(rename = "RESERVADO")]
    Reserved,
    #[serde(rename = "OCUPADO")]
    Occupied,
}

impl StallState {
    /// States from which a stall may be occupied. Free is accepted so a
    /// retried approval does not fail after the reservation lapsed.
    pub const OCCUPIABLE: [StallState; 2] = [StallState::Reserved, StallState::Free];

    /// States that count as an active claim on the stall.
    pub const CLAIMED: [StallState; 2] = [StallState::Reserved, StallState::Occupied];

    pub fn as_str(&self) -> &'static str {
        match self {
            StallState::Free => "LIBRE",
            StallState::Reserved => "RESERVADO",
            StallState::Occupied => "OCUPADO",
        }
    }

    pub fn is_claimed(&self) -> bool {
        Self::CLAIMED.contains(self)
    }
}

impl std::fmt::Display for StallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for StallState {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "LIBRE" | "disponible" | "DISPONIBLE" | "available" | "FREE" => Ok(StallState::Free),
            "RESERVADO" | "RESERVED" => Ok(StallState::Reserved),
            "OCUPADO" | "OCCUPIED" => Ok(StallState::Occupied),
            other => Err(StoreError::Corrupt(format!("unknown stall state '{other}'"))),
        }
    }
}

/// A physical market stall.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stall {
    pub id: StallId,
    pub code: String,
    pub name: String,
    pub market_id: MarketId,
    #[serde(default)]
    pub block_id: Option<BlockId>,
    #[serde(default)]
    pub block_name: Option<String>,
    #[serde(default)]
    pub section: Option<String>,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(rename = "estado", default)]
    pub state: StallState,
    #[serde(default)]
    pub reserved_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub current_occupant: Option<Occupant>,
    #[serde(default)]
    pub occupant_history: Vec<Occupant>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_active() -> bool {
    true
}

impl Stall {
    /// Code used by the municipal systems: the part after `T-`, or the whole
    /// trimmed code when there is no such prefix.
    pub fn external_code(&self) -> &str {
        external_code(&self.code)
    }

    /// True if the stall code ends with `T-{code}`, ignoring case.
    pub fn matches_external_code(&self, code: &str) -> bool {
        let wanted = format!("T-{}", code.trim()).to_lowercase();
        self.code.trim().to_lowercase().ends_with(&wanted)
    }

    /// True if the stall is Occupied and its current occupant, if any, is
    /// this citizen.
    pub fn is_held_by(&self, national_id: &str) -> bool {
        self.state == StallState::Occupied
            && self
                .current_occupant
                .as_ref()
                .is_none_or(|o| o.national_id() == national_id)
    }

    /// True if the stall is Reserved with `reserved_until <= now`.
    pub fn reservation_lapsed(&self, now: DateTime<Utc>) -> bool {
        self.state == StallState::Reserved && self.reserved_until.is_some_and(|until| until <= now)
    }

    /// Human-readable location (block name, else section).
    pub fn location(&self) -> &str {
        self.block_name
            .as_deref()
            .or(self.section.as_deref())
            .unwrap_or_default()
    }
}

pub(crate) fn external_code(code: &str) -> &str {
    match code.split_once("T-") {
        Some((_, rest)) => rest.trim(),
        None => code.trim(),
    }
}

/// Catalog data for creating a stall.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewStall {
    pub code: String,
    pub name: String,
    pub market_id: MarketId,
    #[serde(default)]
    pub block_id: Option<BlockId>,
    #[serde(default)]
    pub block_name: Option<String>,
    #[serde(default)]
    pub section: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl NewStall {
    pub fn new(code: impl Into<String>, name: impl Into<String>, market_id: MarketId) -> Self {
        Self {
            code: code.into(),
            name: name.into(),
            market_id,
            block_id: None,
            block_name: None,
            section: None,
            tags: Vec::new(),
        }
    }

    pub fn in_section(mut self, section: impl Into<String>) -> Self {
        self.section = Some(section.into());
        self
    }

    pub fn in_block(mut self, block_id: BlockId, block_name: impl Into<String>) -> Self {
        self.block_id = Some(block_id);
        self.block_name = Some(block_name.into());
        self
    }

    /// Materializes a free, active stall.
    pub fn into_stall(self, now: DateTime<Utc>) -> Stall {
        Stall {
            id: StallId::new(),
            code: self.code.trim().to_string(),
            name: self.name.trim().to_string(),
            market_id: self.market_id,
            block_id: self.block_id,
            block_name: self.block_name,
            section: self.section,
            is_active: true,
            tags: self.tags,
            state: StallState::Free,
            reserved_until: None,
            current_occupant: None,
            occupant_history: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}
