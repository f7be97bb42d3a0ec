//! Citizen data as it travels between requests, orders and stalls.
//!
//! Field names on the wire follow the shared document format used by the
//! municipal systems (`nombre`, `cedula`, `fechaInicio`, ...).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity and contact data of a citizen.
///
/// Requests embed it as entered; orders keep a copy taken at postulation time.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Citizen {
    #[serde(rename = "nombre")]
    pub full_name: String,
    #[serde(rename = "apellido", default)]
    pub last_name: String,
    #[serde(rename = "cedula")]
    pub national_id: String,
    #[serde(rename = "codigoDactilar", default)]
    pub fingerprint_code: String,
    #[serde(rename = "telefono", default)]
    pub phone: String,
    #[serde(default)]
    pub email: String,
    #[serde(rename = "provincia", default)]
    pub province: String,
    #[serde(rename = "ciudad", default)]
    pub city: String,
}

impl Citizen {
    /// Creates a citizen with a name and national id; contact fields empty.
    pub fn new(full_name: impl Into<String>, national_id: impl Into<String>) -> Self {
        Self {
            full_name: full_name.into(),
            national_id: national_id.into().trim().to_string(),
            ..Self::default()
        }
    }

    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.phone = phone.into();
        self
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = email.into();
        self
    }

    pub fn with_fingerprint_code(mut self, code: impl Into<String>) -> Self {
        self.fingerprint_code = code.into();
        self
    }

    pub fn with_location(mut self, province: impl Into<String>, city: impl Into<String>) -> Self {
        self.province = province.into();
        self.city = city.into();
        self
    }

    /// Builds the occupant record written onto a stall for a planned window.
    pub fn occupant(&self, planned_start: DateTime<Utc>, planned_end: DateTime<Utc>) -> Occupant {
        Occupant {
            person: self.clone(),
            planned_start,
            planned_end: Some(planned_end),
            actual_end: None,
        }
    }
}

/// A person in charge of a stall, current or historical.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Occupant {
    #[serde(flatten)]
    pub person: Citizen,
    #[serde(rename = "fechaInicio")]
    pub planned_start: DateTime<Utc>,
    #[serde(rename = "fechaFin", default)]
    pub planned_end: Option<DateTime<Utc>>,
    #[serde(rename = "fechaFinReal", default)]
    pub actual_end: Option<DateTime<Utc>>,
}

impl Occupant {
    /// Returns the record closed at `actual_end`.
    pub fn closed(mut self, actual_end: DateTime<Utc>) -> Self {
        self.actual_end = Some(actual_end);
        self
    }

    pub fn national_id(&self) -> &str {
        &self.person.national_id
    }
}
