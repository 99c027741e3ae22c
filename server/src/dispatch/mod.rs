//! Ride request dispatch: broadcast a booking to eligible drivers and
//! resolve exactly one acceptance.
//!
//! - `store`: SQL and the compare-and-swap transitions
//! - `broadcast`: Request Broadcast Channel (fan-out + closing notices)
//! - `arbiter`: accept / decline / cancel
//! - `expiry`: server-authoritative timeout sweep
//! - `drivers`: license verification records
//! - `routes`: REST adapters

pub mod arbiter;
pub mod broadcast;
pub mod drivers;
pub mod expiry;
pub mod routes;
pub mod store;

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a ride request. Only `Open` is non-terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RideStatus {
    Open,
    Accepted,
    Expired,
    Cancelled,
}

impl RideStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Accepted => "accepted",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(Self::Open),
            "accepted" => Some(Self::Accepted),
            "expired" => Some(Self::Expired),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Open)
    }
}

impl fmt::Display for RideStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ToSql for RideStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for RideStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        Self::parse(s).ok_or_else(|| FromSqlError::Other(format!("unknown ride status {s}").into()))
    }
}

/// Why a driver's pending request was withdrawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    AcceptedByAnother,
    /// Customer cancellation and timeout expiry both surface as cancelled.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CarSummary {
    pub id: String,
    pub make: String,
    pub model: String,
    pub year: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plate: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceTerms {
    pub daily_rate_cents: i64,
    pub total_cents: i64,
    pub currency: String,
}

/// A single dispatch offer tied to one booking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RideRequest {
    pub id: String,
    pub booking_id: String,
    pub customer_id: String,
    pub car: CarSummary,
    pub pickup_location: String,
    pub pickup_at: DateTime<Utc>,
    pub return_at: DateTime<Utc>,
    pub price: PriceTerms,
    pub status: RideStatus,
    pub accepted_driver_id: Option<String>,
    /// Unix millis; the expiry clock starts here.
    pub created_at: i64,
    pub closed_at: Option<i64>,
}

/// Input for a new dispatch. The booking itself already exists upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewRideRequest {
    pub booking_id: String,
    pub car: CarSummary,
    pub pickup_location: String,
    pub pickup_at: DateTime<Utc>,
    pub return_at: DateTime<Utc>,
    pub price: PriceTerms,
}

impl NewRideRequest {
    pub fn validate(&self) -> Result<(), crate::error::DispatchError> {
        use crate::error::DispatchError;

        if self.booking_id.trim().is_empty() {
            return Err(DispatchError::Invalid("bookingId is required".into()));
        }
        if self.pickup_location.trim().is_empty() {
            return Err(DispatchError::Invalid("pickupLocation is required".into()));
        }
        if self.return_at <= self.pickup_at {
            return Err(DispatchError::Invalid("returnAt must be after pickupAt".into()));
        }
        if self.price.total_cents < 0 || self.price.daily_rate_cents < 0 {
            return Err(DispatchError::Invalid("price must not be negative".into()));
        }
        Ok(())
    }
}
