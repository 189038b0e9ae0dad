//! Shared types for the overtime reconciliation engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Newtype wrapper for booking IDs to provide type safety
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct BookingId(pub i64);

impl std::fmt::Display for BookingId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Newtype wrapper for parking spot numbers (e.g. "A-12")
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct SpotId(pub String);

impl SpotId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SpotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Canonical overtime rate. The backend and the client display logic disagreed
/// historically; 50¢/min is the rate users are shown, so it is the one rate
/// every call site uses. All money is integer cents.
pub const OVERTIME_RATE_CENTS_PER_MINUTE: u64 = 50;

/// Cost in cents for a number of whole overtime minutes
#[inline]
pub fn overtime_cost_cents(minutes: u64) -> u64 {
    minutes * OVERTIME_RATE_CENTS_PER_MINUTE
}

/// Booking lifecycle status as reported by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    Active,
    Completed,
    Cancelled,
}

impl BookingStatus {
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Active => "active",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
        }
    }
}

/// A reservation as normalized from the backend bookings endpoint.
///
/// Only nominal, server-owned attributes live here. Everything the engine
/// derives (grace window, timer start, overtime totals) belongs to
/// [`crate::domain::session::ParkingSession`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Booking {
    pub id: BookingId,
    pub spot: SpotId,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status: BookingStatus,
    /// Base (non-overtime) cost in cents
    pub base_cost_cents: u64,
}

/// LED color reported by an ESP32 spot sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedColor {
    /// Spot occupied
    Red,
    /// Spot free
    Blue,
    Off,
    Unknown,
}

impl LedColor {
    /// Parse a wire color string, tolerating case and unknown values
    pub fn from_wire(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "red" => LedColor::Red,
            "blue" => LedColor::Blue,
            "off" => LedColor::Off,
            _ => LedColor::Unknown,
        }
    }

    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            LedColor::Red => "red",
            LedColor::Blue => "blue",
            LedColor::Off => "off",
            LedColor::Unknown => "unknown",
        }
    }
}

/// A single spot's sensor state as normalized from the availability endpoint.
///
/// Not persisted; recomputed on every poll.
#[derive(Debug, Clone)]
pub struct SensorReading {
    pub spot: SpotId,
    /// Raw availability boolean, if the sensor reported one
    pub is_available: Option<bool>,
    /// Seconds since the sensor last reported, if known
    pub age_secs: Option<u64>,
    pub led: LedColor,
}

/// Tri-state occupancy signal produced by the sensor reconciler.
///
/// `Unknown` means "no usable data" and must never be read as `Vacant`:
/// completing a session on missing data would cancel a legitimate charge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Occupancy {
    Occupied,
    Vacant,
    Unknown,
}

impl Occupancy {
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            Occupancy::Occupied => "occupied",
            Occupancy::Vacant => "vacant",
            Occupancy::Unknown => "unknown",
        }
    }
}

/// Snapshot answer for the host application's overtime query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OvertimeStatus {
    pub overtime_minutes: u64,
    pub overtime_cost_cents: u64,
    /// True while the session is actively accruing overtime
    pub is_active: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overtime_cost() {
        assert_eq!(overtime_cost_cents(0), 0);
        assert_eq!(overtime_cost_cents(1), 50);
        assert_eq!(overtime_cost_cents(90), 4500);
    }

    #[test]
    fn test_led_from_wire() {
        assert_eq!(LedColor::from_wire("red"), LedColor::Red);
        assert_eq!(LedColor::from_wire("RED"), LedColor::Red);
        assert_eq!(LedColor::from_wire("Blue"), LedColor::Blue);
        assert_eq!(LedColor::from_wire("off"), LedColor::Off);
        assert_eq!(LedColor::from_wire("purple"), LedColor::Unknown);
        assert_eq!(LedColor::from_wire(""), LedColor::Unknown);
    }

    #[test]
    fn test_status_as_str() {
        assert_eq!(BookingStatus::Active.as_str(), "active");
        assert_eq!(BookingStatus::Completed.as_str(), "completed");
        assert_eq!(BookingStatus::Cancelled.as_str(), "cancelled");
    }
}
