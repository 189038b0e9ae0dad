//! Backend REST client
//!
//! All remote state lives behind the [`BackendApi`] trait so the engine can
//! be exercised against a scripted backend in tests. [`HttpBackend`] is the
//! production implementation: JSON over HTTP with a bearer token.
//!
//! Every endpoint has exactly one adapter function that maps its wire payload
//! into the fixed internal types; nothing downstream ever touches raw JSON.

use crate::domain::types::{
    Booking, BookingId, BookingStatus, LedColor, SensorReading, SpotId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum BackendError {
    /// 401/403: the token is dead. Never retried; triggers forced logout.
    #[error("unauthorized")]
    Unauthorized,
    /// The circuit breaker refused the call before it was attempted
    #[error("circuit open")]
    CircuitOpen,
    #[error("backend returned status {0}")]
    Status(u16),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

impl BackendError {
    /// Whether retrying could plausibly help
    pub fn is_transient(&self) -> bool {
        match self {
            BackendError::Http(_) => true,
            BackendError::Status(code) => *code >= 500 || *code == 429,
            BackendError::Unauthorized | BackendError::CircuitOpen | BackendError::Decode(_) => {
                false
            }
        }
    }
}

/// Normalized availability answer: per-spot readings plus the network-wide
/// offline flag (no sensor data exists anywhere).
#[derive(Debug, Clone, Default)]
pub struct AvailabilitySnapshot {
    pub offline: bool,
    pub readings: HashMap<SpotId, SensorReading>,
}

/// Normalized answer from the check-and-bill endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OvertimeCharge {
    pub minutes: u64,
    pub cost_cents: u64,
    pub is_overtime: bool,
    pub total_cost_cents: u64,
}

/// Normalized answer from the detect-car-parked endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectParkedOutcome {
    /// Occupancy accepted; the booking timer is running
    TimerStarted,
    /// The grace window had already expired server-side
    GraceExpired,
}

#[async_trait]
pub trait BackendApi: Send + Sync {
    async fn fetch_bookings(&self) -> Result<Vec<Booking>, BackendError>;
    async fn fetch_availability(&self) -> Result<AvailabilitySnapshot, BackendError>;
    /// Idempotent overtime upsert: the backend accepts "at least this much
    /// overtime" and never double-applies.
    async fn check_and_bill(
        &self,
        id: BookingId,
        minutes: u64,
        cost_cents: u64,
    ) -> Result<OvertimeCharge, BackendError>;
    async fn detect_car_parked(&self, id: BookingId)
        -> Result<DetectParkedOutcome, BackendError>;
    async fn complete_booking(
        &self,
        id: BookingId,
        minutes: u64,
        cost_cents: u64,
        idempotency_key: &str,
    ) -> Result<(), BackendError>;
}

// ---------------------------------------------------------------------------
// Wire shapes and adapters
// ---------------------------------------------------------------------------

/// The bookings list arrives either wrapped or bare depending on backend
/// version; both normalize through the same adapter.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum BookingsWire {
    Wrapped { bookings: Vec<BookingWire> },
    Bare(Vec<BookingWire>),
}

#[derive(Debug, Deserialize)]
pub struct BookingWire {
    pub id: i64,
    pub status: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub parking_spot: SpotWire,
    #[serde(default)]
    pub base_cost: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct SpotWire {
    pub spot_number: String,
}

#[inline]
fn dollars_to_cents(dollars: f64) -> u64 {
    if dollars.is_finite() && dollars > 0.0 {
        (dollars * 100.0).round() as u64
    } else {
        0
    }
}

/// Adapter for `GET /bookings`
pub fn normalize_bookings(wire: BookingsWire) -> Vec<Booking> {
    let raw = match wire {
        BookingsWire::Wrapped { bookings } => bookings,
        BookingsWire::Bare(bookings) => bookings,
    };

    raw.into_iter()
        .filter_map(|b| {
            let status = match b.status.as_str() {
                "active" => BookingStatus::Active,
                "completed" => BookingStatus::Completed,
                "cancelled" => BookingStatus::Cancelled,
                other => {
                    warn!(booking_id = %b.id, status = %other, "booking_unknown_status");
                    return None;
                }
            };
            Some(Booking {
                id: BookingId(b.id),
                spot: SpotId(b.parking_spot.spot_number),
                start_time: b.start_time,
                end_time: b.end_time,
                status,
                base_cost_cents: dollars_to_cents(b.base_cost.unwrap_or(0.0)),
            })
        })
        .collect()
}

#[derive(Debug, Deserialize)]
pub struct AvailabilityWire {
    #[serde(default)]
    pub offline: bool,
    #[serde(default)]
    pub spots: Option<Vec<SpotReadingWire>>,
    #[serde(default)]
    pub parking_spots: Option<Vec<SpotReadingWire>>,
}

#[derive(Debug, Deserialize)]
pub struct SpotReadingWire {
    pub spot_number: String,
    #[serde(default)]
    pub is_available: Option<bool>,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    pub device_status: Option<String>,
    #[serde(default)]
    pub led_color: Option<String>,
}

/// Adapter for `GET /iot/parking/availability`.
///
/// `now` is injected so staleness math is testable. A spot whose device is
/// reported offline keeps its entry but carries no occupancy data, which the
/// sensor reconciler maps to `Unknown`.
pub fn normalize_availability(wire: AvailabilityWire, now: DateTime<Utc>) -> AvailabilitySnapshot {
    let raw = wire.spots.or(wire.parking_spots).unwrap_or_default();

    let mut readings = HashMap::with_capacity(raw.len());
    for spot in raw {
        let spot_id = SpotId(spot.spot_number);
        let age_secs =
            spot.last_seen.map(|seen| (now - seen).num_seconds().max(0) as u64);
        let device_offline =
            spot.device_status.as_deref().is_some_and(|s| s.eq_ignore_ascii_case("offline"));

        let reading = if device_offline {
            SensorReading {
                spot: spot_id.clone(),
                is_available: None,
                age_secs,
                led: LedColor::Unknown,
            }
        } else {
            SensorReading {
                spot: spot_id.clone(),
                is_available: spot.is_available,
                age_secs,
                led: spot.led_color.as_deref().map(LedColor::from_wire).unwrap_or(LedColor::Unknown),
            }
        };
        readings.insert(spot_id, reading);
    }

    AvailabilitySnapshot { offline: wire.offline, readings }
}

#[derive(Debug, Deserialize)]
pub struct CheckAndBillWire {
    pub overtime_minutes: u64,
    pub overtime_cost: f64,
    pub is_overtime: bool,
    pub total_cost_with_overtime: f64,
}

/// Adapter for `POST /bookings/{id}/overtime/check-and-bill`
pub fn normalize_charge(wire: CheckAndBillWire) -> OvertimeCharge {
    OvertimeCharge {
        minutes: wire.overtime_minutes,
        cost_cents: dollars_to_cents(wire.overtime_cost),
        is_overtime: wire.is_overtime,
        total_cost_cents: dollars_to_cents(wire.total_cost_with_overtime),
    }
}

#[derive(Debug, Deserialize)]
pub struct DetectParkedWire {
    pub status: String,
}

/// Adapter for `POST /bookings/{id}/detect-car-parked`
pub fn normalize_detect_outcome(wire: DetectParkedWire) -> DetectParkedOutcome {
    if wire.status == "cancelled" {
        DetectParkedOutcome::GraceExpired
    } else {
        DetectParkedOutcome::TimerStarted
    }
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpBackend {
    pub fn new(base_url: &str, token: &str, timeout: Duration) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn check_status(status: reqwest::StatusCode) -> Result<(), BackendError> {
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(BackendError::Unauthorized);
        }
        if !status.is_success() {
            return Err(BackendError::Status(status.as_u16()));
        }
        Ok(())
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, BackendError> {
        let resp = self.client.get(self.url(path)).bearer_auth(&self.token).send().await?;
        Self::check_status(resp.status())?;
        resp.json().await.map_err(|e| BackendError::Decode(e.to_string()))
    }

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<T, BackendError> {
        let resp = self
            .client
            .post(self.url(path))
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?;
        Self::check_status(resp.status())?;
        resp.json().await.map_err(|e| BackendError::Decode(e.to_string()))
    }
}

#[async_trait]
impl BackendApi for HttpBackend {
    async fn fetch_bookings(&self) -> Result<Vec<Booking>, BackendError> {
        let wire: BookingsWire = self.get_json("/bookings").await?;
        Ok(normalize_bookings(wire))
    }

    async fn fetch_availability(&self) -> Result<AvailabilitySnapshot, BackendError> {
        let wire: AvailabilityWire = self.get_json("/iot/parking/availability").await?;
        Ok(normalize_availability(wire, Utc::now()))
    }

    async fn check_and_bill(
        &self,
        id: BookingId,
        minutes: u64,
        cost_cents: u64,
    ) -> Result<OvertimeCharge, BackendError> {
        let body = serde_json::json!({
            "overtime_minutes": minutes,
            "overtime_cost_cents": cost_cents,
        });
        let wire: CheckAndBillWire =
            self.post_json(&format!("/bookings/{}/overtime/check-and-bill", id), &body).await?;
        Ok(normalize_charge(wire))
    }

    async fn detect_car_parked(
        &self,
        id: BookingId,
    ) -> Result<DetectParkedOutcome, BackendError> {
        let wire: DetectParkedWire = self
            .post_json(&format!("/bookings/{}/detect-car-parked", id), &serde_json::json!({}))
            .await?;
        Ok(normalize_detect_outcome(wire))
    }

    async fn complete_booking(
        &self,
        id: BookingId,
        minutes: u64,
        cost_cents: u64,
        idempotency_key: &str,
    ) -> Result<(), BackendError> {
        let body = serde_json::json!({
            "overtime_minutes": minutes,
            "overtime_cost_cents": cost_cents,
        });
        let resp = self
            .client
            .post(self.url(&format!("/bookings/{}/complete", id)))
            .bearer_auth(&self.token)
            .header("Idempotency-Key", idempotency_key)
            .json(&body)
            .send()
            .await?;
        Self::check_status(resp.status())
    }
}

// ---------------------------------------------------------------------------
// Retry backoff
// ---------------------------------------------------------------------------

/// Exponential backoff with additive jitter for transient-failure retries.
///
/// Jitter is derived from the clock's sub-second noise; it only needs to
/// decorrelate retry storms, not be unpredictable.
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max, attempt: 0 }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay before the next retry: min(base * 2^n, max) plus up to 25% jitter
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.base.saturating_mul(1u32 << self.attempt.min(16));
        let capped = exp.min(self.max);
        self.attempt += 1;

        let jitter_cap_ms = (capped.as_millis() / 4).max(1) as u64;
        let noise = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos() as u64;
        capped + Duration::from_millis(noise % jitter_cap_ms)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

// ---------------------------------------------------------------------------
// Scripted backend for tests
// ---------------------------------------------------------------------------
