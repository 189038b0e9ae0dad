//! Parking session model - the per-booking state the engine reconciles

use crate::domain::types::{overtime_cost_cents, Booking, OvertimeStatus};
use chrono::{DateTime, Utc};
use smallvec::SmallVec;
use std::time::{SystemTime, UNIX_EPOCH};

/// Get current epoch milliseconds
#[inline]
pub fn epoch_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Phase of a monitored parking session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Discovered but not yet entered the grace window
    Idle,
    /// Waiting for the vehicle to arrive
    Grace,
    /// Vehicle present, booking clock running
    Active,
    /// Past nominal end plus buffer, still occupied
    Overtime,
    /// Departed (or ended on time); totals frozen
    Completed,
    /// No-show or explicit cancellation; never billed
    Cancelled,
}

impl SessionPhase {
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionPhase::Idle => "idle",
            SessionPhase::Grace => "grace",
            SessionPhase::Active => "active",
            SessionPhase::Overtime => "overtime",
            SessionPhase::Completed => "completed",
            SessionPhase::Cancelled => "cancelled",
        }
    }

    /// Terminal phases never transition again
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionPhase::Completed | SessionPhase::Cancelled)
    }
}

/// Event types recorded in a session's audit trail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEventType {
    Discovered,
    GraceStarted,
    OccupancyConfirmed,
    NoShow,
    OvertimeStarted,
    BillingTick,
    Completed,
    FinalizeFailed,
}

impl SessionEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionEventType::Discovered => "discovered",
            SessionEventType::GraceStarted => "grace_started",
            SessionEventType::OccupancyConfirmed => "occupancy_confirmed",
            SessionEventType::NoShow => "no_show",
            SessionEventType::OvertimeStarted => "overtime_started",
            SessionEventType::BillingTick => "billing_tick",
            SessionEventType::Completed => "completed",
            SessionEventType::FinalizeFailed => "finalize_failed",
        }
    }
}

/// A single event in a session's audit trail
#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub t: SessionEventType,
    pub ts: u64,
    pub extra: Option<String>,
}

impl SessionEvent {
    pub fn new(event_type: SessionEventType, ts: u64) -> Self {
        Self { t: event_type, ts, extra: None }
    }

    pub fn with_extra(mut self, extra: &str) -> Self {
        self.extra = Some(extra.to_string());
        self
    }

    fn to_json_value(&self) -> serde_json::Value {
        let mut obj = serde_json::Map::new();
        obj.insert("t".to_string(), serde_json::Value::String(self.t.as_str().to_string()));
        obj.insert("ts".to_string(), serde_json::Value::Number(self.ts.into()));
        if let Some(x) = &self.extra {
            obj.insert("x".to_string(), serde_json::Value::String(x.clone()));
        }
        serde_json::Value::Object(obj)
    }
}

/// Overtime totals for one booking.
///
/// Minutes are monotonic while the session is live and immutable once
/// `finalized` is set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OvertimeRecord {
    pub minutes: u64,
    pub cost_cents: u64,
    pub finalized: bool,
}

impl OvertimeRecord {
    /// Merge in a newly computed minute count.
    ///
    /// Returns true if the record grew. Lower values and updates after
    /// finalization are ignored, which is what makes billing ticks safe to
    /// repeat.
    pub fn update(&mut self, minutes: u64) -> bool {
        if self.finalized || minutes <= self.minutes {
            return false;
        }
        self.minutes = minutes;
        self.cost_cents = overtime_cost_cents(minutes);
        true
    }

    /// Freeze the record; no further updates are accepted
    pub fn freeze(&mut self) {
        self.finalized = true;
    }
}

/// Complete monitored state for one booking.
///
/// Created when the engine first sees an active booking, mutated only while
/// the phase is non-terminal, egressed and dropped once finished.
#[derive(Debug, Clone)]
pub struct ParkingSession {
    pub booking: Booking,
    pub phase: SessionPhase,
    /// When the grace window was armed
    pub grace_started_at: Option<DateTime<Utc>>,
    /// When occupancy was first confirmed. Set at most once, never before
    /// `grace_started_at`.
    pub timer_started_at: Option<DateTime<Utc>>,
    pub overtime: OvertimeRecord,
    pub started_at: u64,
    pub ended_at: Option<u64>,
    pub events: SmallVec<[SessionEvent; 8]>,
}

impl ParkingSession {
    pub fn new(booking: Booking) -> Self {
        let mut session = Self {
            booking,
            phase: SessionPhase::Idle,
            grace_started_at: None,
            timer_started_at: None,
            overtime: OvertimeRecord::default(),
            started_at: epoch_ms(),
            ended_at: None,
            events: SmallVec::new(),
        };
        session.add_event(SessionEvent::new(SessionEventType::Discovered, session.started_at));
        session
    }

    pub fn add_event(&mut self, event: SessionEvent) {
        self.events.push(event);
    }

    /// Enter the grace window
    pub fn begin_grace(&mut self, now: DateTime<Utc>) {
        self.phase = SessionPhase::Grace;
        self.grace_started_at = Some(now);
        self.add_event(SessionEvent::new(SessionEventType::GraceStarted, epoch_ms()));
    }

    /// Record confirmed occupancy and start the booking timer.
    ///
    /// Idempotent: the timer start is recorded at most once, and never earlier
    /// than the grace window start.
    pub fn confirm_occupancy(&mut self, now: DateTime<Utc>) {
        if self.timer_started_at.is_some() {
            return;
        }
        let started = match self.grace_started_at {
            Some(grace) if now < grace => grace,
            _ => now,
        };
        self.timer_started_at = Some(started);
        self.phase = SessionPhase::Active;
        self.add_event(SessionEvent::new(SessionEventType::OccupancyConfirmed, epoch_ms()));
    }

    /// Cancel the session (no-show); never billed
    pub fn cancel_no_show(&mut self) {
        self.phase = SessionPhase::Cancelled;
        self.ended_at = Some(epoch_ms());
        self.add_event(SessionEvent::new(SessionEventType::NoShow, epoch_ms()));
    }

    /// Complete the session and freeze the overtime record
    pub fn complete(&mut self) {
        self.phase = SessionPhase::Completed;
        self.overtime.freeze();
        self.ended_at = Some(epoch_ms());
        self.add_event(
            SessionEvent::new(SessionEventType::Completed, epoch_ms()).with_extra(&format!(
                "ot_min={},ot_cents={}",
                self.overtime.minutes, self.overtime.cost_cents
            )),
        );
    }

    pub fn is_finished(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Current answer for the host application's overtime query
    pub fn status(&self) -> OvertimeStatus {
        OvertimeStatus {
            overtime_minutes: self.overtime.minutes,
            overtime_cost_cents: self.overtime.cost_cents,
            is_active: self.phase == SessionPhase::Overtime,
        }
    }

    /// Convert to short-key JSON string for the session log
    pub fn to_json(&self) -> String {
        let mut obj = serde_json::Map::new();
        obj.insert("bid".to_string(), serde_json::Value::Number(self.booking.id.0.into()));
        obj.insert(
            "spot".to_string(),
            serde_json::Value::String(self.booking.spot.as_str().to_string()),
        );
        obj.insert(
            "phase".to_string(),
            serde_json::Value::String(self.phase.as_str().to_string()),
        );
        obj.insert(
            "end_time".to_string(),
            serde_json::Value::String(self.booking.end_time.to_rfc3339()),
        );
        obj.insert("ot_min".to_string(), serde_json::Value::Number(self.overtime.minutes.into()));
        obj.insert(
            "ot_cents".to_string(),
            serde_json::Value::Number(self.overtime.cost_cents.into()),
        );
        obj.insert("fin".to_string(), serde_json::Value::Bool(self.overtime.finalized));
        obj.insert("t0".to_string(), serde_json::Value::Number(self.started_at.into()));
        if let Some(ended) = self.ended_at {
            obj.insert("t1".to_string(), serde_json::Value::Number(ended.into()));
        }
        let events: Vec<serde_json::Value> =
            self.events.iter().map(|e| e.to_json_value()).collect();
        obj.insert("ev".to_string(), serde_json::Value::Array(events));

        serde_json::Value::Object(obj).to_string()
    }
}
