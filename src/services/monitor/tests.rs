//! Scenario tests for the reconciliation engine
//!
//! Each test drives `reconcile_pass` directly with a synthetic clock and a
//! scripted backend, so no fake timers or sleeps are needed for the decision
//! logic itself.

use super::*;
use crate::domain::session::SessionPhase;
use crate::domain::types::{
    Booking, BookingId, BookingStatus, LedColor, SensorReading, SpotId,
};
use crate::io::backend::mock::MockBackend;
use crate::io::backend::{AvailabilitySnapshot, DetectParkedOutcome};
use crate::io::notify::{create_notify_channel, NotificationEvent};
use crate::services::breaker::BreakerState;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone};
use std::sync::atomic::Ordering;
use tempfile::TempDir;

const ID: BookingId = BookingId(77);

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
}

fn end_time() -> DateTime<Utc> {
    t0() + ChronoDuration::minutes(10)
}

fn spot() -> SpotId {
    SpotId("A-7".to_string())
}

fn active_booking() -> Booking {
    Booking {
        id: ID,
        spot: spot(),
        start_time: t0(),
        end_time: end_time(),
        status: BookingStatus::Active,
        base_cost_cents: 500,
    }
}

fn snapshot(is_available: bool) -> AvailabilitySnapshot {
    let led = if is_available { LedColor::Blue } else { LedColor::Red };
    let reading =
        SensorReading { spot: spot(), is_available: Some(is_available), age_secs: Some(1), led };
    let mut readings = std::collections::HashMap::new();
    readings.insert(spot(), reading);
    AvailabilitySnapshot { offline: false, readings }
}

struct Harness {
    monitor: OvertimeMonitor,
    backend: Arc<MockBackend>,
    notify_rx: mpsc::Receiver<NotificationEvent>,
    _log_dir: TempDir,
    log_path: std::path::PathBuf,
}

fn harness() -> Harness {
    let backend = Arc::new(MockBackend::new());
    backend.set_bookings(vec![active_booking()]);
    backend.set_availability(snapshot(true));

    let metrics = Arc::new(Metrics::new());
    let (notify, notify_rx) = create_notify_channel(64, metrics.clone());

    let log_dir = tempfile::tempdir().unwrap();
    let log_path = log_dir.path().join("sessions.jsonl");
    let mut config = Config::default();
    config.set_session_log_file(log_path.to_str().unwrap());

    let monitor = OvertimeMonitor::new(config, backend.clone(), notify, metrics);
    Harness { monitor, backend, notify_rx, _log_dir: log_dir, log_path }
}

fn drain(rx: &mut mpsc::Receiver<NotificationEvent>) -> Vec<NotificationEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

fn keys(events: &[NotificationEvent]) -> Vec<&'static str> {
    events.iter().map(|e| e.event_key()).collect()
}

#[tokio::test]
async fn test_discovery_starts_grace() {
    let mut h = harness();

    h.monitor.reconcile_pass(t0()).await;

    let session = h.monitor.sessions.get(&ID).unwrap();
    assert_eq!(session.phase, SessionPhase::Grace);
    assert!(h.monitor.grace.is_armed(ID));

    let events = drain(&mut h.notify_rx);
    assert_eq!(keys(&events), vec!["booking_confirmed"]);

    let status = h.monitor.status.read().get(&ID).copied().unwrap();
    assert_eq!(status.overtime_minutes, 0);
    assert!(!status.is_active);
}

#[tokio::test]
async fn test_occupancy_at_second_nineteen_goes_active() {
    let mut h = harness();
    h.monitor.reconcile_pass(t0()).await;

    h.backend.set_availability(snapshot(false));
    h.monitor.reconcile_pass(t0() + ChronoDuration::seconds(19)).await;

    let session = h.monitor.sessions.get(&ID).unwrap();
    assert_eq!(session.phase, SessionPhase::Active);
    assert_eq!(session.timer_started_at, Some(t0() + ChronoDuration::seconds(19)));

    // Grace deadline passing later must not cancel a confirmed session
    h.monitor.reconcile_pass(t0() + ChronoDuration::seconds(25)).await;
    assert_eq!(h.monitor.sessions.get(&ID).unwrap().phase, SessionPhase::Active);
}

#[tokio::test]
async fn test_no_show_cancelled_and_never_billed() {
    let mut h = harness();
    h.monitor.reconcile_pass(t0()).await;
    drain(&mut h.notify_rx);

    // Spot stays vacant through the whole grace window
    h.monitor.reconcile_pass(t0() + ChronoDuration::seconds(20)).await;

    assert!(h.monitor.sessions.is_empty());
    assert!(h.monitor.status.read().get(&ID).is_none());
    assert_eq!(h.backend.bill_calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.backend.complete_calls.load(Ordering::SeqCst), 0);

    let content = std::fs::read_to_string(&h.log_path).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(content.trim()).unwrap();
    assert_eq!(parsed["phase"], "cancelled");
    assert_eq!(parsed["ot_min"], 0);
}

#[tokio::test]
async fn test_full_overtime_lifecycle() {
    let mut h = harness();

    // Discover, then confirm occupancy
    h.monitor.reconcile_pass(t0()).await;
    h.backend.set_availability(snapshot(false));
    h.monitor.reconcile_pass(t0() + ChronoDuration::seconds(8)).await;
    assert_eq!(h.monitor.sessions.get(&ID).unwrap().phase, SessionPhase::Active);
    drain(&mut h.notify_rx);

    // Still occupied 65s past the end: one overtime minute
    h.monitor.reconcile_pass(end_time() + ChronoDuration::seconds(65)).await;

    let session = h.monitor.sessions.get(&ID).unwrap();
    assert_eq!(session.phase, SessionPhase::Overtime);
    assert_eq!(session.overtime.minutes, 1);
    assert_eq!(h.backend.billed_minutes(ID), Some(1));

    let events = drain(&mut h.notify_rx);
    assert_eq!(keys(&events), vec!["overtime_started", "overtime_updated"]);

    let status = h.monitor.status.read().get(&ID).copied().unwrap();
    assert!(status.is_active);
    assert_eq!(status.overtime_minutes, 1);
    assert_eq!(status.overtime_cost_cents, 50);

    // Departure at +95s freezes at floor((95-5)/60) = 1 minute
    h.backend.set_availability(snapshot(true));
    h.monitor.reconcile_pass(end_time() + ChronoDuration::seconds(95)).await;

    assert!(h.monitor.sessions.is_empty());
    assert_eq!(h.backend.completed.lock().as_slice(), &[ID]);
    let events = drain(&mut h.notify_rx);
    assert_eq!(keys(&events), vec!["session_completed"]);
    assert!(h.monitor.status.read().get(&ID).is_none());

    // Sensor flicker after departure: booking still listed active by a
    // lagging backend, spot reads occupied again. Nothing may resume.
    h.backend.set_availability(snapshot(false));
    h.monitor.reconcile_pass(end_time() + ChronoDuration::seconds(120)).await;

    assert!(h.monitor.sessions.is_empty());
    assert_eq!(h.backend.billed_minutes(ID), Some(1));
    assert_eq!(h.backend.complete_calls.load(Ordering::SeqCst), 1);
    assert!(drain(&mut h.notify_rx).is_empty());
}

#[tokio::test]
async fn test_vacant_within_buffer_completes_without_overtime() {
    let mut h = harness();
    h.monitor.reconcile_pass(t0()).await;
    h.backend.set_availability(snapshot(false));
    h.monitor.reconcile_pass(t0() + ChronoDuration::seconds(8)).await;
    drain(&mut h.notify_rx);

    // Vacated 2s past the end, inside the 5s buffer
    h.backend.set_availability(snapshot(true));
    h.monitor.reconcile_pass(end_time() + ChronoDuration::seconds(2)).await;

    assert!(h.monitor.sessions.is_empty());
    assert_eq!(h.backend.completed.lock().as_slice(), &[ID]);
    assert_eq!(h.backend.billed_minutes(ID), None);

    let events = drain(&mut h.notify_rx);
    assert_eq!(keys(&events), vec!["session_completed"]);
    match &events[0] {
        NotificationEvent::SessionCompleted { overtime_minutes, overtime_cost_cents, .. } => {
            assert_eq!(*overtime_minutes, 0);
            assert_eq!(*overtime_cost_cents, 0);
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn test_overtime_accrues_fail_closed_without_sensor_data() {
    let mut h = harness();
    h.monitor.reconcile_pass(t0()).await;
    h.backend.set_availability(snapshot(false));
    h.monitor.reconcile_pass(t0() + ChronoDuration::seconds(8)).await;
    drain(&mut h.notify_rx);

    // Sensor fetch fails: occupancy is Unknown, which must keep billing
    h.backend.fail_availability.store(1, Ordering::SeqCst);
    h.monitor.reconcile_pass(end_time() + ChronoDuration::seconds(65)).await;

    let session = h.monitor.sessions.get(&ID).unwrap();
    assert_eq!(session.phase, SessionPhase::Overtime);
    assert_eq!(session.overtime.minutes, 1);
    assert_eq!(h.backend.billed_minutes(ID), Some(1));
}

#[tokio::test(start_paused = true)]
async fn test_breaker_opens_and_cache_serves_stale() {
    let mut h = harness();
    h.monitor.reconcile_pass(t0()).await;
    assert_eq!(h.monitor.active_count(), 1);

    h.backend.fail_availability.store(100, Ordering::SeqCst);
    h.backend.fail_bookings.store(100, Ordering::SeqCst);

    // First failing pass: 1 availability + 3 bookings attempts = 4 failures
    h.monitor.reconcile_pass(t0() + ChronoDuration::seconds(8)).await;
    assert_eq!(h.monitor.breaker.state(), BreakerState::Closed);
    assert_eq!(h.monitor.active_count(), 1);

    // Second failing pass: the 5th failure opens the breaker; the bookings
    // fetch is skipped and the cached list is served stale
    h.monitor.reconcile_pass(t0() + ChronoDuration::seconds(16)).await;
    assert_eq!(h.monitor.breaker.state(), BreakerState::Open);
    assert_eq!(h.monitor.active_count(), 1);

    let summary = h.monitor.metrics.report(1, 0);
    assert!(summary.breaker_opens >= 1);
    assert!(summary.stale_serves >= 1);
}

#[tokio::test]
async fn test_unauthorized_forces_logout_without_retry() {
    let mut h = harness();
    h.monitor.reconcile_pass(t0()).await;
    drain(&mut h.notify_rx);

    h.backend.unauthorized.store(true, Ordering::SeqCst);
    h.monitor.reconcile_pass(t0() + ChronoDuration::seconds(8)).await;

    assert!(h.monitor.logged_out);
    let events = drain(&mut h.notify_rx);
    assert_eq!(keys(&events), vec!["session_invalidated"]);

    // Further passes are inert
    h.monitor.reconcile_pass(t0() + ChronoDuration::seconds(16)).await;
    assert_eq!(h.backend.bill_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_detect_car_parked_confirms_occupancy() {
    let mut h = harness();
    h.monitor.reconcile_pass(t0()).await;
    drain(&mut h.notify_rx);

    h.monitor
        .handle_command(
            MonitorCommand::DetectCarParked(ID),
            t0() + ChronoDuration::seconds(5),
        )
        .await;

    let session = h.monitor.sessions.get(&ID).unwrap();
    assert_eq!(session.phase, SessionPhase::Active);
    assert_eq!(session.timer_started_at, Some(t0() + ChronoDuration::seconds(5)));
    assert!(!h.monitor.grace.is_armed(ID));

    // A later sensor confirmation is a no-op (idempotent confirmation)
    h.backend.set_availability(snapshot(false));
    h.monitor.reconcile_pass(t0() + ChronoDuration::seconds(10)).await;
    assert_eq!(
        h.monitor.sessions.get(&ID).unwrap().timer_started_at,
        Some(t0() + ChronoDuration::seconds(5))
    );
}

#[tokio::test]
async fn test_detect_car_parked_respects_server_expiry() {
    let mut h = harness();
    h.monitor.reconcile_pass(t0()).await;
    drain(&mut h.notify_rx);

    *h.backend.detect_outcome.lock() = Some(DetectParkedOutcome::GraceExpired);
    h.monitor
        .handle_command(
            MonitorCommand::DetectCarParked(ID),
            t0() + ChronoDuration::seconds(21),
        )
        .await;

    // Server says the window already expired: session cancelled, never billed
    assert!(h.monitor.sessions.is_empty());
    assert_eq!(h.backend.bill_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_finalize_exhaustion_still_freezes_locally() {
    let mut h = harness();
    h.monitor.reconcile_pass(t0()).await;
    h.backend.set_availability(snapshot(false));
    h.monitor.reconcile_pass(t0() + ChronoDuration::seconds(8)).await;
    drain(&mut h.notify_rx);

    h.backend.fail_complete.store(10, Ordering::SeqCst);
    h.backend.set_availability(snapshot(true));
    h.monitor.reconcile_pass(end_time() + ChronoDuration::seconds(2)).await;

    // Remote write never landed, but the session is finished locally
    assert!(h.monitor.sessions.is_empty());
    assert!(h.backend.completed.lock().is_empty());
    assert_eq!(h.backend.complete_calls.load(Ordering::SeqCst), 3);

    let summary = h.monitor.metrics.report(0, 0);
    assert_eq!(summary.finalize_failures, 1);

    // The user still just sees a completed session
    let events = drain(&mut h.notify_rx);
    assert_eq!(keys(&events), vec!["session_completed"]);

    // The failure is recorded in the egressed audit trail
    let content = std::fs::read_to_string(&h.log_path).unwrap();
    assert!(content.contains("finalize_failed"));
}

#[tokio::test]
async fn test_countdown_emits_at_five_second_marks() {
    let mut h = harness();
    h.monitor.reconcile_pass(t0()).await;
    drain(&mut h.notify_rx);

    h.monitor.countdown_tick(t0());
    h.monitor.countdown_tick(t0() + ChronoDuration::seconds(1));
    h.monitor.countdown_tick(t0() + ChronoDuration::seconds(5));
    h.monitor.countdown_tick(t0() + ChronoDuration::seconds(5));
    h.monitor.countdown_tick(t0() + ChronoDuration::seconds(10));
    h.monitor.countdown_tick(t0() + ChronoDuration::seconds(15));

    let events = drain(&mut h.notify_rx);
    let remaining: Vec<i64> = events
        .iter()
        .map(|e| match e {
            NotificationEvent::GraceCountdown { remaining_secs, .. } => *remaining_secs,
            other => panic!("unexpected event: {other:?}"),
        })
        .collect();
    assert_eq!(remaining, vec![20, 15, 10, 5]);
}

#[tokio::test]
async fn test_booking_withdrawn_by_backend() {
    let mut h = harness();
    h.monitor.reconcile_pass(t0()).await;
    drain(&mut h.notify_rx);

    // The reservation disappears from the active list while still in grace
    h.backend.set_bookings(vec![]);
    h.monitor.reconcile_pass(t0() + ChronoDuration::seconds(8)).await;

    assert!(h.monitor.sessions.is_empty());
    assert_eq!(h.backend.bill_calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.backend.complete_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_in_flight_guard_skips_double_reconciliation() {
    let mut h = harness();
    h.monitor.reconcile_pass(t0()).await;

    // Simulate a pass that never released the booking
    h.monitor.in_flight.insert(ID);
    h.backend.set_availability(snapshot(false));
    h.monitor
        .reconcile_booking(ID, t0() + ChronoDuration::seconds(10), None)
        .await;

    // Untouched: still in grace, no occupancy confirmation happened
    assert_eq!(h.monitor.sessions.get(&ID).unwrap().phase, SessionPhase::Grace);
}
