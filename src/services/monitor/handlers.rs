//! Reconciliation pass logic for the monitor
//!
//! Each pass pulls fresh sensor and booking snapshots, folds every session
//! through the pure state machine, and executes the returned transitions
//! (billing calls, notifications, egress). I/O never happens inside the
//! decision logic.

use super::{MonitorCommand, OvertimeMonitor};
use crate::domain::session::{
    epoch_ms, ParkingSession, SessionEvent, SessionEventType, SessionPhase,
};
use crate::domain::types::{Booking, BookingId, BookingStatus, Occupancy};
use crate::io::backend::{
    AvailabilitySnapshot, Backoff, BackendError, DetectParkedOutcome,
};
use crate::io::notify::NotificationEvent;
use crate::services::overtime::{self, Transition};
use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Attempts per pass at the bookings list before falling back to cache
const FETCH_RETRY_ATTEMPTS: u32 = 3;

const FETCH_BACKOFF_BASE: Duration = Duration::from_millis(250);
const FETCH_BACKOFF_MAX: Duration = Duration::from_secs(2);

impl OvertimeMonitor {
    /// One full reconciliation pass.
    ///
    /// The sensor snapshot and the bookings list come from two independent
    /// calls and may describe slightly different instants; they are treated
    /// as eventually consistent, never atomic.
    pub(crate) async fn reconcile_pass(&mut self, now: DateTime<Utc>) {
        if self.logged_out {
            return;
        }
        self.metrics.record_poll();

        let availability = self.fetch_availability_guarded().await;
        if self.logged_out {
            return;
        }

        let Some(bookings) = self.fetch_bookings_guarded().await else {
            if !self.logged_out {
                debug!("reconcile_pass_skipped_no_bookings");
            }
            return;
        };

        self.sync_sessions(&bookings, now);
        self.sweep_no_shows(now);

        let ids: Vec<BookingId> = self.sessions.keys().copied().collect();
        for id in ids {
            self.reconcile_booking(id, now, availability.as_ref()).await;
            if self.logged_out {
                return;
            }
        }

        self.refresh_status();
        self.flush_finished();
    }

    /// Create sessions for newly seen active bookings and finish sessions
    /// whose booking the backend no longer lists as active.
    fn sync_sessions(&mut self, bookings: &[Booking], _now: DateTime<Utc>) {
        for booking in bookings {
            if booking.status != BookingStatus::Active {
                continue;
            }
            if self.finished_ids.contains(&booking.id) {
                continue;
            }
            if !self.sessions.contains_key(&booking.id) {
                info!(
                    booking_id = %booking.id,
                    spot = %booking.spot,
                    end_time = %booking.end_time,
                    "booking_discovered"
                );
                self.sessions.insert(booking.id, ParkingSession::new(booking.clone()));
                self.metrics.record_session_started();
            }
        }

        let withdrawn: Vec<BookingId> = self
            .sessions
            .iter()
            .filter(|(id, session)| {
                !session.is_finished()
                    && !bookings
                        .iter()
                        .any(|b| b.id == **id && b.status == BookingStatus::Active)
            })
            .map(|(id, _)| *id)
            .collect();

        for id in withdrawn {
            let Some(session) = self.sessions.get_mut(&id) else { continue };
            info!(
                booking_id = %id,
                phase = %session.phase.as_str(),
                "booking_withdrawn_by_backend"
            );
            match session.phase {
                // Never parked: the reservation is gone, nothing to charge
                SessionPhase::Idle | SessionPhase::Grace => {
                    session.cancel_no_show();
                    self.grace.cancel(id);
                    self.metrics.record_session_cancelled();
                }
                // The backend settled it out from under us; freeze local totals
                SessionPhase::Active | SessionPhase::Overtime => {
                    session.complete();
                    self.metrics.record_session_completed();
                }
                SessionPhase::Completed | SessionPhase::Cancelled => {}
            }
        }
    }

    /// Cancel grace-phase sessions whose window expired without occupancy
    fn sweep_no_shows(&mut self, now: DateTime<Utc>) {
        for id in self.grace.expire(now) {
            let Some(session) = self.sessions.get_mut(&id) else { continue };
            if session.phase == SessionPhase::Grace {
                overtime::mark_no_show(session);
                self.metrics.record_session_cancelled();
            }
        }
    }

    /// Reconcile a single booking against the sensor snapshot.
    ///
    /// The in-flight guard keeps an overlapping pass (fast poll firing while
    /// a fallback pass still holds the booking) from running the state
    /// machine twice for the same booking.
    pub(crate) async fn reconcile_booking(
        &mut self,
        id: BookingId,
        now: DateTime<Utc>,
        availability: Option<&AvailabilitySnapshot>,
    ) {
        if !self.in_flight.insert(id) {
            debug!(booking_id = %id, "reconcile_skipped_in_flight");
            return;
        }

        let Some(spot) = self.sessions.get(&id).map(|s| s.booking.spot.clone()) else {
            self.in_flight.remove(&id);
            return;
        };

        let reading = availability.and_then(|a| a.readings.get(&spot));
        let (occupancy, spot_transition) = self.sensors.normalize(&spot, reading);
        if let Some(t) = spot_transition {
            debug!(
                booking_id = %id,
                spot = %spot,
                transition = %t.as_str(),
                "spot_led_transition"
            );
        }

        let (prev_minutes, transitions) = {
            let Some(session) = self.sessions.get_mut(&id) else {
                self.in_flight.remove(&id);
                return;
            };
            let prev = session.overtime.minutes;
            (prev, overtime::advance(session, now, occupancy))
        };

        for transition in transitions {
            self.apply_transition(id, transition, prev_minutes, now).await;
            if self.logged_out {
                break;
            }
        }

        self.in_flight.remove(&id);
    }

    /// Execute one state-machine transition's side effects
    async fn apply_transition(
        &mut self,
        id: BookingId,
        transition: Transition,
        prev_minutes: u64,
        now: DateTime<Utc>,
    ) {
        match transition {
            Transition::GraceStarted => {
                self.grace.start(id, now);
                self.notify.send(NotificationEvent::BookingConfirmed { booking_id: id });
            }
            Transition::OccupancyConfirmed => {
                // Any confirmed occupancy cancels the grace window, once
                self.grace.cancel(id);
                self.countdown_sent.remove(&id);
            }
            Transition::NoShowCancelled => {
                self.metrics.record_session_cancelled();
            }
            Transition::OvertimeStarted => {
                self.metrics.record_overtime_session();
                self.notify.send(NotificationEvent::OvertimeStarted { booking_id: id });
            }
            Transition::BillingTick { minutes, cost_cents } => {
                let result = self
                    .billing
                    .record_overtime_tick(&mut self.breaker, id, minutes, cost_cents)
                    .await;
                match result {
                    Ok(Some(charge)) => {
                        // The backend ledger is authoritative; adopt its view
                        // when it is ahead of ours
                        if let Some(session) = self.sessions.get_mut(&id) {
                            session.overtime.update(charge.minutes);
                        }
                    }
                    Ok(None) => {}
                    Err(BackendError::Unauthorized) => {
                        self.force_logout();
                        return;
                    }
                    Err(e) => {
                        warn!(booking_id = %id, error = %e, "billing_tick_error");
                    }
                }
                if minutes > prev_minutes {
                    self.notify.send(NotificationEvent::OvertimeUpdated {
                        booking_id: id,
                        minutes,
                        cost_cents,
                    });
                }
            }
            Transition::CompletedOnTime => {
                self.finish_session(id, 0, 0).await;
            }
            Transition::CompletedWithOvertime { minutes, cost_cents } => {
                self.finish_session(id, minutes, cost_cents).await;
            }
        }
    }

    /// Finalize a completed session on the backend and notify the user.
    ///
    /// A failed remote finalize is logged loudly but never surfaced to the
    /// user; the local record is already frozen, so the worst case is an
    /// undercharge, never a double charge.
    async fn finish_session(&mut self, id: BookingId, minutes: u64, cost_cents: u64) {
        let result = self.billing.finalize(&mut self.breaker, id, minutes, cost_cents).await;
        match result {
            Ok(true) => {}
            Ok(false) => {
                if let Some(session) = self.sessions.get_mut(&id) {
                    session.add_event(SessionEvent::new(
                        SessionEventType::FinalizeFailed,
                        epoch_ms(),
                    ));
                }
            }
            Err(BackendError::Unauthorized) => {
                self.force_logout();
            }
            Err(e) => {
                error!(booking_id = %id, error = %e, "finalize_error");
            }
        }

        self.metrics.record_session_completed();
        self.notify.send(NotificationEvent::SessionCompleted {
            booking_id: id,
            overtime_minutes: minutes,
            overtime_cost_cents: cost_cents,
        });
    }

    /// Presentational countdown tick: emit grace "time remaining" events at
    /// 5-second marks. Never touches billing state.
    pub(crate) fn countdown_tick(&mut self, now: DateTime<Utc>) {
        for (&id, session) in self.sessions.iter() {
            if session.phase != SessionPhase::Grace {
                continue;
            }
            let Some(remaining) = self.grace.remaining_secs(id, now) else { continue };
            if remaining % 5 != 0 {
                continue;
            }
            if self.countdown_sent.get(&id) == Some(&remaining) {
                continue;
            }
            self.countdown_sent.insert(id, remaining);
            self.notify.send(NotificationEvent::GraceCountdown {
                booking_id: id,
                remaining_secs: remaining,
            });
        }
    }

    pub(crate) async fn handle_command(&mut self, cmd: MonitorCommand, now: DateTime<Utc>) {
        match cmd {
            MonitorCommand::DetectCarParked(id) => {
                self.handle_detect_parked(id, now).await;
                self.refresh_status();
                self.flush_finished();
            }
        }
    }

    /// Client-side occupancy confirmation: equivalent to a sensor `occupied`
    /// reading, whichever arrives first.
    async fn handle_detect_parked(&mut self, id: BookingId, now: DateTime<Utc>) {
        let Some(session) = self.sessions.get(&id) else {
            warn!(booking_id = %id, "detect_parked_unknown_booking");
            return;
        };
        if session.phase != SessionPhase::Grace {
            debug!(
                booking_id = %id,
                phase = %session.phase.as_str(),
                "detect_parked_ignored"
            );
            return;
        }

        // Tell the backend; it may have already expired the grace window
        let outcome = if self.breaker.can_attempt(Instant::now()) {
            let result = self.backend.detect_car_parked(id).await;
            match result {
                Ok(outcome) => {
                    self.breaker.record_success();
                    Some(outcome)
                }
                Err(BackendError::Unauthorized) => {
                    self.force_logout();
                    return;
                }
                Err(e) => {
                    self.note_remote_failure();
                    warn!(booking_id = %id, error = %e, "detect_parked_call_failed");
                    None
                }
            }
        } else {
            self.metrics.record_breaker_skip();
            None
        };

        match outcome {
            Some(DetectParkedOutcome::GraceExpired) => {
                info!(booking_id = %id, "detect_parked_grace_already_expired");
                self.grace.cancel(id);
                if let Some(session) = self.sessions.get_mut(&id) {
                    overtime::mark_no_show(session);
                }
                self.metrics.record_session_cancelled();
            }
            // A network failure still confirms locally; the backend catches
            // up on the next sync (at-least-once, idempotent)
            Some(DetectParkedOutcome::TimerStarted) | None => {
                let (prev_minutes, transitions) = {
                    let Some(session) = self.sessions.get_mut(&id) else { return };
                    let prev = session.overtime.minutes;
                    (prev, overtime::advance(session, now, Occupancy::Occupied))
                };
                for transition in transitions {
                    self.apply_transition(id, transition, prev_minutes, now).await;
                    if self.logged_out {
                        return;
                    }
                }
            }
        }
    }

    /// Fetch the sensor snapshot, tracking the network-wide offline flag.
    /// Returns None on any failure; callers then reconcile with `Unknown`
    /// occupancy (fail-closed).
    async fn fetch_availability_guarded(&mut self) -> Option<AvailabilitySnapshot> {
        if !self.breaker.can_attempt(Instant::now()) {
            self.metrics.record_breaker_skip();
            debug!("availability_skipped_breaker_open");
            return None;
        }

        let result = self.backend.fetch_availability().await;
        match result {
            Ok(snapshot) => {
                self.breaker.record_success();
                if snapshot.offline != self.offline {
                    info!(offline = %snapshot.offline, "sensor_network_offline_changed");
                }
                self.offline = snapshot.offline;
                if snapshot.offline {
                    None
                } else {
                    Some(snapshot)
                }
            }
            Err(BackendError::Unauthorized) => {
                self.force_logout();
                None
            }
            Err(e) => {
                self.note_remote_failure();
                self.metrics.record_poll_failure();
                warn!(error = %e, "availability_fetch_failed");
                None
            }
        }
    }

    /// Fetch the bookings list with bounded retry, falling back to the cache
    /// (stale allowed while the breaker is open). None means no usable list
    /// exists and the pass should be skipped.
    async fn fetch_bookings_guarded(&mut self) -> Option<Vec<Booking>> {
        let mut backoff = Backoff::new(FETCH_BACKOFF_BASE, FETCH_BACKOFF_MAX);
        let mut attempts = 0;

        while attempts < FETCH_RETRY_ATTEMPTS && self.breaker.can_attempt(Instant::now()) {
            attempts += 1;
            let result = self.backend.fetch_bookings().await;
            match result {
                Ok(bookings) => {
                    self.breaker.record_success();
                    self.cache.set(bookings.clone(), Instant::now());
                    return Some(bookings);
                }
                Err(BackendError::Unauthorized) => {
                    self.force_logout();
                    return None;
                }
                Err(e) => {
                    self.note_remote_failure();
                    self.metrics.record_poll_failure();
                    if e.is_transient() && attempts < FETCH_RETRY_ATTEMPTS {
                        let delay = backoff.next_delay();
                        debug!(
                            error = %e,
                            attempt = %attempts,
                            delay_ms = %delay.as_millis(),
                            "bookings_fetch_retry"
                        );
                        sleep(delay).await;
                    } else {
                        warn!(error = %e, attempts = %attempts, "bookings_fetch_failed");
                        break;
                    }
                }
            }
        }

        if attempts == 0 {
            self.metrics.record_breaker_skip();
            debug!("bookings_fetch_skipped_breaker_open");
        }

        let serve_stale = self.breaker.is_open();
        let cached = self.cache.get(Instant::now(), serve_stale).map(|b| b.to_vec());
        if cached.is_some() && serve_stale {
            self.metrics.record_stale_serve();
        }
        cached
    }

    /// Record a remote failure on the breaker, counting open transitions
    fn note_remote_failure(&mut self) {
        let was_open = self.breaker.is_open();
        self.breaker.record_failure(Instant::now());
        if !was_open && self.breaker.is_open() {
            self.metrics.record_breaker_open();
        }
    }

    /// Publish the current per-booking status snapshot
    pub(crate) fn refresh_status(&self) {
        let snapshot = self
            .sessions
            .iter()
            .map(|(id, session)| (*id, session.status()))
            .collect();
        *self.status.write() = snapshot;
    }

    /// Egress finished sessions and drop their tracking state
    pub(crate) fn flush_finished(&mut self) {
        let finished: Vec<BookingId> = self
            .sessions
            .iter()
            .filter(|(_, session)| session.is_finished())
            .map(|(id, _)| *id)
            .collect();

        for id in finished {
            if let Some(session) = self.sessions.remove(&id) {
                self.finished_ids.insert(id);
                self.session_log.write_session(&session);
                self.grace.remove(id);
                self.sensors.forget_spot(&session.booking.spot);
                self.countdown_sent.remove(&id);
                self.status.write().remove(&id);
            }
        }
    }

    /// 401/403: surface a forced logout and stop all remote work
    fn force_logout(&mut self) {
        if self.logged_out {
            return;
        }
        self.logged_out = true;
        error!("backend_unauthorized_forcing_logout");
        self.notify.send(NotificationEvent::SessionInvalidated);
    }
}
