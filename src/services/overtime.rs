//! Overtime state machine
//!
//! Pure decision logic: one `advance` call folds a booking's session through
//! a single reconciliation tick, given the wall clock and the normalized
//! occupancy signal. All I/O effects are returned as [`Transition`] values
//! for the monitor to execute, which keeps every path testable without fake
//! timers or a network.
//!
//! Phases: idle -> grace -> active -> overtime -> completed, with cancelled
//! absorbing from idle/grace on no-show.

use crate::domain::session::{epoch_ms, ParkingSession, SessionEvent, SessionEventType, SessionPhase};
use crate::domain::types::Occupancy;
use chrono::{DateTime, Utc};
use smallvec::SmallVec;
use tracing::{debug, info};

/// Slack after the nominal end time before overtime may begin
pub const OVERTIME_BUFFER_SECS: i64 = 5;

/// Effects produced by advancing a session one tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// idle -> grace
    GraceStarted,
    /// grace -> active (occupancy confirmed)
    OccupancyConfirmed,
    /// grace -> cancelled (window elapsed without occupancy)
    NoShowCancelled,
    /// active -> overtime
    OvertimeStarted,
    /// Overtime accrual tick; values are the session's current totals
    BillingTick { minutes: u64, cost_cents: u64 },
    /// active -> completed before the buffer elapsed; no overtime
    CompletedOnTime,
    /// overtime -> completed; totals are frozen at these values
    CompletedWithOvertime { minutes: u64, cost_cents: u64 },
}

/// Whole overtime minutes elapsed at `now` for a booking ending at
/// `end_time`: floor((seconds past end - buffer) / 60), never negative.
#[inline]
pub fn overtime_minutes(now: DateTime<Utc>, end_time: DateTime<Utc>) -> u64 {
    let billable_secs = (now - end_time).num_seconds() - OVERTIME_BUFFER_SECS;
    if billable_secs < 0 {
        0
    } else {
        (billable_secs / 60) as u64
    }
}

/// Advance one session through one reconciliation tick.
///
/// `Unknown` occupancy is fail-closed: it keeps an overtime session accruing
/// and never completes anything. Only an explicit `Vacant` reading ends a
/// session, and once it does the totals are frozen for good - a later
/// flickered `Occupied` cannot resume billing.
pub fn advance(
    session: &mut ParkingSession,
    now: DateTime<Utc>,
    occupancy: Occupancy,
) -> SmallVec<[Transition; 2]> {
    let mut out = SmallVec::new();

    match session.phase {
        SessionPhase::Idle => {
            session.begin_grace(now);
            out.push(Transition::GraceStarted);
        }
        SessionPhase::Grace => {
            if occupancy == Occupancy::Occupied {
                session.confirm_occupancy(now);
                info!(booking_id = %session.booking.id, "occupancy_confirmed");
                out.push(Transition::OccupancyConfirmed);
            }
        }
        SessionPhase::Active => {
            let end_time = session.booking.end_time;
            if now <= end_time {
                return out;
            }
            match occupancy {
                Occupancy::Vacant => {
                    session.complete();
                    info!(booking_id = %session.booking.id, "session_completed_on_time");
                    out.push(Transition::CompletedOnTime);
                }
                Occupancy::Occupied | Occupancy::Unknown => {
                    let buffer_elapsed =
                        (now - end_time).num_seconds() >= OVERTIME_BUFFER_SECS;
                    if buffer_elapsed {
                        session.phase = SessionPhase::Overtime;
                        session.add_event(SessionEvent::new(
                            SessionEventType::OvertimeStarted,
                            epoch_ms(),
                        ));
                        info!(
                            booking_id = %session.booking.id,
                            occupancy = %occupancy.as_str(),
                            "overtime_started"
                        );
                        out.push(Transition::OvertimeStarted);
                        out.push(accrue(session, now));
                    }
                }
            }
        }
        SessionPhase::Overtime => match occupancy {
            Occupancy::Vacant => {
                // Departure wins over continued accrual: settle the minute
                // count as of this observation, then freeze.
                let minutes = overtime_minutes(now, session.booking.end_time);
                session.overtime.update(minutes);
                session.complete();
                info!(
                    booking_id = %session.booking.id,
                    overtime_minutes = %session.overtime.minutes,
                    overtime_cost_cents = %session.overtime.cost_cents,
                    "session_completed_with_overtime"
                );
                out.push(Transition::CompletedWithOvertime {
                    minutes: session.overtime.minutes,
                    cost_cents: session.overtime.cost_cents,
                });
            }
            Occupancy::Occupied | Occupancy::Unknown => {
                out.push(accrue(session, now));
            }
        },
        SessionPhase::Completed | SessionPhase::Cancelled => {
            debug!(
                booking_id = %session.booking.id,
                phase = %session.phase.as_str(),
                "tick_ignored_terminal"
            );
        }
    }

    out
}

/// Recompute overtime totals and emit a billing tick
fn accrue(session: &mut ParkingSession, now: DateTime<Utc>) -> Transition {
    let minutes = overtime_minutes(now, session.booking.end_time);
    if session.overtime.update(minutes) {
        session.add_event(
            SessionEvent::new(SessionEventType::BillingTick, epoch_ms()).with_extra(&format!(
                "min={},cents={}",
                session.overtime.minutes, session.overtime.cost_cents
            )),
        );
    }
    Transition::BillingTick {
        minutes: session.overtime.minutes,
        cost_cents: session.overtime.cost_cents,
    }
}

/// Cancel a grace-phase session whose window elapsed without occupancy
pub fn mark_no_show(session: &mut ParkingSession) -> Transition {
    session.cancel_no_show();
    info!(booking_id = %session.booking.id, "session_cancelled_no_show");
    Transition::NoShowCancelled
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{Booking, BookingId, BookingStatus, SpotId};
    use chrono::{Duration, TimeZone};

    fn end_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 13, 0, 0).unwrap()
    }

    fn session() -> ParkingSession {
        let booking = Booking {
            id: BookingId(7),
            spot: SpotId("C-4".to_string()),
            start_time: end_time() - Duration::hours(1),
            end_time: end_time(),
            status: BookingStatus::Active,
            base_cost_cents: 400,
        };
        ParkingSession::new(booking)
    }

    /// Drive a fresh session to the active phase
    fn active_session() -> ParkingSession {
        let mut s = session();
        let arrival = end_time() - Duration::minutes(55);
        advance(&mut s, arrival, Occupancy::Unknown);
        advance(&mut s, arrival + Duration::seconds(10), Occupancy::Occupied);
        assert_eq!(s.phase, SessionPhase::Active);
        s
    }

    #[test]
    fn test_idle_enters_grace() {
        let mut s = session();
        let now = end_time() - Duration::minutes(55);

        let transitions = advance(&mut s, now, Occupancy::Unknown);

        assert_eq!(transitions.as_slice(), &[Transition::GraceStarted]);
        assert_eq!(s.phase, SessionPhase::Grace);
        assert_eq!(s.grace_started_at, Some(now));
    }

    #[test]
    fn test_grace_confirms_on_occupied() {
        let mut s = session();
        let t = end_time() - Duration::minutes(55);
        advance(&mut s, t, Occupancy::Unknown);

        let transitions = advance(&mut s, t + Duration::seconds(19), Occupancy::Occupied);

        assert_eq!(transitions.as_slice(), &[Transition::OccupancyConfirmed]);
        assert_eq!(s.phase, SessionPhase::Active);
        assert_eq!(s.timer_started_at, Some(t + Duration::seconds(19)));
    }

    #[test]
    fn test_grace_ignores_vacant_and_unknown() {
        let mut s = session();
        let t = end_time() - Duration::minutes(55);
        advance(&mut s, t, Occupancy::Unknown);

        assert!(advance(&mut s, t + Duration::seconds(5), Occupancy::Vacant).is_empty());
        assert!(advance(&mut s, t + Duration::seconds(8), Occupancy::Unknown).is_empty());
        assert_eq!(s.phase, SessionPhase::Grace);
    }

    #[test]
    fn test_no_show_cancels_without_charges() {
        let mut s = session();
        let t = end_time() - Duration::minutes(55);
        advance(&mut s, t, Occupancy::Unknown);

        let transition = mark_no_show(&mut s);

        assert_eq!(transition, Transition::NoShowCancelled);
        assert_eq!(s.phase, SessionPhase::Cancelled);
        assert_eq!(s.overtime.minutes, 0);
        assert_eq!(s.overtime.cost_cents, 0);

        // No further ticks touch a cancelled session
        assert!(advance(&mut s, end_time() + Duration::seconds(120), Occupancy::Occupied)
            .is_empty());
        assert_eq!(s.overtime.minutes, 0);
    }

    #[test]
    fn test_active_before_end_is_quiet() {
        let mut s = active_session();
        assert!(advance(&mut s, end_time() - Duration::seconds(1), Occupancy::Occupied)
            .is_empty());
        assert!(advance(&mut s, end_time(), Occupancy::Occupied).is_empty());
        assert_eq!(s.phase, SessionPhase::Active);
    }

    #[test]
    fn test_vacant_within_buffer_completes_without_overtime() {
        let mut s = active_session();

        let transitions = advance(&mut s, end_time() + Duration::seconds(2), Occupancy::Vacant);

        assert_eq!(transitions.as_slice(), &[Transition::CompletedOnTime]);
        assert_eq!(s.phase, SessionPhase::Completed);
        assert_eq!(s.overtime.minutes, 0);
        assert!(s.overtime.finalized);
    }

    #[test]
    fn test_occupied_within_buffer_stays_active() {
        let mut s = active_session();
        assert!(advance(&mut s, end_time() + Duration::seconds(4), Occupancy::Occupied)
            .is_empty());
        assert_eq!(s.phase, SessionPhase::Active);
    }

    #[test]
    fn test_overtime_starts_after_buffer() {
        let mut s = active_session();

        let transitions = advance(&mut s, end_time() + Duration::seconds(5), Occupancy::Occupied);

        assert_eq!(
            transitions.as_slice(),
            &[Transition::OvertimeStarted, Transition::BillingTick { minutes: 0, cost_cents: 0 }]
        );
        assert_eq!(s.phase, SessionPhase::Overtime);
    }

    #[test]
    fn test_overtime_starts_on_unknown_fail_closed() {
        let mut s = active_session();

        let transitions = advance(&mut s, end_time() + Duration::seconds(10), Occupancy::Unknown);

        assert_eq!(transitions[0], Transition::OvertimeStarted);
        assert_eq!(s.phase, SessionPhase::Overtime);
    }

    #[test]
    fn test_minutes_accrue_and_are_monotonic() {
        let mut s = active_session();
        advance(&mut s, end_time() + Duration::seconds(5), Occupancy::Occupied);

        let transitions = advance(&mut s, end_time() + Duration::seconds(65), Occupancy::Occupied);
        assert_eq!(
            transitions.as_slice(),
            &[Transition::BillingTick { minutes: 1, cost_cents: 50 }]
        );

        // Unknown keeps accruing (fail-closed)
        let transitions =
            advance(&mut s, end_time() + Duration::seconds(125), Occupancy::Unknown);
        assert_eq!(
            transitions.as_slice(),
            &[Transition::BillingTick { minutes: 2, cost_cents: 100 }]
        );

        // A tick computing the same minute never decreases anything
        let transitions =
            advance(&mut s, end_time() + Duration::seconds(130), Occupancy::Occupied);
        assert_eq!(
            transitions.as_slice(),
            &[Transition::BillingTick { minutes: 2, cost_cents: 100 }]
        );
        assert_eq!(s.overtime.minutes, 2);
    }

    #[test]
    fn test_departure_freezes_totals() {
        let mut s = active_session();
        advance(&mut s, end_time() + Duration::seconds(5), Occupancy::Occupied);
        advance(&mut s, end_time() + Duration::seconds(65), Occupancy::Occupied);

        let transitions = advance(&mut s, end_time() + Duration::seconds(95), Occupancy::Vacant);

        assert_eq!(
            transitions.as_slice(),
            &[Transition::CompletedWithOvertime { minutes: 1, cost_cents: 50 }]
        );
        assert_eq!(s.phase, SessionPhase::Completed);
        assert!(s.overtime.finalized);
        assert_eq!(s.overtime.minutes, 1);
    }

    #[test]
    fn test_flicker_after_departure_cannot_resume_billing() {
        let mut s = active_session();
        advance(&mut s, end_time() + Duration::seconds(5), Occupancy::Occupied);
        advance(&mut s, end_time() + Duration::seconds(65), Occupancy::Occupied);
        advance(&mut s, end_time() + Duration::seconds(95), Occupancy::Vacant);

        // Spurious occupied reading after the genuine departure
        let transitions =
            advance(&mut s, end_time() + Duration::seconds(200), Occupancy::Occupied);

        assert!(transitions.is_empty());
        assert_eq!(s.overtime.minutes, 1);
        assert_eq!(s.overtime.cost_cents, 50);
    }

    #[test]
    fn test_departure_settles_minute_at_observation() {
        // Occupied at end+5s, next poll only at end+125s already vacant: the
        // final count reflects the departure observation, not the last tick.
        let mut s = active_session();
        advance(&mut s, end_time() + Duration::seconds(5), Occupancy::Occupied);

        let transitions = advance(&mut s, end_time() + Duration::seconds(125), Occupancy::Vacant);

        assert_eq!(
            transitions.as_slice(),
            &[Transition::CompletedWithOvertime { minutes: 2, cost_cents: 100 }]
        );
    }

    #[test]
    fn test_overtime_minutes_math() {
        let end = end_time();
        assert_eq!(overtime_minutes(end, end), 0);
        assert_eq!(overtime_minutes(end + Duration::seconds(5), end), 0);
        assert_eq!(overtime_minutes(end + Duration::seconds(64), end), 0);
        assert_eq!(overtime_minutes(end + Duration::seconds(65), end), 1);
        assert_eq!(overtime_minutes(end + Duration::seconds(95), end), 1);
        assert_eq!(overtime_minutes(end + Duration::seconds(125), end), 2);
        // Clock skew: a time before the end is simply zero
        assert_eq!(overtime_minutes(end - Duration::seconds(30), end), 0);
    }
}
