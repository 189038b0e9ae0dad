//! Per-booking grace period windows
//!
//! Each reservation gets a bounded window to physically occupy its spot
//! before any timer or billing logic engages. Confirmed occupancy cancels the
//! window immediately and exactly once, regardless of how much of it has
//! elapsed; natural expiry without occupancy is a no-show.

use crate::domain::types::BookingId;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tracing::{debug, info};

/// Default grace window length
pub const DEFAULT_GRACE_SECS: u64 = 20;

#[derive(Debug, Clone)]
struct GraceWindow {
    deadline: DateTime<Utc>,
    cancelled: bool,
}

pub struct GracePeriodTimer {
    windows: HashMap<BookingId, GraceWindow>,
    duration_secs: u64,
}

impl GracePeriodTimer {
    pub fn new(duration_secs: u64) -> Self {
        Self { windows: HashMap::new(), duration_secs }
    }

    /// Arm a one-shot grace window for a booking. Re-arming an existing
    /// window is a no-op.
    pub fn start(&mut self, id: BookingId, now: DateTime<Utc>) {
        if self.windows.contains_key(&id) {
            return;
        }
        let deadline = now + Duration::seconds(self.duration_secs as i64);
        debug!(
            booking_id = %id,
            duration_secs = %self.duration_secs,
            "grace_window_armed"
        );
        self.windows.insert(id, GraceWindow { deadline, cancelled: false });
    }

    /// Cancel a booking's window because occupancy was confirmed.
    ///
    /// Returns true only on the first cancellation; repeats and cancels of
    /// unknown bookings are no-ops.
    pub fn cancel(&mut self, id: BookingId) -> bool {
        match self.windows.get_mut(&id) {
            Some(window) if !window.cancelled => {
                window.cancelled = true;
                info!(booking_id = %id, "grace_window_cancelled");
                true
            }
            _ => false,
        }
    }

    /// Sweep expired windows. Returns the bookings whose window elapsed
    /// without a cancellation - the no-shows. Cancelled windows are pruned
    /// silently.
    pub fn expire(&mut self, now: DateTime<Utc>) -> Vec<BookingId> {
        let mut no_shows = Vec::new();
        self.windows.retain(|&id, window| {
            if window.cancelled {
                return false;
            }
            if now >= window.deadline {
                no_shows.push(id);
                return false;
            }
            true
        });
        no_shows
    }

    /// Seconds remaining in an armed, uncancelled window
    pub fn remaining_secs(&self, id: BookingId, now: DateTime<Utc>) -> Option<i64> {
        let window = self.windows.get(&id)?;
        if window.cancelled {
            return None;
        }
        let remaining = (window.deadline - now).num_seconds();
        (remaining > 0).then_some(remaining)
    }

    pub fn is_armed(&self, id: BookingId) -> bool {
        self.windows.get(&id).is_some_and(|w| !w.cancelled)
    }

    /// Drop a booking's window entirely (session pruned)
    pub fn remove(&mut self, id: BookingId) {
        self.windows.remove(&id);
    }
}

impl Default for GracePeriodTimer {
    fn default() -> Self {
        Self::new(DEFAULT_GRACE_SECS)
    }
}
