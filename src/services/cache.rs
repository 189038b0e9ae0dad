//! Short-TTL cache for the active-bookings list
//!
//! A plain TTL cache with one deviation: while the circuit breaker is open,
//! expiry is suspended and stale entries are served, since an old bookings
//! list beats no bookings list during an outage.

use crate::domain::types::Booking;
use std::time::{Duration, Instant};
use tracing::debug;

/// How long a fetched bookings list counts as fresh
pub const FRESHNESS_WINDOW: Duration = Duration::from_secs(30);

pub struct BookingCache {
    entries: Vec<Booking>,
    fetched_at: Option<Instant>,
    ttl: Duration,
}

impl BookingCache {
    pub fn new(ttl: Duration) -> Self {
        Self { entries: Vec::new(), fetched_at: None, ttl }
    }

    /// Replace the cached list and stamp the fetch time
    pub fn set(&mut self, list: Vec<Booking>, now: Instant) {
        self.entries = list;
        self.fetched_at = Some(now);
    }

    /// Return the cached list if it is fresh, or - when `serve_stale` is set
    /// (breaker open) - regardless of age. `None` means the caller must
    /// refetch.
    pub fn get(&self, now: Instant, serve_stale: bool) -> Option<&[Booking]> {
        let fetched_at = self.fetched_at?;
        let age = now.duration_since(fetched_at);

        if age <= self.ttl {
            return Some(&self.entries);
        }
        if serve_stale {
            debug!(age_secs = %age.as_secs(), "bookings_cache_serving_stale");
            return Some(&self.entries);
        }
        None
    }

    /// Age of the cached list, if any
    pub fn age(&self, now: Instant) -> Option<Duration> {
        self.fetched_at.map(|t| now.duration_since(t))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.fetched_at = None;
    }
}

impl Default for BookingCache {
    fn default() -> Self {
        Self::new(FRESHNESS_WINDOW)
    }
}
