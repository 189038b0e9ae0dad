//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations; reporting is the only operation that
//! needs synchronization (via atomic swap).
//!
//! NOTE: All atomics use Relaxed ordering intentionally; these are statistical
//! counters only. Do NOT use these atomics for coordination or logic decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Lock-free metrics collector for the reconciliation engine
pub struct Metrics {
    /// Reconciliation passes ever run (monotonic)
    polls_total: AtomicU64,
    /// Passes since last report (reset on report)
    polls_since_report: AtomicU64,
    /// Remote fetches that failed (monotonic)
    poll_failures: AtomicU64,
    /// Bookings lists served stale from cache during outages (monotonic)
    stale_serves: AtomicU64,
    /// Circuit breaker open transitions (monotonic)
    breaker_opens: AtomicU64,
    /// Remote calls skipped because the breaker was open (monotonic)
    breaker_skips: AtomicU64,
    /// Sessions discovered and monitored (monotonic)
    sessions_started: AtomicU64,
    /// Sessions finished with confirmed departure or on-time end (monotonic)
    sessions_completed: AtomicU64,
    /// Sessions cancelled as no-shows (monotonic)
    sessions_cancelled: AtomicU64,
    /// Sessions that entered the overtime phase (monotonic)
    overtime_sessions: AtomicU64,
    /// Successful overtime billing ticks (monotonic)
    billing_ticks: AtomicU64,
    /// Billing ticks that failed transport (monotonic)
    billing_failures: AtomicU64,
    /// Finalize attempts that had to be retried (monotonic)
    finalize_retries: AtomicU64,
    /// Finalizations that exhausted every retry (monotonic)
    finalize_failures: AtomicU64,
    /// Notification requests handed to the dispatcher (monotonic)
    notifications_sent: AtomicU64,
    /// Notification requests dropped on a full channel (monotonic)
    notifications_dropped: AtomicU64,
    /// Last report time (only accessed from reporter, not atomic)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            polls_total: AtomicU64::new(0),
            polls_since_report: AtomicU64::new(0),
            poll_failures: AtomicU64::new(0),
            stale_serves: AtomicU64::new(0),
            breaker_opens: AtomicU64::new(0),
            breaker_skips: AtomicU64::new(0),
            sessions_started: AtomicU64::new(0),
            sessions_completed: AtomicU64::new(0),
            sessions_cancelled: AtomicU64::new(0),
            overtime_sessions: AtomicU64::new(0),
            billing_ticks: AtomicU64::new(0),
            billing_failures: AtomicU64::new(0),
            finalize_retries: AtomicU64::new(0),
            finalize_failures: AtomicU64::new(0),
            notifications_sent: AtomicU64::new(0),
            notifications_dropped: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    #[inline]
    pub fn record_poll(&self) {
        self.polls_total.fetch_add(1, Ordering::Relaxed);
        self.polls_since_report.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_poll_failure(&self) {
        self.poll_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_stale_serve(&self) {
        self.stale_serves.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_breaker_open(&self) {
        self.breaker_opens.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_breaker_skip(&self) {
        self.breaker_skips.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_session_started(&self) {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_session_completed(&self) {
        self.sessions_completed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_session_cancelled(&self) {
        self.sessions_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_overtime_session(&self) {
        self.overtime_sessions.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_billing_tick(&self) {
        self.billing_ticks.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_billing_failure(&self) {
        self.billing_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_finalize_retry(&self) {
        self.finalize_retries.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_finalize_failure(&self) {
        self.finalize_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_notification_sent(&self) {
        self.notifications_sent.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_notification_dropped(&self) {
        self.notifications_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn polls_total(&self) -> u64 {
        self.polls_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn notifications_dropped(&self) -> u64 {
        self.notifications_dropped.load(Ordering::Relaxed)
    }

    /// Calculate and return a metrics summary, then reset periodic counters
    pub fn report(&self, active_sessions: usize, overtime_active: usize) -> MetricsSummary {
        let polls_count = self.polls_since_report.swap(0, Ordering::Relaxed);

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let polls_per_min = if elapsed.as_secs_f64() > 0.0 {
            polls_count as f64 * 60.0 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        MetricsSummary {
            polls_total: self.polls_total.load(Ordering::Relaxed),
            polls_per_min,
            poll_failures: self.poll_failures.load(Ordering::Relaxed),
            stale_serves: self.stale_serves.load(Ordering::Relaxed),
            breaker_opens: self.breaker_opens.load(Ordering::Relaxed),
            breaker_skips: self.breaker_skips.load(Ordering::Relaxed),
            active_sessions,
            overtime_active,
            sessions_started: self.sessions_started.load(Ordering::Relaxed),
            sessions_completed: self.sessions_completed.load(Ordering::Relaxed),
            sessions_cancelled: self.sessions_cancelled.load(Ordering::Relaxed),
            overtime_sessions: self.overtime_sessions.load(Ordering::Relaxed),
            billing_ticks: self.billing_ticks.load(Ordering::Relaxed),
            billing_failures: self.billing_failures.load(Ordering::Relaxed),
            finalize_retries: self.finalize_retries.load(Ordering::Relaxed),
            finalize_failures: self.finalize_failures.load(Ordering::Relaxed),
            notifications_sent: self.notifications_sent.load(Ordering::Relaxed),
            notifications_dropped: self.notifications_dropped.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct MetricsSummary {
    pub polls_total: u64,
    pub polls_per_min: f64,
    pub poll_failures: u64,
    pub stale_serves: u64,
    pub breaker_opens: u64,
    pub breaker_skips: u64,
    pub active_sessions: usize,
    pub overtime_active: usize,
    pub sessions_started: u64,
    pub sessions_completed: u64,
    pub sessions_cancelled: u64,
    pub overtime_sessions: u64,
    pub billing_ticks: u64,
    pub billing_failures: u64,
    pub finalize_retries: u64,
    pub finalize_failures: u64,
    pub notifications_sent: u64,
    pub notifications_dropped: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            polls_total = %self.polls_total,
            polls_per_min = format!("{:.1}", self.polls_per_min),
            poll_failures = %self.poll_failures,
            stale_serves = %self.stale_serves,
            breaker_opens = %self.breaker_opens,
            active_sessions = %self.active_sessions,
            overtime_active = %self.overtime_active,
            completed = %self.sessions_completed,
            cancelled = %self.sessions_cancelled,
            billing_ticks = %self.billing_ticks,
            finalize_failures = %self.finalize_failures,
            notif_dropped = %self.notifications_dropped,
            "metrics"
        );
    }
}
