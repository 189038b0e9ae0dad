//! Billing reconciliation against the backend ledger
//!
//! Overtime ticks are idempotent upserts the backend max-merges, so repeating
//! them is harmless. Finalization is attempted a bounded number of times;
//! if the remote write never lands, the local record is frozen anyway - the
//! engine prefers undercharging once to ever double-billing.

use crate::domain::types::BookingId;
use crate::infra::metrics::Metrics;
use crate::io::backend::{BackendApi, BackendError, OvertimeCharge};
use crate::services::breaker::CircuitBreaker;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Finalize attempts before giving up on the remote write
pub const FINALIZE_MAX_ATTEMPTS: u32 = 3;

/// Fixed delay between finalize attempts
pub const FINALIZE_RETRY_DELAY: Duration = Duration::from_secs(2);

pub struct BillingReconciler {
    backend: Arc<dyn BackendApi>,
    metrics: Arc<Metrics>,
}

impl BillingReconciler {
    pub fn new(backend: Arc<dyn BackendApi>, metrics: Arc<Metrics>) -> Self {
        Self { backend, metrics }
    }

    /// Push one overtime tick to the backend.
    ///
    /// Safe to call repeatedly with the same or lower values. Returns the
    /// backend's merged view on success, `Ok(None)` when the call was skipped
    /// (breaker open) or failed transiently (already logged), and
    /// `Err(Unauthorized)` only for auth failures the caller must escalate.
    pub async fn record_overtime_tick(
        &self,
        breaker: &mut CircuitBreaker,
        id: BookingId,
        minutes: u64,
        cost_cents: u64,
    ) -> Result<Option<OvertimeCharge>, BackendError> {
        if !breaker.can_attempt(Instant::now()) {
            self.metrics.record_breaker_skip();
            debug!(booking_id = %id, "billing_tick_skipped_breaker_open");
            return Ok(None);
        }

        match self.backend.check_and_bill(id, minutes, cost_cents).await {
            Ok(charge) => {
                breaker.record_success();
                self.metrics.record_billing_tick();
                debug!(
                    booking_id = %id,
                    minutes = %charge.minutes,
                    cost_cents = %charge.cost_cents,
                    "billing_tick_recorded"
                );
                Ok(Some(charge))
            }
            Err(BackendError::Unauthorized) => Err(BackendError::Unauthorized),
            Err(e) => {
                let was_open = breaker.is_open();
                breaker.record_failure(Instant::now());
                if !was_open && breaker.is_open() {
                    self.metrics.record_breaker_open();
                }
                self.metrics.record_billing_failure();
                warn!(booking_id = %id, error = %e, "billing_tick_failed");
                Ok(None)
            }
        }
    }

    /// Finalize a session's totals on the backend.
    ///
    /// Retries up to [`FINALIZE_MAX_ATTEMPTS`] times with a fixed delay. The
    /// caller freezes the local record regardless of the outcome; a `false`
    /// return means the remote ledger may be behind, which is logged loudly
    /// and surfaced to nobody.
    pub async fn finalize(
        &self,
        breaker: &mut CircuitBreaker,
        id: BookingId,
        minutes: u64,
        cost_cents: u64,
    ) -> Result<bool, BackendError> {
        let idempotency_key = Uuid::now_v7().to_string();

        for attempt in 1..=FINALIZE_MAX_ATTEMPTS {
            if !breaker.can_attempt(Instant::now()) {
                self.metrics.record_breaker_skip();
                debug!(
                    booking_id = %id,
                    attempt = %attempt,
                    "finalize_skipped_breaker_open"
                );
            } else {
                match self
                    .backend
                    .complete_booking(id, minutes, cost_cents, &idempotency_key)
                    .await
                {
                    Ok(()) => {
                        breaker.record_success();
                        info!(
                            booking_id = %id,
                            overtime_minutes = %minutes,
                            overtime_cost_cents = %cost_cents,
                            attempt = %attempt,
                            "session_finalized"
                        );
                        return Ok(true);
                    }
                    Err(BackendError::Unauthorized) => return Err(BackendError::Unauthorized),
                    Err(e) => {
                        let was_open = breaker.is_open();
                        breaker.record_failure(Instant::now());
                        if !was_open && breaker.is_open() {
                            self.metrics.record_breaker_open();
                        }
                        self.metrics.record_finalize_retry();
                        warn!(
                            booking_id = %id,
                            attempt = %attempt,
                            error = %e,
                            "finalize_attempt_failed"
                        );
                    }
                }
            }

            if attempt < FINALIZE_MAX_ATTEMPTS {
                sleep(FINALIZE_RETRY_DELAY).await;
            }
        }

        self.metrics.record_finalize_failure();
        error!(
            booking_id = %id,
            overtime_minutes = %minutes,
            overtime_cost_cents = %cost_cents,
            "finalize_reconciliation_failed"
        );
        Ok(false)
    }
}
