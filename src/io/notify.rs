//! Notification contract and dispatch channel
//!
//! The engine only *requests* notifications; delivery belongs to the host
//! application's dispatcher. Requests flow through a bounded channel and are
//! dropped (with accounting) rather than ever blocking a reconciliation pass.

use crate::domain::types::BookingId;
use crate::infra::metrics::Metrics;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

/// A request to surface a state transition to the user
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NotificationEvent {
    BookingConfirmed { booking_id: BookingId },
    GraceCountdown { booking_id: BookingId, remaining_secs: i64 },
    OvertimeStarted { booking_id: BookingId },
    OvertimeUpdated { booking_id: BookingId, minutes: u64, cost_cents: u64 },
    SessionCompleted { booking_id: BookingId, overtime_minutes: u64, overtime_cost_cents: u64 },
    /// The backend rejected our credentials; the host must log out
    SessionInvalidated,
}

impl NotificationEvent {
    /// Stable event key consumed by the dispatcher
    pub fn event_key(&self) -> &'static str {
        match self {
            NotificationEvent::BookingConfirmed { .. } => "booking_confirmed",
            NotificationEvent::GraceCountdown { .. } => "grace_countdown",
            NotificationEvent::OvertimeStarted { .. } => "overtime_started",
            NotificationEvent::OvertimeUpdated { .. } => "overtime_updated",
            NotificationEvent::SessionCompleted { .. } => "session_completed",
            NotificationEvent::SessionInvalidated => "session_invalidated",
        }
    }
}

/// Sender handle for notification requests
///
/// Clone this to share across producers. Non-blocking: if the channel is
/// full the request is dropped and counted.
#[derive(Clone)]
pub struct NotifySender {
    tx: mpsc::Sender<NotificationEvent>,
    metrics: Arc<Metrics>,
}

impl NotifySender {
    pub fn new(tx: mpsc::Sender<NotificationEvent>, metrics: Arc<Metrics>) -> Self {
        Self { tx, metrics }
    }

    pub fn send(&self, event: NotificationEvent) {
        let key = event.event_key();
        match self.tx.try_send(event) {
            Ok(()) => self.metrics.record_notification_sent(),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.metrics.record_notification_dropped();
                warn!(event = %key, "notification_dropped_channel_full");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.metrics.record_notification_dropped();
                warn!(event = %key, "notification_dropped_channel_closed");
            }
        }
    }
}

/// Create a notification channel pair
pub fn create_notify_channel(
    buffer_size: usize,
    metrics: Arc<Metrics>,
) -> (NotifySender, mpsc::Receiver<NotificationEvent>) {
    let (tx, rx) = mpsc::channel(buffer_size);
    (NotifySender::new(tx, metrics), rx)
}
