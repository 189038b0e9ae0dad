//! Overtime reconciliation engine
//!
//! The monitor owns a map of booking id -> [`ParkingSession`] and folds every
//! active booking through the overtime state machine each pass, combining
//! three independently-updating sources of truth: the booking's nominal
//! expiry, the spot sensor's occupancy signal, and the backend billing
//! ledger.
//!
//! Execution is a single task driven by `tokio::select!` over:
//! - the fast sensor-and-state poll
//! - the slower fallback poll (drives reconciliation while the sensor
//!   network is offline)
//! - the presentational countdown tick (no billing side effects)
//! - the command channel (client-side occupancy confirmation)
//! - the shutdown watch

mod handlers;
#[cfg(test)]
mod tests;

use crate::domain::session::ParkingSession;
use crate::domain::types::{BookingId, OvertimeStatus};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::backend::BackendApi;
use crate::io::notify::NotifySender;
use crate::io::session_log::SessionLog;
use crate::services::billing::BillingReconciler;
use crate::services::breaker::CircuitBreaker;
use crate::services::cache::BookingCache;
use crate::services::grace::GracePeriodTimer;
use crate::services::sensor::SensorReconciler;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::interval;
use tracing::info;

/// Commands the host application can inject while the engine runs
#[derive(Debug, Clone, Copy)]
pub enum MonitorCommand {
    /// The user (or app flow) asserts the car is parked; equivalent to a
    /// sensor occupancy confirmation
    DetectCarParked(BookingId),
}

/// Central reconciliation engine for parking sessions
pub struct OvertimeMonitor {
    /// Monitored sessions by booking id
    pub(crate) sessions: HashMap<BookingId, ParkingSession>,
    /// Per-booking grace windows
    pub(crate) grace: GracePeriodTimer,
    /// Sensor reading normalization and LED transition memory
    pub(crate) sensors: SensorReconciler,
    /// Last-known-good bookings list
    pub(crate) cache: BookingCache,
    /// Process-wide remote-call breaker
    pub(crate) breaker: CircuitBreaker,
    /// Backend billing reconciliation
    pub(crate) billing: BillingReconciler,
    /// Remote API handle
    pub(crate) backend: Arc<dyn BackendApi>,
    /// Notification requests out to the dispatcher
    pub(crate) notify: NotifySender,
    /// Finished-session egress
    pub(crate) session_log: SessionLog,
    /// Published status snapshot for host-application queries
    pub(crate) status: Arc<RwLock<HashMap<BookingId, OvertimeStatus>>>,
    /// Bookings currently inside a reconciliation pass
    pub(crate) in_flight: HashSet<BookingId>,
    /// Bookings already finished locally; never re-monitored even if the
    /// backend's list lags behind the completion
    pub(crate) finished_ids: HashSet<BookingId>,
    /// Last countdown value emitted per booking, to avoid duplicates
    pub(crate) countdown_sent: HashMap<BookingId, i64>,
    /// The availability endpoint reported no sensor data network-wide
    pub(crate) offline: bool,
    /// A 401/403 was seen; all remote work stops
    pub(crate) logged_out: bool,
    pub(crate) config: Config,
    pub(crate) metrics: Arc<Metrics>,
}

impl OvertimeMonitor {
    pub fn new(
        config: Config,
        backend: Arc<dyn BackendApi>,
        notify: NotifySender,
        metrics: Arc<Metrics>,
    ) -> Self {
        let session_log = SessionLog::new(config.session_log_file());
        Self {
            sessions: HashMap::new(),
            grace: GracePeriodTimer::new(config.grace_period_secs()),
            sensors: SensorReconciler::new(config.sensor_staleness_cutoff_secs()),
            cache: BookingCache::new(Duration::from_secs(config.cache_ttl_secs())),
            breaker: CircuitBreaker::new(
                config.breaker_failure_threshold(),
                Duration::from_secs(config.breaker_cooldown_secs()),
            ),
            billing: BillingReconciler::new(backend.clone(), metrics.clone()),
            backend,
            notify,
            session_log,
            status: Arc::new(RwLock::new(HashMap::new())),
            in_flight: HashSet::new(),
            finished_ids: HashSet::new(),
            countdown_sent: HashMap::new(),
            offline: false,
            logged_out: false,
            config,
            metrics,
        }
    }

    /// Shared handle to the published status snapshot
    pub fn status_handle(&self) -> Arc<RwLock<HashMap<BookingId, OvertimeStatus>>> {
        self.status.clone()
    }

    /// Number of monitored sessions
    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }

    /// Run the engine until shutdown or forced logout
    pub async fn run(
        &mut self,
        mut cmd_rx: mpsc::Receiver<MonitorCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut fast = interval(Duration::from_secs(self.config.sensor_poll_interval_secs()));
        let mut fallback =
            interval(Duration::from_secs(self.config.fallback_poll_interval_secs()));
        let mut countdown =
            interval(Duration::from_secs(self.config.countdown_interval_secs()));

        info!(
            sensor_interval_secs = %self.config.sensor_poll_interval_secs(),
            fallback_interval_secs = %self.config.fallback_poll_interval_secs(),
            "monitor_started"
        );

        loop {
            tokio::select! {
                _ = fast.tick() => {
                    if !self.offline {
                        self.reconcile_pass(Utc::now()).await;
                    }
                }
                _ = fallback.tick() => {
                    if self.offline {
                        self.reconcile_pass(Utc::now()).await;
                    }
                }
                _ = countdown.tick() => {
                    self.countdown_tick(Utc::now());
                }
                Some(cmd) = cmd_rx.recv() => {
                    self.handle_command(cmd, Utc::now()).await;
                }
                _ = shutdown.changed() => {
                    info!("monitor_shutdown_signal");
                    break;
                }
            }

            if self.logged_out {
                break;
            }
        }

        // Discard in-flight markers; pending network calls may still complete
        // but their results are dropped with the engine.
        self.in_flight.clear();
        info!("monitor_stopped");
    }
}

/// Handle exposed to the host application
#[derive(Clone)]
pub struct MonitorHandle {
    cmd_tx: mpsc::Sender<MonitorCommand>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    status: Arc<RwLock<HashMap<BookingId, OvertimeStatus>>>,
}

impl MonitorHandle {
    /// Current overtime status for a booking, if it is being monitored
    pub fn overtime_status(&self, id: BookingId) -> Option<OvertimeStatus> {
        self.status.read().get(&id).copied()
    }

    /// Inject a client-side "car parked" confirmation
    pub async fn detect_car_parked(&self, id: BookingId) {
        let _ = self.cmd_tx.send(MonitorCommand::DetectCarParked(id)).await;
    }

    /// Stop monitoring; outstanding timers are cleared by the engine task
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Spawn the engine on the current runtime.
///
/// Returns the host-facing handle plus the engine task's join handle.
pub fn spawn_monitor(
    config: Config,
    backend: Arc<dyn BackendApi>,
    notify: NotifySender,
    metrics: Arc<Metrics>,
) -> (MonitorHandle, tokio::task::JoinHandle<()>) {
    let (cmd_tx, cmd_rx) = mpsc::channel(16);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut monitor = OvertimeMonitor::new(config, backend, notify, metrics);
    let status = monitor.status_handle();

    let join = tokio::spawn(async move {
        monitor.run(cmd_rx, shutdown_rx).await;
    });

    (MonitorHandle { cmd_tx, shutdown_tx: Arc::new(shutdown_tx), status }, join)
}
