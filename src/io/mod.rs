//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `backend` - REST client for the parking backend (bookings, sensors, billing)
//! - `notify` - Notification contract and dispatch channel
//! - `session_log` - Finished-session output to file (JSONL format)

pub mod backend;
pub mod notify;
pub mod session_log;

// Re-export commonly used types
pub use backend::{BackendApi, BackendError, HttpBackend};
pub use notify::{create_notify_channel, NotificationEvent, NotifySender};
pub use session_log::SessionLog;
