//! Services - business logic and state management
//!
//! This module contains the core reconciliation services:
//! - `monitor` - Central reconciliation engine and session map
//! - `overtime` - Pure per-booking state machine
//! - `grace` - Per-booking grace period windows
//! - `sensor` - Sensor reading normalization
//! - `billing` - Backend billing reconciliation
//! - `breaker` - Process-wide circuit breaker
//! - `cache` - Short-TTL bookings cache

pub mod billing;
pub mod breaker;
pub mod cache;
pub mod grace;
pub mod monitor;
pub mod overtime;
pub mod sensor;

// Re-export commonly used types
pub use breaker::CircuitBreaker;
pub use monitor::{spawn_monitor, MonitorCommand, MonitorHandle, OvertimeMonitor};
