//! Domain models - core business types and the parking session model
//!
//! This module contains the canonical data types used throughout the engine:
//! - `ParkingSession` - the per-booking monitored state (phase, overtime record)
//! - `SessionEvent` - audit trail events recorded during a session
//! - `Booking` - a reservation as normalized from the backend
//! - `SensorReading` / `Occupancy` - normalized IoT spot state
//! - `OvertimeStatus` - the query surface exposed to the host application

pub mod session;
pub mod types;
