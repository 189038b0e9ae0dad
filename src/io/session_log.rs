//! Session egress - writes finished sessions to file
//!
//! Sessions are written in JSONL format (one JSON object per line) to the
//! file specified in config. Egress failures are logged and never interrupt
//! the engine.

use crate::domain::session::ParkingSession;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use tracing::{debug, error, info};

/// Egress writer for finished parking sessions
pub struct SessionLog {
    file_path: String,
}

impl SessionLog {
    pub fn new(file_path: &str) -> Self {
        info!(file_path = %file_path, "session_log_initialized");
        Self { file_path: file_path.to_string() }
    }

    /// Write a finished session to the log file.
    /// Returns true if successful, false otherwise.
    pub fn write_session(&self, session: &ParkingSession) -> bool {
        let json = session.to_json();

        match self.append_line(&json) {
            Ok(()) => {
                info!(
                    booking_id = %session.booking.id,
                    phase = %session.phase.as_str(),
                    overtime_minutes = %session.overtime.minutes,
                    "session_logged"
                );
                true
            }
            Err(e) => {
                error!(
                    booking_id = %session.booking.id,
                    error = %e,
                    "session_log_failed"
                );
                false
            }
        }
    }

    fn append_line(&self, line: &str) -> std::io::Result<()> {
        let path = Path::new(&self.file_path);

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;

        writeln!(file, "{}", line)?;
        debug!(file = %self.file_path, bytes = %line.len(), "session_log_written");

        Ok(())
    }
}
