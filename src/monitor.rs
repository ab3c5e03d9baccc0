//! Device log monitor
//!
//! After a successful flash (or on demand) the serial link is handed over to
//! a [LogSession]: the device is reset into normal run mode and everything it
//! prints is collected as timestamped lines until monitoring is stopped.
//!
//! Lines are recorded per received chunk, not per newline: every successful
//! read becomes exactly one entry, even if it contains several newlines or
//! none at all. Output is therefore never held back waiting for a line
//! terminator, at the cost of occasionally splitting a line across entries.

use std::{io::Read, time::Duration};

use chrono::{DateTime, Local};
use log::warn;

use crate::{connection::reset::reset_to_run, transport::Transport};

/// Baud rate the badge application logs at
pub const MONITOR_BAUD: u32 = 115_200;

/// Poll timeout for a single monitor read
const POLL_TIMEOUT: Duration = Duration::from_millis(5);

/// One timestamped chunk of device output
#[derive(Debug, Clone)]
pub struct LogLine {
    pub timestamp: DateTime<Local>,
    pub text: String,
}

/// Accumulated device output and the monitoring flag.
///
/// The transport stays owned by the session controller; it is lent to
/// [LogSession::start] and [LogSession::poll] per call.
#[derive(Debug, Default)]
pub struct LogSession {
    lines: Vec<LogLine>,
    monitoring: bool,
}

impl LogSession {
    pub fn new() -> Self {
        LogSession::default()
    }

    /// Reset the device into run mode and begin collecting output.
    ///
    /// A failed reset sequence is reported as a warning line in the log
    /// itself and monitoring continues listen-only: the device may not
    /// support line control but can be reset by hand.
    pub fn start(&mut self, transport: &mut dyn Transport) {
        if let Err(e) = transport.set_baud_rate(MONITOR_BAUD) {
            warn!("Failed to set monitor baud rate: {e:#}");
        }
        if let Err(e) = transport.set_timeout(POLL_TIMEOUT) {
            warn!("Failed to set monitor poll timeout: {e:#}");
        }

        if let Err(e) = reset_to_run(transport) {
            self.push_line(format!(
                "[monitor] failed to reset device, listening only: {e:#}"
            ));
        }

        self.monitoring = true;
    }

    /// Read one chunk of device output, appending it as a timestamped line.
    ///
    /// Returns `true` when a line was appended. Timed-out reads append
    /// nothing; read errors stop monitoring and are surfaced to the caller.
    pub fn poll(&mut self, transport: &mut dyn Transport) -> std::io::Result<bool> {
        if !self.monitoring {
            return Ok(false);
        }

        let mut buf = [0; 1024];
        match transport.read(&mut buf) {
            Ok(0) => Ok(false),
            Ok(count) => {
                self.push_line(String::from_utf8_lossy(&buf[..count]).into_owned());
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(false),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => Ok(false),
            Err(e) => {
                self.monitoring = false;
                Err(e)
            }
        }
    }

    /// Re-issue the run-mode reset, e.g. for an interactive "reset chip" key
    pub fn reset_device(&mut self, transport: &mut dyn Transport) {
        if let Err(e) = reset_to_run(transport) {
            self.push_line(format!("[monitor] failed to reset device: {e:#}"));
        }
    }

    /// Stop collecting output. The transport is left untouched.
    pub fn stop(&mut self) {
        self.monitoring = false;
    }

    /// Discard accumulated lines; monitoring state is unaffected.
    pub fn clear(&mut self) {
        self.lines.clear();
    }

    pub fn lines(&self) -> &[LogLine] {
        &self.lines
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitoring
    }

    fn push_line(&mut self, text: String) {
        self.lines.push(LogLine {
            timestamp: Local::now(),
            text,
        });
    }
}
