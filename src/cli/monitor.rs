//! Interactive log monitor loop
//!
//! Output is displayed immediately as it is read, never held back waiting for
//! a newline. Ctrl-R resets the chip, Ctrl-C exits the monitor.

use std::{
    io::{stdout, Write},
    time::Duration,
};

use crossterm::{
    event::{poll, read, Event, KeyCode, KeyEventKind, KeyModifiers},
    terminal::{disable_raw_mode, enable_raw_mode},
};
use log::error;
use miette::{IntoDiagnostic, Result};

use crate::session::Session;

/// Type that ensures that raw mode is disabled when dropped.
struct RawModeGuard;

impl RawModeGuard {
    pub fn new() -> Result<Self> {
        enable_raw_mode().into_diagnostic()?;
        Ok(RawModeGuard)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Err(e) = disable_raw_mode() {
            error!("Failed to disable raw_mode: {:#}", e)
        }
    }
}

/// Relay the session's log output to the terminal until the user exits or
/// the device goes away.
pub fn run(session: &mut Session) -> Result<()> {
    println!("Commands:");
    println!("    CTRL+R    Reset chip");
    println!("    CTRL+C    Exit");
    println!();

    // We are in raw mode until `_raw_mode` is dropped (ie. this function
    // returns).
    let _raw_mode = RawModeGuard::new()?;

    let stdout = stdout();
    let mut stdout = stdout.lock();
    let mut printed = 0;

    while session.log().is_monitoring() {
        session.poll_monitor();

        let lines = session.log().lines();
        for line in &lines[printed..] {
            // raw mode needs explicit carriage returns
            let text = line.text.replace('\n', "\r\n");
            write!(stdout, "{text}").into_diagnostic()?;
        }
        printed = lines.len();

        // Don't forget to flush the writer!
        stdout.flush().ok();

        if poll(Duration::from_secs(0)).into_diagnostic()? {
            if let Event::Key(key) = read().into_diagnostic()? {
                if key.kind == KeyEventKind::Press
                    && key.modifiers.contains(KeyModifiers::CONTROL)
                {
                    match key.code {
                        KeyCode::Char('c') => break,
                        KeyCode::Char('r') => {
                            session.reset_device();
                            continue;
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    Ok(())
}
