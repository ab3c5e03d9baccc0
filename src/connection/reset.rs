//! Device reset sequencing
//!
//! Entering the boot ROM's download mode, and later rebooting into the
//! application, is driven entirely through the DTR/RTS control lines. Devices
//! attached through their built-in USB-JTAG-Serial peripheral need a
//! different line dance than ones behind a USB-to-serial bridge, selected by
//! the adapter's USB PID.

use std::{thread::sleep, time::Duration};

use log::debug;

use crate::{error::Error, transport::Transport};

/// Default time to wait before releasing the boot pin after a reset
const DEFAULT_RESET_DELAY: u64 = 50; // ms
/// Amount of time to wait if the default reset delay does not work
const EXTRA_RESET_DELAY: u64 = 550; // ms

/// USB PID of the built-in USB-JTAG-Serial peripheral
pub(crate) const USB_SERIAL_JTAG_PID: u16 = 0x1001;

/// Some strategy for resetting a target device into download mode
pub trait ResetStrategy {
    fn reset(&self, transport: &mut dyn Transport) -> Result<(), Error>;
}

/// Classic reset sequence over a USB-to-serial bridge, where RTS drives the
/// EN pin and DTR drives IO0.
#[derive(Debug, Clone, Copy)]
pub struct ClassicReset {
    delay: u64,
}

impl ClassicReset {
    pub fn new(extra_delay: bool) -> Self {
        let delay = if extra_delay {
            EXTRA_RESET_DELAY
        } else {
            DEFAULT_RESET_DELAY
        };

        Self { delay }
    }
}

impl ResetStrategy for ClassicReset {
    fn reset(&self, transport: &mut dyn Transport) -> Result<(), Error> {
        debug!(
            "Using Classic reset strategy with delay of {}ms",
            self.delay
        );

        transport.set_line_state(false, true)?; // IO0 = HIGH, EN = LOW, chip in reset

        sleep(Duration::from_millis(100));

        transport.set_line_state(true, false)?; // IO0 = LOW, EN = HIGH, chip out of reset

        sleep(Duration::from_millis(self.delay));

        transport.set_line_state(false, false)?; // IO0 = HIGH, done

        Ok(())
    }
}

/// Reset sequence for devices connected via their USB-JTAG-Serial peripheral.
#[derive(Debug, Clone, Copy)]
pub struct UsbJtagSerialReset;

impl ResetStrategy for UsbJtagSerialReset {
    fn reset(&self, transport: &mut dyn Transport) -> Result<(), Error> {
        debug!("Using UsbJtagSerial reset strategy");

        transport.set_line_state(false, false)?; // Idle

        sleep(Duration::from_millis(100));

        transport.set_line_state(true, false)?; // Set IO0

        sleep(Duration::from_millis(100));

        // Reset; going through (1,1) instead of (0,0) keeps IO0 held
        transport.set_line_state(false, true)?;
        transport.set_line_state(false, true)?; // RTS set twice, Windows only propagates DTR on RTS setting

        sleep(Duration::from_millis(100));

        transport.set_line_state(false, false)?;

        Ok(())
    }
}

/// Pick the download-mode reset strategy for the attached adapter.
pub fn strategy_for(usb_pid: Option<u16>) -> Box<dyn ResetStrategy> {
    if usb_pid == Some(USB_SERIAL_JTAG_PID) {
        Box::new(UsbJtagSerialReset)
    } else {
        Box::new(ClassicReset::new(false))
    }
}

/// Reset the device into normal run mode, e.g. when handing the link over to
/// the log monitor after flashing.
pub fn reset_to_run(transport: &mut dyn Transport) -> Result<(), Error> {
    sleep(Duration::from_millis(100));

    if transport.usb_pid() == Some(USB_SERIAL_JTAG_PID) {
        transport.set_line_state(false, false)?;

        sleep(Duration::from_millis(100));

        transport.set_line_state(false, true)?;

        sleep(Duration::from_millis(100));

        transport.set_line_state(false, false)?;
    } else {
        transport.set_line_state(false, true)?; // EN = LOW, chip in reset

        sleep(Duration::from_millis(100));

        transport.set_line_state(false, false)?; // EN = HIGH, boot the application
    }

    Ok(())
}
