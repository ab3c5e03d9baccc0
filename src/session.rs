//! Session controller
//!
//! [Session] is the top-level state machine a frontend drives: it owns the
//! transport (through the [Connection]) for the whole session, lends it to
//! the boot-ROM client, the flasher and the log monitor one operation at a
//! time, and guarantees that every exit path, error or not, leaves the
//! transport closed and the state consistent. Errors are recorded on the
//! session as well as returned, so a frontend can render a retry affordance
//! from state alone.

use std::{thread::sleep, time::Duration};

use log::{debug, warn};
use strum::Display;

use crate::{
    chip::ChipIdentity,
    connection::Connection,
    error::Error,
    flasher::{
        FirmwareSource, Flasher, ProgressCallbacks, TransferOptions, APP_FLASH_OFFSET,
    },
    monitor::LogSession,
    transport::{LinkLostSubscription, Transport},
};

/// Pause between a successful flash and the automatic monitor start, long
/// enough for the device to come out of reset but short enough to catch
/// early boot output.
pub const MONITOR_START_DELAY: Duration = Duration::from_secs(1);

/// Connection status of a session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Flashing,
}

/// Status of one firmware-transfer attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum FlashJobStatus {
    Idle,
    Downloading,
    Flashing,
    Success,
    Error,
}

/// Terminal error detail carried by the session state
#[derive(Debug, Clone)]
pub struct SessionError {
    pub message: String,
    pub detail: Option<String>,
}

impl SessionError {
    fn from_error(err: &Error) -> Self {
        let detail = std::error::Error::source(err).map(|source| format!("{source}"));
        SessionError {
            message: err.to_string(),
            detail,
        }
    }
}

/// One firmware-transfer attempt.
///
/// A new flash supersedes the previous job rather than mutating it; progress
/// is monotonically non-decreasing while the job is flashing.
#[derive(Debug, Clone)]
pub struct FlashJob {
    pub status: FlashJobStatus,
    /// Percentage, 0-100
    pub progress: u8,
    pub message: String,
    pub error: Option<SessionError>,
    total: usize,
}

impl FlashJob {
    fn new() -> Self {
        FlashJob {
            status: FlashJobStatus::Idle,
            progress: 0,
            message: String::new(),
            error: None,
            total: 0,
        }
    }

    fn succeed(&mut self) {
        self.status = FlashJobStatus::Success;
        self.progress = 100;
        self.message = "Firmware written".into();
    }

    fn fail(&mut self, err: &Error) {
        self.status = FlashJobStatus::Error;
        self.message = "Flashing failed".into();
        self.error = Some(SessionError::from_error(err));
    }
}

impl ProgressCallbacks for FlashJob {
    fn init(&mut self, addr: u32, total: usize) {
        self.status = FlashJobStatus::Flashing;
        self.total = total;
        self.progress = 0;
        self.message = format!("Writing {total} bytes at {addr:#x}");
    }

    fn update(&mut self, current: usize) {
        if self.total > 0 {
            let pct = (current * 100 / self.total) as u8;
            // progress never moves backwards while flashing
            self.progress = self.progress.max(pct);
        }
    }

    fn finish(&mut self) {
        self.progress = 100;
    }
}

/// Fans progress reports out to the session's job record and an optional
/// caller-supplied observer.
struct TeeProgress<'a, 'b> {
    job: &'a mut FlashJob,
    observer: Option<&'b mut dyn ProgressCallbacks>,
}

impl ProgressCallbacks for TeeProgress<'_, '_> {
    fn init(&mut self, addr: u32, total: usize) {
        self.job.init(addr, total);
        if let Some(observer) = self.observer.as_mut() {
            observer.init(addr, total);
        }
    }

    fn update(&mut self, current: usize) {
        self.job.update(current);
        if let Some(observer) = self.observer.as_mut() {
            observer.update(current);
        }
    }

    fn finish(&mut self) {
        self.job.finish();
        if let Some(observer) = self.observer.as_mut() {
            observer.finish();
        }
    }
}

/// A logical session with one device
#[derive(Default)]
pub struct Session {
    state: SessionState,
    connection: Option<Connection>,
    chip: Option<ChipIdentity>,
    last_error: Option<SessionError>,
    job: Option<FlashJob>,
    log: LogSession,
    link_lost: Option<LinkLostSubscription>,
    /// Link speed to negotiate after sync; `None` stays at the ROM rate
    speed: Option<u32>,
}

impl Session {
    pub fn new() -> Self {
        Session::default()
    }

    /// A session which negotiates the given link speed after sync
    pub fn with_speed(speed: Option<u32>) -> Self {
        Session {
            speed,
            ..Session::default()
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Identity of the connected chip; set exactly while a device is
    /// connected
    pub fn chip(&self) -> Option<ChipIdentity> {
        self.chip
    }

    pub fn last_error(&self) -> Option<&SessionError> {
        self.last_error.as_ref()
    }

    /// The most recent flash job, if any
    pub fn job(&self) -> Option<&FlashJob> {
        self.job.as_ref()
    }

    pub fn log(&self) -> &LogSession {
        &self.log
    }

    /// Discard accumulated log lines
    pub fn clear_log(&mut self) {
        self.log.clear();
    }

    /// Open a transport and bring the device up.
    ///
    /// `open` is called to acquire the transport; returning
    /// [Error::Cancelled] from it means the user dismissed the port
    /// selection, which is not an error: the session silently stays
    /// disconnected. Every other failure tears the transport down completely
    /// before returning.
    pub fn connect<F>(&mut self, open: F) -> Result<(), Error>
    where
        F: FnOnce() -> Result<Box<dyn Transport>, Error>,
    {
        if self.state != SessionState::Disconnected {
            return Err(Error::AlreadyConnected);
        }

        self.state = SessionState::Connecting;
        self.last_error = None;

        let mut transport = match open() {
            Ok(transport) => transport,
            Err(Error::Cancelled) => {
                debug!("Port selection cancelled");
                self.state = SessionState::Disconnected;
                return Ok(());
            }
            Err(e) => {
                self.state = SessionState::Disconnected;
                return Err(self.record(e));
            }
        };

        self.link_lost = Some(transport.subscribe_link_lost());
        let mut connection = Connection::new(transport);

        if let Err(e) = connection.begin() {
            // dropping the connection closes the transport
            return Err(self.teardown(e));
        }

        let chip = match connection.detect_chip() {
            Ok(chip) => chip,
            Err(e) => {
                drop(connection);
                return Err(self.teardown(e));
            }
        };

        if let Some(speed) = self.speed {
            connection.negotiate_baud(speed);
        }

        self.connection = Some(connection);
        self.chip = Some(chip);
        self.state = SessionState::Connected;

        Ok(())
    }

    /// Close the session unconditionally.
    ///
    /// Always succeeds, from any state, any number of times: close errors
    /// are swallowed, monitoring stops, chip identity is cleared.
    pub fn disconnect(&mut self) {
        self.log.stop();

        if let Some(mut subscription) = self.link_lost.take() {
            subscription.cancel();
        }

        // dropping the connection releases the serial port
        self.connection = None;
        self.chip = None;
        self.state = SessionState::Disconnected;
    }

    /// Return to a clean slate before a retry: disconnect and forget the
    /// previous job, error and log lines. Idempotent.
    pub fn reset(&mut self) {
        self.disconnect();
        self.job = None;
        self.last_error = None;
        self.log.clear();
    }

    /// Flash a firmware image to the badge's application offset.
    ///
    /// Valid only while connected; a second flash request while one is in
    /// flight is rejected, not queued. On success the log monitor is started
    /// automatically after a short delay to catch early boot output.
    pub fn flash_firmware(
        &mut self,
        source: &FirmwareSource,
        options: &TransferOptions,
    ) -> Result<(), Error> {
        self.flash_firmware_observed(source, options, None)
    }

    /// [Session::flash_firmware] with an additional progress observer
    pub fn flash_firmware_observed(
        &mut self,
        source: &FirmwareSource,
        options: &TransferOptions,
        observer: Option<&mut dyn ProgressCallbacks>,
    ) -> Result<(), Error> {
        match self.state {
            SessionState::Connected => {}
            SessionState::Flashing => return Err(Error::FlashInProgress),
            _ => return Err(Error::NotConnected),
        }

        let Some(chip) = self.chip else {
            return Err(Error::NotConnected);
        };
        let Some(connection) = self.connection.as_mut() else {
            return Err(Error::NotConnected);
        };

        // the transfer reclaims the transport from any active monitor
        self.log.stop();

        let mut job = FlashJob::new();
        self.state = SessionState::Flashing;

        let mut progress = TeeProgress {
            job: &mut job,
            observer,
        };
        let result = Flasher::new(connection, chip).transfer(
            source,
            APP_FLASH_OFFSET,
            options,
            &mut Some(&mut progress),
        );

        self.state = SessionState::Connected;

        match result {
            Ok(()) => {
                job.succeed();
                self.job = Some(job);

                sleep(MONITOR_START_DELAY);
                if let Err(e) = self.start_monitor() {
                    warn!("Failed to start log monitor after flashing: {e:#}");
                }

                Ok(())
            }
            Err(e) => {
                job.fail(&e);
                self.job = Some(job);
                self.check_link();
                Err(self.record(e))
            }
        }
    }

    /// Erase the entire flash of the connected device
    pub fn erase_flash(&mut self) -> Result<(), Error> {
        if self.state != SessionState::Connected {
            return Err(Error::NotConnected);
        }
        let Some(chip) = self.chip else {
            return Err(Error::NotConnected);
        };
        let Some(connection) = self.connection.as_mut() else {
            return Err(Error::NotConnected);
        };

        self.log.stop();

        match Flasher::new(connection, chip).erase_flash() {
            Ok(()) => Ok(()),
            Err(e) => {
                self.check_link();
                Err(self.record(e))
            }
        }
    }

    /// Reset the device into run mode and begin collecting log output
    pub fn start_monitor(&mut self) -> Result<(), Error> {
        if self.state != SessionState::Connected {
            return Err(Error::NotConnected);
        }
        let Some(connection) = self.connection.as_mut() else {
            return Err(Error::NotConnected);
        };

        self.log.start(connection.transport_mut());

        Ok(())
    }

    /// Stop collecting log output; the session stays connected
    pub fn stop_monitor(&mut self) {
        self.log.stop();
    }

    /// Pump one chunk of device output into the log.
    ///
    /// Returns `true` when a line was appended. Transport loss transitions
    /// the session to disconnected.
    pub fn poll_monitor(&mut self) -> bool {
        if !self.check_link() {
            return false;
        }
        let Some(connection) = self.connection.as_mut() else {
            return false;
        };

        match self.log.poll(connection.transport_mut()) {
            Ok(appended) => appended,
            Err(e) => {
                warn!("Monitor read failed: {e:#}");
                self.check_link();
                false
            }
        }
    }

    /// Re-issue the run-mode reset while monitoring
    pub fn reset_device(&mut self) {
        if let Some(connection) = self.connection.as_mut() {
            self.log.reset_device(connection.transport_mut());
        }
    }

    /// Consume the link-lost subscription; a lost device transitions the
    /// session to disconnected. Returns whether the session is still up.
    pub fn check_link(&mut self) -> bool {
        if let Some(subscription) = &self.link_lost {
            if subscription.is_lost() {
                warn!("Serial device lost, disconnecting");
                self.disconnect();
            }
        }

        self.state != SessionState::Disconnected
    }

    /// Record an error on the session state and hand it back
    fn record(&mut self, err: Error) -> Error {
        self.last_error = Some(SessionError::from_error(&err));
        err
    }

    /// Tear down a failed bring-up: transport already dropped by the caller,
    /// state back to disconnected with the error attached.
    fn teardown(&mut self, err: Error) -> Error {
        if let Some(mut subscription) = self.link_lost.take() {
            subscription.cancel();
        }
        self.connection = None;
        self.chip = None;
        self.state = SessionState::Disconnected;

        self.record(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        chip::Chip,
        connection::command::CommandType,
        error::ConnectionError,
        flasher::EXPECTED_FIRMWARE_ASSET,
        transport::mock::{MockTransport, Recorder, SyncBehaviour},
    };

    fn connect_session(mock: MockTransport) -> (Session, Recorder) {
        let recorder = mock.recorder();
        let mut session = Session::new();
        session.connect(|| Ok(Box::new(mock))).unwrap();
        assert_eq!(session.state(), SessionState::Connected);
        (session, recorder)
    }

    #[test]
    fn connect_brings_up_and_identifies_the_chip() {
        let (session, _) = connect_session(MockTransport::new());

        assert_eq!(session.chip(), Some(ChipIdentity::Known(Chip::Esp32c3)));
        assert!(session.last_error().is_none());
    }

    #[test]
    fn connect_failure_tears_down_and_records_the_error() {
        let mut mock = MockTransport::new();
        mock.sync = SyncBehaviour::Never;

        let mut session = Session::new();
        let err = session.connect(|| Ok(Box::new(mock))).unwrap_err();

        assert!(matches!(
            err,
            Error::Connection(ConnectionError::ConnectionFailed)
        ));
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(session.chip().is_none());
        assert!(session.last_error().is_some());

        // recovered: a fresh connect attempt is allowed again
        session.connect(|| Ok(Box::new(MockTransport::new()))).unwrap();
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[test]
    fn cancelled_port_selection_is_a_silent_no_op() {
        let mut session = Session::new();
        session.connect(|| Err(Error::Cancelled)).unwrap();

        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(session.last_error().is_none());
    }

    #[test]
    fn connect_is_rejected_while_a_session_is_up() {
        let (mut session, _) = connect_session(MockTransport::new());

        let err = session
            .connect(|| Ok(Box::new(MockTransport::new())))
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyConnected));
    }

    #[test]
    fn flashing_requires_a_connected_session() {
        let mut session = Session::new();
        let source = FirmwareSource::new(EXPECTED_FIRMWARE_ASSET, vec![0u8; 1024]);

        let err = session
            .flash_firmware(&source, &TransferOptions::default())
            .unwrap_err();

        assert!(matches!(err, Error::NotConnected));
        assert!(session.job().is_none());
    }

    #[test]
    fn wrong_asset_name_fails_without_wire_io() {
        let (mut session, recorder) = connect_session(MockTransport::new());
        let connect_traffic = recorder.ops().len();

        let source = FirmwareSource::new("wrong-name.bin", vec![0u8; 1024]);
        let err = session
            .flash_firmware(&source, &TransferOptions::default())
            .unwrap_err();

        assert!(matches!(err, Error::InvalidImageSource { .. }));
        assert_eq!(recorder.ops().len(), connect_traffic);
    }

    #[test]
    fn successful_flash_records_the_job_and_starts_monitoring() {
        let (mut session, recorder) = connect_session(MockTransport::new());

        let source = FirmwareSource::new(EXPECTED_FIRMWARE_ASSET, vec![0xAA; 3000]);
        session
            .flash_firmware(&source, &TransferOptions::default())
            .unwrap();

        let job = session.job().unwrap();
        assert_eq!(job.status, FlashJobStatus::Success);
        assert_eq!(job.progress, 100);

        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(recorder.count_op(CommandType::FlashData), 3);
        assert!(session.log().is_monitoring());
    }

    #[test]
    fn failed_flash_freezes_progress_and_skips_monitoring() {
        let (mut session, _) = connect_session({
            let mut mock = MockTransport::new();
            mock.fail_on = Some((CommandType::FlashData as u8, 2));
            mock
        });

        let source = FirmwareSource::new(EXPECTED_FIRMWARE_ASSET, vec![0xAA; 4096]);
        session
            .flash_firmware(&source, &TransferOptions::default())
            .unwrap_err();

        let job = session.job().unwrap();
        assert_eq!(job.status, FlashJobStatus::Error);
        assert_eq!(job.progress, 25);
        assert!(job.error.is_some());
        assert!(!session.log().is_monitoring());
        assert!(session.last_error().is_some());
    }

    #[test]
    fn disconnect_is_idempotent_from_any_state() {
        let mut session = Session::new();
        // never connected
        session.disconnect();
        session.disconnect();
        assert_eq!(session.state(), SessionState::Disconnected);

        let (mut session, _) = connect_session(MockTransport::new());
        session.disconnect();
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(session.chip().is_none());
        session.disconnect();
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[test]
    fn lost_link_transitions_to_disconnected() {
        let mock = MockTransport::new();
        let link = mock.link_handle();
        let (mut session, _) = connect_session(mock);

        assert!(session.check_link());

        link.sever();
        assert!(!session.check_link());
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(session.chip().is_none());
    }

    #[test]
    fn reset_returns_to_a_clean_slate() {
        let (mut session, _) = connect_session({
            let mut mock = MockTransport::new();
            mock.fail_on = Some((CommandType::FlashData as u8, 1));
            mock
        });

        let source = FirmwareSource::new(EXPECTED_FIRMWARE_ASSET, vec![0xAA; 2048]);
        session
            .flash_firmware(&source, &TransferOptions::default())
            .unwrap_err();

        session.reset();
        session.reset();

        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(session.job().is_none());
        assert!(session.last_error().is_none());
        assert_eq!(session.log().lines().len(), 0);
    }
}
