//! Establish a connection with a target device
//!
//! The [Connection] struct owns the transport for the lifetime of a session
//! and implements the boot-ROM side of bring-up: reset into download mode,
//! bounded sync probing, chip identification and link-speed negotiation, plus
//! the SLIP-framed command/response plumbing every higher layer is built on.

use std::{
    io::{BufWriter, Write},
    thread::sleep,
    time::Duration,
};

use log::{debug, warn};
use slip_codec::SlipDecoder;

use self::{
    command::{Command, CommandType},
    encoder::SlipEncoder,
    reset::strategy_for,
};
use crate::{
    chip::{Chip, ChipIdentity},
    error::{ConnectionError, Error, ResultExt, RomError, RomErrorKind},
    transport::Transport,
};

pub mod command;
pub mod reset;

/// Baud rate the boot ROM listens at after reset
pub const ROM_BAUD: u32 = 115_200;

/// Number of sync probes sent before giving up on a device
const MAX_SYNC_PROBES: usize = 7;
/// Pause between successive sync probes
const SYNC_PROBE_DELAY: Duration = Duration::from_millis(50);

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// Register exposing the chip-detect magic value
const CHIP_DETECT_MAGIC_REG_ADDR: u32 = 0x4000_1000;

/// Bring-up progress of the boot-ROM client. Any communication error drops
/// the client back to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    Syncing,
    Identified,
    Ready,
}

#[derive(Debug, Copy, Clone)]
pub enum CommandResponseValue {
    ValueU32(u32),
    ValueU128(u128),
}

impl TryInto<u32> for CommandResponseValue {
    type Error = crate::error::Error;

    fn try_into(self) -> Result<u32, Self::Error> {
        match self {
            CommandResponseValue::ValueU32(value) => Ok(value),
            CommandResponseValue::ValueU128(_) => Err(crate::error::Error::InternalError),
        }
    }
}

impl TryInto<u128> for CommandResponseValue {
    type Error = crate::error::Error;

    fn try_into(self) -> Result<u128, Self::Error> {
        match self {
            CommandResponseValue::ValueU32(_) => Err(crate::error::Error::InternalError),
            CommandResponseValue::ValueU128(value) => Ok(value),
        }
    }
}

/// A response from a target device following a command
#[derive(Debug, Copy, Clone)]
pub struct CommandResponse {
    pub resp: u8,
    pub return_op: u8,
    pub return_length: u16,
    pub value: CommandResponseValue,
    pub error: u8,
    pub status: u8,
}

/// An established connection with a target device
pub struct Connection {
    transport: Box<dyn Transport>,
    decoder: SlipDecoder,
    stage: Stage,
}

impl Connection {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Connection {
            transport,
            decoder: SlipDecoder::new(),
            stage: Stage::Idle,
        }
    }

    /// Synchronize with the device's boot ROM.
    ///
    /// Resets the device into download mode, then sends up to
    /// [MAX_SYNC_PROBES] sync probes with a short pause in between. The first
    /// acknowledged probe wins; exhausting the budget fails the connection.
    pub fn begin(&mut self) -> Result<(), Error> {
        self.stage = Stage::Syncing;

        // A missing or unwired control line is not fatal: the user can hold
        // the boot button instead.
        let reset_strategy = strategy_for(self.transport.usb_pid());
        if let Err(e) = reset_strategy.reset(self.transport.as_mut()) {
            warn!("Failed to reset device into download mode: {e:#}");
        }

        for probe in 1..=MAX_SYNC_PROBES {
            self.flush().ok();

            match self.sync() {
                Ok(()) => {
                    debug!("Device synced on probe {probe}");
                    // a failed earlier probe dropped the stage back to idle
                    self.stage = Stage::Syncing;
                    self.set_timeout(DEFAULT_TIMEOUT)?;
                    return Ok(());
                }
                Err(e) => debug!("Sync probe {probe} failed: {e:?}"),
            }

            sleep(SYNC_PROBE_DELAY);
        }

        self.stage = Stage::Idle;
        Err(Error::Connection(ConnectionError::ConnectionFailed))
    }

    /// Send a single sync probe
    fn sync(&mut self) -> Result<(), Error> {
        self.with_timeout(CommandType::Sync.timeout(), |connection| {
            connection.command(Command::Sync)?;
            Ok(())
        })?;

        // The ROM queues several replies to one sync probe; drop the extras
        sleep(Duration::from_millis(10));
        self.transport.clear_input().map_err(Error::from)?;

        Ok(())
    }

    /// Read the chip-detect magic register and map it to a chip identity.
    ///
    /// An unrecognized magic value downgrades to a generic identity rather
    /// than failing the connection.
    pub fn detect_chip(&mut self) -> Result<ChipIdentity, Error> {
        let magic = match self.read_reg(CHIP_DETECT_MAGIC_REG_ADDR) {
            Ok(magic) => magic,
            Err(e) => {
                self.stage = Stage::Idle;
                return Err(e);
            }
        };

        let identity = match Chip::from_magic(magic) {
            Ok(chip) => ChipIdentity::Known(chip),
            Err(_) => {
                warn!("Unrecognized chip magic value {magic:#010x}, continuing with a generic identity");
                ChipIdentity::Unknown(magic)
            }
        };

        debug!("Detected chip: {identity}");
        self.stage = Stage::Identified;

        Ok(identity)
    }

    /// Try to raise the link speed above the ROM default.
    ///
    /// Speed is a throughput optimization only; any failure leaves the link
    /// at the safe rate and is not surfaced to the caller.
    pub fn negotiate_baud(&mut self, target: u32) {
        if target > ROM_BAUD {
            let result = self.with_timeout(CommandType::ChangeBaud.timeout(), |connection| {
                connection.command(Command::ChangeBaud {
                    new_baud: target,
                    // '0' tells the ROM flasher to not assume the prior rate
                    prior_baud: 0,
                })
            });

            match result {
                Ok(_) => match self.transport.set_baud_rate(target) {
                    Ok(()) => {
                        sleep(Duration::from_millis(50));
                        self.transport.clear_input().ok();
                        debug!("Negotiated link speed of {target} baud");
                    }
                    Err(e) => warn!("Failed to raise host baud rate: {e:#}"),
                },
                Err(e) => warn!("Baud rate negotiation failed, staying at {ROM_BAUD}: {e:#}"),
            }
        }

        self.stage = Stage::Ready;
    }

    /// Current bring-up stage
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Set timeout for the underlying transport
    pub fn set_timeout(&mut self, timeout: Duration) -> Result<(), Error> {
        self.transport.set_timeout(timeout)?;
        Ok(())
    }

    /// Run a command with a command-specific timeout
    pub fn with_timeout<T, F>(&mut self, timeout: Duration, mut f: F) -> Result<T, Error>
    where
        F: FnMut(&mut Connection) -> Result<T, Error>,
    {
        let old_timeout = self.transport.timeout();
        self.transport.set_timeout(timeout)?;

        let result = f(self);

        self.transport.set_timeout(old_timeout)?;

        result
    }

    /// Read the response from the transport
    pub fn read_response(&mut self) -> Result<Option<CommandResponse>, Error> {
        match self.read(10)? {
            None => Ok(None),
            Some(response) => {
                // The response tail carries two status bytes when talking to a
                // stub loader and four when talking to ROM code; the MD5
                // responses (44 bytes for ROM, 26 for a stub) are the odd ones
                // out, carrying the digest as hex text or raw bytes.
                let status_len = if response.len() == 10 || response.len() == 26 {
                    2
                } else {
                    4
                };

                let value = match response.len() {
                    10 | 12 => CommandResponseValue::ValueU32(u32::from_le_bytes(
                        response[4..][..4]
                            .try_into()
                            .map_err(|_| Error::InternalError)?,
                    )),
                    44 => {
                        let digest = std::str::from_utf8(&response[8..][..32])
                            .map_err(|_| Error::InternalError)?;
                        CommandResponseValue::ValueU128(
                            u128::from_str_radix(digest, 16).map_err(|_| Error::InternalError)?,
                        )
                    }
                    26 => CommandResponseValue::ValueU128(u128::from_be_bytes(
                        response[8..][..16]
                            .try_into()
                            .map_err(|_| Error::InternalError)?,
                    )),
                    _ => {
                        return Err(Error::InternalError);
                    }
                };

                let header = CommandResponse {
                    resp: response[0],
                    return_op: response[1],
                    return_length: u16::from_le_bytes(
                        response[2..][..2]
                            .try_into()
                            .map_err(|_| Error::InternalError)?,
                    ),
                    value,
                    error: response[response.len() - status_len],
                    status: response[response.len() - status_len + 1],
                };

                Ok(Some(header))
            }
        }
    }

    /// Write a command to the transport
    pub fn write_command(&mut self, command: Command<'_>) -> Result<(), Error> {
        debug!("Writing command: {:?}", command.command_type());

        self.transport.clear_input()?;
        let mut writer = BufWriter::new(&mut self.transport);
        let mut encoder = SlipEncoder::new(&mut writer)?;
        command.write(&mut encoder)?;
        encoder.finish()?;
        writer.flush()?;

        Ok(())
    }

    /// Write a command and read the response
    pub fn command(&mut self, command: Command<'_>) -> Result<CommandResponseValue, Error> {
        let ty = command.command_type();

        let result = self.command_inner(command, ty);
        if result.is_err() {
            self.stage = Stage::Idle;
        }

        result
    }

    fn command_inner(
        &mut self,
        command: Command<'_>,
        ty: CommandType,
    ) -> Result<CommandResponseValue, Error> {
        self.write_command(command).for_command(ty)?;

        for _ in 0..100 {
            match self.read_response().for_command(ty)? {
                Some(response) if response.return_op == ty as u8 => {
                    return if response.error != 0 {
                        let _ = self.flush();
                        Err(Error::RomError(RomError::new(
                            ty,
                            RomErrorKind::from(response.error),
                        )))
                    } else {
                        Ok(response.value)
                    };
                }
                _ => {
                    continue;
                }
            }
        }

        Err(Error::Connection(ConnectionError::ConnectionFailed))
    }

    /// Read a register
    pub fn read_reg(&mut self, reg: u32) -> Result<u32, Error> {
        self.with_timeout(CommandType::ReadReg.timeout(), |connection| {
            connection.command(Command::ReadReg { address: reg })?.try_into()
        })
    }

    /// Write a register
    pub fn write_reg(&mut self, addr: u32, value: u32, mask: Option<u32>) -> Result<(), Error> {
        self.with_timeout(CommandType::WriteReg.timeout(), |connection| {
            connection.command(Command::WriteReg {
                address: addr,
                value,
                mask,
            })
        })?;

        Ok(())
    }

    pub(crate) fn read(&mut self, len: usize) -> Result<Option<Vec<u8>>, Error> {
        let mut tmp = Vec::with_capacity(1024);
        loop {
            self.decoder.decode(&mut self.transport, &mut tmp)?;
            if tmp.len() >= len {
                return Ok(Some(tmp));
            }
        }
    }

    /// Flush the transport
    pub fn flush(&mut self) -> Result<(), Error> {
        self.transport.flush()?;
        Ok(())
    }

    /// Borrow the underlying transport, e.g. for lending it to the log
    /// monitor
    pub fn transport_mut(&mut self) -> &mut dyn Transport {
        self.transport.as_mut()
    }

    /// Give up the transport
    pub fn into_transport(self) -> Box<dyn Transport> {
        self.transport
    }
}

mod encoder {
    use std::io::Write;

    const END: u8 = 0xC0;
    const ESC: u8 = 0xDB;
    const ESC_END: u8 = 0xDC;
    const ESC_ESC: u8 = 0xDD;

    pub struct SlipEncoder<'a, W: Write> {
        writer: &'a mut W,
        len: usize,
    }

    impl<'a, W: Write> SlipEncoder<'a, W> {
        /// Creates a new encoder context
        pub fn new(writer: &'a mut W) -> std::io::Result<Self> {
            let len = writer.write(&[END])?;
            Ok(Self { writer, len })
        }

        pub fn finish(mut self) -> std::io::Result<usize> {
            self.len += self.writer.write(&[END])?;
            Ok(self.len)
        }
    }

    impl<W: Write> Write for SlipEncoder<'_, W> {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            for value in buf.iter() {
                match *value {
                    END => {
                        self.len += self.writer.write(&[ESC, ESC_END])?;
                    }
                    ESC => {
                        self.len += self.writer.write(&[ESC, ESC_ESC])?;
                    }
                    _ => {
                        self.len += self.writer.write(&[*value])?;
                    }
                }
            }

            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            self.writer.flush()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{MockTransport, SyncBehaviour};

    fn connection(mock: MockTransport) -> Connection {
        Connection::new(Box::new(mock))
    }

    #[test]
    fn sync_stops_probing_after_first_response() {
        let mut mock = MockTransport::new();
        mock.sync = SyncBehaviour::OnProbe(3);
        let recorder = mock.recorder();

        let mut conn = connection(mock);
        conn.begin().unwrap();

        assert_eq!(recorder.count_op(CommandType::Sync), 3);
    }

    #[test]
    fn sync_gives_up_after_probe_budget() {
        let mut mock = MockTransport::new();
        mock.sync = SyncBehaviour::Never;
        let recorder = mock.recorder();

        let mut conn = connection(mock);
        let err = conn.begin().unwrap_err();

        assert!(matches!(
            err,
            Error::Connection(ConnectionError::ConnectionFailed)
        ));
        assert_eq!(conn.stage(), Stage::Idle);
        assert_eq!(recorder.count_op(CommandType::Sync), 7);
    }

    #[test]
    fn detects_chip_from_magic_register() {
        let mut mock = MockTransport::new();
        mock.read_reg_value = 0x1b31_506f;

        let mut conn = connection(mock);
        conn.begin().unwrap();
        let identity = conn.detect_chip().unwrap();

        assert_eq!(identity, ChipIdentity::Known(Chip::Esp32c3));
        assert_eq!(conn.stage(), Stage::Identified);
    }

    #[test]
    fn unknown_magic_downgrades_to_generic_identity() {
        let mut mock = MockTransport::new();
        mock.read_reg_value = 0xdead_beef;

        let mut conn = connection(mock);
        conn.begin().unwrap();
        let identity = conn.detect_chip().unwrap();

        assert_eq!(identity, ChipIdentity::Unknown(0xdead_beef));
    }

    #[test]
    fn baud_negotiation_raises_link_speed() {
        let mut conn = connection(MockTransport::new());
        conn.begin().unwrap();
        conn.detect_chip().unwrap();
        conn.negotiate_baud(460_800);

        assert_eq!(conn.stage(), Stage::Ready);
        assert_eq!(conn.transport_mut().baud_rate().unwrap(), 460_800);
    }

    #[test]
    fn baud_negotiation_is_skipped_at_or_below_rom_rate() {
        let mut conn = connection(MockTransport::new());
        conn.begin().unwrap();
        conn.negotiate_baud(ROM_BAUD);

        assert_eq!(conn.stage(), Stage::Ready);
        assert_eq!(conn.transport_mut().baud_rate().unwrap(), ROM_BAUD);
    }
}
