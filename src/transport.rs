//! Serial transport abstraction
//!
//! [Transport] is the seam between the protocol layers and the physical
//! serial link: raw byte I/O plus the handful of port controls the boot ROM
//! handshake needs (baud rate, timeouts, DTR/RTS line state). The production
//! implementation is [SerialTransport], a thin wrapper around a
//! [serialport::SerialPort] handle.
//!
//! Losing the device (cable pulled, port gone) is reported through a
//! [LinkLostSubscription] rather than a callback attached to the port object:
//! the transport trips the subscription when it observes the device
//! disappear, and the session controller consumes it to drive its
//! `* -> Disconnected` transition.

use std::{
    io::{self, Read, Write},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use log::debug;
use serialport::SerialPort;

/// A half-duplex byte-stream connection to a device.
///
/// Exactly one transport is open per session; dropping it releases the port,
/// so close is implicit and idempotent.
pub trait Transport: Read + Write {
    /// Renegotiate the link speed. Must complete before any further I/O.
    fn set_baud_rate(&mut self, baud: u32) -> serialport::Result<()>;

    /// The currently configured link speed.
    fn baud_rate(&self) -> serialport::Result<u32>;

    /// Set the timeout applied to blocking reads and writes.
    fn set_timeout(&mut self, timeout: Duration) -> serialport::Result<()>;

    /// The currently configured I/O timeout.
    fn timeout(&self) -> Duration;

    /// Toggle the DTR/RTS control lines, used for device reset sequencing.
    ///
    /// Callers treat failures as non-fatal: not every adapter wires these
    /// lines up, and the device can still be reset by hand.
    fn set_line_state(&mut self, dtr: bool, rts: bool) -> serialport::Result<()>;

    /// Discard any unread input.
    fn clear_input(&mut self) -> serialport::Result<()>;

    /// USB product id of the underlying adapter, when known. Drives the
    /// choice of reset strategy.
    fn usb_pid(&self) -> Option<u16>;

    /// Subscribe to link-lost notification.
    fn subscribe_link_lost(&mut self) -> LinkLostSubscription;
}

/// Cancellable handle observing loss of the underlying device.
#[derive(Debug)]
pub struct LinkLostSubscription {
    flag: Arc<AtomicBool>,
    cancelled: bool,
}

impl LinkLostSubscription {
    pub(crate) fn new(flag: Arc<AtomicBool>) -> Self {
        LinkLostSubscription {
            flag,
            cancelled: false,
        }
    }

    /// Whether the transport has observed the device disappear.
    pub fn is_lost(&self) -> bool {
        !self.cancelled && self.flag.load(Ordering::Relaxed)
    }

    /// Stop observing; `is_lost` reports `false` from now on.
    pub fn cancel(&mut self) {
        self.cancelled = true;
    }
}

/// [Transport] implementation over a host serial port.
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
    usb_pid: Option<u16>,
    link_lost: Arc<AtomicBool>,
}

impl SerialTransport {
    pub fn new(port: Box<dyn SerialPort>, usb_pid: Option<u16>) -> Self {
        SerialTransport {
            port,
            usb_pid,
            link_lost: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Record device loss observed through an I/O error. Timeouts are
    /// expected during polling and do not count.
    fn note_io_error(&self, kind: io::ErrorKind) {
        if matches!(kind, io::ErrorKind::NotFound | io::ErrorKind::BrokenPipe) {
            debug!("Serial device lost ({kind:?})");
            self.link_lost.store(true, Ordering::Relaxed);
        }
    }

    fn note_serial_error(&self, err: &serialport::Error) {
        match err.kind() {
            serialport::ErrorKind::NoDevice => {
                debug!("Serial device lost (NoDevice)");
                self.link_lost.store(true, Ordering::Relaxed);
            }
            serialport::ErrorKind::Io(kind) => self.note_io_error(kind),
            _ => {}
        }
    }
}

impl Read for SerialTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf).inspect_err(|e| self.note_io_error(e.kind()))
    }
}

impl Write for SerialTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port.write(buf).inspect_err(|e| self.note_io_error(e.kind()))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush().inspect_err(|e| self.note_io_error(e.kind()))
    }
}

impl Transport for SerialTransport {
    fn set_baud_rate(&mut self, baud: u32) -> serialport::Result<()> {
        self.port
            .set_baud_rate(baud)
            .inspect_err(|e| self.note_serial_error(e))
    }

    fn baud_rate(&self) -> serialport::Result<u32> {
        self.port.baud_rate()
    }

    fn set_timeout(&mut self, timeout: Duration) -> serialport::Result<()> {
        self.port.set_timeout(timeout)
    }

    fn timeout(&self) -> Duration {
        self.port.timeout()
    }

    fn set_line_state(&mut self, dtr: bool, rts: bool) -> serialport::Result<()> {
        self.port
            .write_data_terminal_ready(dtr)
            .and_then(|_| self.port.write_request_to_send(rts))
            .inspect_err(|e| self.note_serial_error(e))
    }

    fn clear_input(&mut self) -> serialport::Result<()> {
        self.port.clear(serialport::ClearBuffer::Input)
    }

    fn usb_pid(&self) -> Option<u16> {
        self.usb_pid
    }

    fn subscribe_link_lost(&mut self) -> LinkLostSubscription {
        LinkLostSubscription::new(Arc::clone(&self.link_lost))
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! Scripted in-memory transport used by the protocol and session tests.

    use std::{
        collections::VecDeque,
        sync::{atomic::AtomicUsize, Mutex},
    };

    use super::*;
    use crate::connection::command::CommandType;

    const SLIP_END: u8 = 0xC0;
    const SLIP_ESC: u8 = 0xDB;
    const SLIP_ESC_END: u8 = 0xDC;
    const SLIP_ESC_ESC: u8 = 0xDD;

    /// Severs a mock's link from the outside, simulating device removal.
    pub struct LinkHandle(Arc<AtomicBool>);

    impl LinkHandle {
        pub fn sever(&self) {
            self.0.store(true, Ordering::Relaxed);
        }
    }

    /// How the mock answers `Sync` probes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum SyncBehaviour {
        /// Acknowledge every probe.
        Always,
        /// Never acknowledge; every probe times out.
        Never,
        /// Acknowledge the n-th probe only (1-based).
        OnProbe(usize),
    }

    /// Shared view of everything a [MockTransport] has observed; stays usable
    /// after the transport itself is boxed up and handed to a connection.
    #[derive(Clone, Default)]
    pub struct Recorder {
        frames: Arc<Mutex<Vec<Vec<u8>>>>,
        line_state_calls: Arc<AtomicUsize>,
    }

    impl Recorder {
        fn record(&self, frame: Vec<u8>) {
            self.frames.lock().unwrap().push(frame);
        }

        /// Number of frames carrying the given opcode.
        pub fn count_op(&self, op: CommandType) -> usize {
            self.count_op_raw(op as u8)
        }

        fn count_op_raw(&self, op: u8) -> usize {
            self.frames
                .lock()
                .unwrap()
                .iter()
                .filter(|f| f.get(1) == Some(&op))
                .count()
        }

        /// Opcodes in arrival order.
        pub fn ops(&self) -> Vec<u8> {
            self.frames
                .lock()
                .unwrap()
                .iter()
                .filter_map(|f| f.get(1).copied())
                .collect()
        }

        /// Sequence numbers of all `FlashData` frames, in arrival order.
        pub fn data_sequences(&self) -> Vec<u32> {
            self.frames
                .lock()
                .unwrap()
                .iter()
                .filter(|f| f.get(1) == Some(&(CommandType::FlashData as u8)))
                .map(|f| u32::from_le_bytes([f[12], f[13], f[14], f[15]]))
                .collect()
        }

        /// Whether any wire traffic was observed at all.
        pub fn is_empty(&self) -> bool {
            self.frames.lock().unwrap().is_empty()
        }

        /// All frames carrying the given opcode, in arrival order.
        pub fn frames_with_op(&self, op: CommandType) -> Vec<Vec<u8>> {
            self.frames
                .lock()
                .unwrap()
                .iter()
                .filter(|f| f.get(1) == Some(&(op as u8)))
                .cloned()
                .collect()
        }

        pub fn line_state_calls(&self) -> usize {
            self.line_state_calls.load(Ordering::Relaxed)
        }
    }

    pub struct MockTransport {
        /// Queued response chunks, served one per read call.
        reads: VecDeque<Vec<u8>>,
        /// Raw bytes received, frames not yet terminated.
        pending: Vec<u8>,
        in_frame: bool,
        escaped: bool,
        recorder: Recorder,
        pub sync: SyncBehaviour,
        /// Value served for `ReadReg` commands (the chip-detect magic).
        pub read_reg_value: u32,
        /// Fail the n-th occurrence (1-based) of the given opcode with a ROM
        /// error status instead of an ack.
        pub fail_on: Option<(u8, usize)>,
        /// Digest served for `FlashMd5` commands.
        pub md5_response: Option<u128>,
        /// When set, `set_line_state` fails.
        pub fail_line_state: bool,
        timeout: Duration,
        baud: u32,
        link_lost: Arc<AtomicBool>,
    }

    impl MockTransport {
        pub fn new() -> Self {
            MockTransport {
                reads: VecDeque::new(),
                pending: Vec::new(),
                in_frame: false,
                escaped: false,
                recorder: Recorder::default(),
                sync: SyncBehaviour::Always,
                read_reg_value: 0x1b31_506f,
                fail_on: None,
                md5_response: None,
                fail_line_state: false,
                timeout: Duration::from_secs(3),
                baud: 115_200,
                link_lost: Arc::new(AtomicBool::new(false)),
            }
        }

        /// Shared handle to the recorded traffic.
        pub fn recorder(&self) -> Recorder {
            self.recorder.clone()
        }

        /// Queue a raw chunk to be served by the next read call.
        pub fn push_read(&mut self, chunk: Vec<u8>) {
            self.reads.push_back(chunk);
        }

        /// Handle that can sever the link after the transport is boxed up.
        pub fn link_handle(&self) -> LinkHandle {
            LinkHandle(Arc::clone(&self.link_lost))
        }

        fn slip_encode(body: &[u8]) -> Vec<u8> {
            let mut out = vec![SLIP_END];
            for &byte in body {
                match byte {
                    SLIP_END => out.extend_from_slice(&[SLIP_ESC, SLIP_ESC_END]),
                    SLIP_ESC => out.extend_from_slice(&[SLIP_ESC, SLIP_ESC_ESC]),
                    _ => out.push(byte),
                }
            }
            out.push(SLIP_END);
            out
        }

        /// Standard 12-byte ROM response: header, 4-byte value, 4 status
        /// bytes with the error code first.
        fn response(op: u8, value: u32, error: u8) -> Vec<u8> {
            let mut body = vec![0x01, op, 0x04, 0x00];
            body.extend_from_slice(&value.to_le_bytes());
            body.extend_from_slice(&[error, if error == 0 { 0 } else { 1 }, 0, 0]);
            Self::slip_encode(&body)
        }

        /// 44-byte ROM-loader MD5 response with the digest as ASCII hex.
        fn md5_rom_response(digest: u128) -> Vec<u8> {
            let mut body = vec![0x01, CommandType::FlashMd5 as u8, 0x24, 0x00];
            body.extend_from_slice(&0u32.to_le_bytes());
            body.extend_from_slice(format!("{digest:032x}").as_bytes());
            body.extend_from_slice(&[0, 0, 0, 0]);
            Self::slip_encode(&body)
        }

        fn respond_to(&mut self, frame: &[u8]) {
            let Some(&op) = frame.get(1) else { return };

            if let Some((fail_op, nth)) = self.fail_on {
                if op == fail_op {
                    let seen = self.recorder.count_op_raw(fail_op);
                    if seen + 1 == nth {
                        // FlashWriteError status byte
                        let resp = Self::response(op, 0, 0x08);
                        self.reads.push_back(resp);
                        return;
                    }
                }
            }

            let resp = match op {
                op if op == CommandType::Sync as u8 => {
                    let probes = self.recorder.count_op(CommandType::Sync) + 1;
                    match self.sync {
                        SyncBehaviour::Always => Some(Self::response(op, 0, 0)),
                        SyncBehaviour::Never => None,
                        SyncBehaviour::OnProbe(n) => {
                            (probes == n).then(|| Self::response(op, 0, 0))
                        }
                    }
                }
                op if op == CommandType::ReadReg as u8 => {
                    Some(Self::response(op, self.read_reg_value, 0))
                }
                op if op == CommandType::FlashMd5 as u8 => {
                    self.md5_response.map(Self::md5_rom_response)
                }
                _ => Some(Self::response(op, 0, 0)),
            };

            if let Some(resp) = resp {
                self.reads.push_back(resp);
            }
        }

        fn feed(&mut self, bytes: &[u8]) {
            for &byte in bytes {
                if self.escaped {
                    let decoded = match byte {
                        SLIP_ESC_END => SLIP_END,
                        SLIP_ESC_ESC => SLIP_ESC,
                        other => other,
                    };
                    self.pending.push(decoded);
                    self.escaped = false;
                } else if byte == SLIP_ESC {
                    self.escaped = true;
                } else if byte == SLIP_END {
                    if self.in_frame && !self.pending.is_empty() {
                        let frame = std::mem::take(&mut self.pending);
                        self.respond_to(&frame);
                        self.recorder.record(frame);
                        self.in_frame = false;
                    } else {
                        self.in_frame = true;
                    }
                } else if self.in_frame {
                    self.pending.push(byte);
                }
            }
        }
    }

    impl Read for MockTransport {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.reads.pop_front() {
                Some(chunk) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    if n < chunk.len() {
                        let rest = chunk[n..].to_vec();
                        self.reads.push_front(rest);
                    }
                    Ok(n)
                }
                None => Err(io::Error::new(io::ErrorKind::TimedOut, "no scripted data")),
            }
        }
    }

    impl Write for MockTransport {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.feed(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Transport for MockTransport {
        fn set_baud_rate(&mut self, baud: u32) -> serialport::Result<()> {
            self.baud = baud;
            Ok(())
        }

        fn baud_rate(&self) -> serialport::Result<u32> {
            Ok(self.baud)
        }

        fn set_timeout(&mut self, timeout: Duration) -> serialport::Result<()> {
            self.timeout = timeout;
            Ok(())
        }

        fn timeout(&self) -> Duration {
            self.timeout
        }

        fn set_line_state(&mut self, _dtr: bool, _rts: bool) -> serialport::Result<()> {
            self.recorder
                .line_state_calls
                .fetch_add(1, Ordering::Relaxed);
            if self.fail_line_state {
                Err(serialport::Error::new(
                    serialport::ErrorKind::Unknown,
                    "line control not supported",
                ))
            } else {
                Ok(())
            }
        }

        fn clear_input(&mut self) -> serialport::Result<()> {
            self.reads.clear();
            Ok(())
        }

        fn usb_pid(&self) -> Option<u16> {
            None
        }

        fn subscribe_link_lost(&mut self) -> LinkLostSubscription {
            LinkLostSubscription::new(Arc::clone(&self.link_lost))
        }
    }

    #[test]
    fn link_lost_subscription_trips_and_cancels() {
        let mut mock = MockTransport::new();
        let mut sub = mock.subscribe_link_lost();
        assert!(!sub.is_lost());

        mock.link_handle().sever();
        assert!(sub.is_lost());

        sub.cancel();
        assert!(!sub.is_lost());
    }
}
