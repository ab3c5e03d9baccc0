//! A library for flashing firmware to ESP32-family badge devices over a
//! serial link, and for monitoring their log output afterwards.
//!
//! The entry point for most frontends is [Session], which owns the transport
//! and drives the whole connect → flash → monitor flow; the lower layers
//! ([Connection], [Flasher], [LogSession]) are exposed for callers that want
//! to drive the protocol directly.

pub mod chip;
#[cfg(feature = "cli")]
pub mod cli;
pub mod connection;
pub mod error;
pub mod flasher;
pub mod monitor;
pub mod session;
pub mod transport;

pub use chip::{Chip, ChipIdentity};
pub use connection::Connection;
pub use error::Error;
pub use flasher::{
    ErasePolicy, FirmwareSource, FlashFrequency, Flasher, FlashMode, FlashSettings, FlashSize,
    TransferOptions,
};
pub use monitor::{LogLine, LogSession};
pub use session::{FlashJob, FlashJobStatus, Session, SessionState};
pub use transport::{SerialTransport, Transport};
