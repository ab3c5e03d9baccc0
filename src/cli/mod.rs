//! Types and functions for the command-line interface
//!
//! The CLI wires the [Session] state machine to the terminal: port selection
//! prompts, the indicatif progress bar and the interactive monitor loop.

use std::time::Duration;

use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};
use log::LevelFilter;
use serialport::{FlowControl, SerialPortType};

use crate::{
    connection::ROM_BAUD,
    error::Error,
    flasher::{FlashFrequency, FlashMode, FlashSize, ProgressCallbacks},
    session::Session,
    transport::{SerialTransport, Transport},
};

pub use self::config::Config;

pub mod config;
pub mod monitor;
pub mod serial;

/// Link speed negotiated after sync when the user does not override it
const DEFAULT_BAUD: u32 = 460_800;

#[derive(Debug, Args)]
#[non_exhaustive]
pub struct ConnectArgs {
    /// Serial port connected to the badge
    #[arg(short = 'p', long, env = "BADGEFLASH_PORT")]
    pub port: Option<String>,
    /// Baud rate at which to communicate with the badge
    #[arg(short = 'b', long, env = "BADGEFLASH_BAUD")]
    pub baud: Option<u32>,
}

#[derive(Debug, Args)]
#[non_exhaustive]
pub struct FlashConfigArgs {
    /// Flash frequency
    #[arg(long, value_name = "FREQ")]
    pub flash_freq: Option<FlashFrequency>,
    /// Flash mode to use
    #[arg(long, value_name = "MODE")]
    pub flash_mode: Option<FlashMode>,
    /// Flash size of the connected target
    #[arg(long, value_name = "SIZE")]
    pub flash_size: Option<FlashSize>,
}

/// Initialize the logger with the given verbosity
pub fn initialize_logger(filter: LevelFilter) {
    env_logger::Builder::new()
        .format_target(false)
        .filter_level(filter)
        .parse_default_env()
        .init();
}

/// Open a serial transport for the configured or selected port.
///
/// The port opens at the ROM rate; higher speeds are negotiated after sync.
pub fn open_transport(args: &ConnectArgs, config: &Config) -> Result<Box<dyn Transport>, Error> {
    let port_info = serial::get_serial_port_info(args, config)?;

    println!("Serial port: {}", port_info.port_name);
    println!("Connecting...\n");

    let port = serialport::new(&port_info.port_name, ROM_BAUD)
        .flow_control(FlowControl::None)
        .timeout(Duration::from_secs(3))
        .open()?;

    let usb_pid = match &port_info.port_type {
        SerialPortType::UsbPort(info) => Some(info.pid),
        _ => None,
    };

    Ok(Box::new(SerialTransport::new(port, usb_pid)))
}

/// Establish a session with the badge.
///
/// A cancelled port selection returns a disconnected session; callers check
/// the session state before proceeding.
pub fn connect(args: &ConnectArgs, config: &Config) -> Result<Session, Error> {
    let mut session = Session::with_speed(Some(args.baud.unwrap_or(DEFAULT_BAUD)));
    session.connect(|| open_transport(args, config))?;

    Ok(session)
}

/// Progress bar for flashing operations
#[derive(Default)]
pub struct FlashProgress {
    pb: Option<ProgressBar>,
}

impl ProgressCallbacks for FlashProgress {
    fn init(&mut self, addr: u32, total: usize) {
        let pb = ProgressBar::new(total as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40.cyan/blue} {bytes:>9}/{total_bytes:9} {msg}")
                .unwrap()
                .progress_chars("#>-"),
        );
        pb.set_message(format!("{addr:#x}"));

        self.pb = Some(pb);
    }

    fn update(&mut self, current: usize) {
        if let Some(pb) = &self.pb {
            pb.set_position(current as u64);
        }
    }

    fn finish(&mut self) {
        if let Some(pb) = &self.pb {
            pb.finish();
        }
    }
}
