use std::path::PathBuf;

use badgeflash::{
    cli::{self, monitor, Config, ConnectArgs, FlashConfigArgs, FlashProgress},
    flasher::{ErasePolicy, FirmwareSource, FlashSettings, TransferOptions},
    session::{Session, SessionState},
};
use clap::{Args, Parser, Subcommand};
use log::{debug, LevelFilter};
use miette::Result;

#[derive(Debug, Parser)]
#[command(about, version, propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    subcommand: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Display information about the connected badge and exit without
    /// flashing
    BoardInfo(ConnectArgs),
    /// Flash a firmware image to the badge
    Flash(FlashArgs),
    /// Open the log monitor without flashing
    Monitor(ConnectArgs),
    /// Erase the badge's entire flash
    EraseFlash(ConnectArgs),
}

#[derive(Debug, Args)]
struct FlashArgs {
    /// Firmware image to flash
    image: PathBuf,

    #[command(flatten)]
    connect_args: ConnectArgs,
    #[command(flatten)]
    flash_config_args: FlashConfigArgs,

    /// Erase the entire flash before writing, not just the written range
    #[arg(long)]
    erase_all: bool,
    /// Send the image uncompressed
    #[arg(long)]
    no_compress: bool,
    /// Verify the flash contents after writing
    #[arg(long)]
    verify: bool,
    /// Don't open the log monitor after flashing
    #[arg(long)]
    no_monitor: bool,
}

fn main() -> Result<()> {
    miette::set_panic_hook();
    cli::initialize_logger(LevelFilter::Info);

    let args = Cli::parse().subcommand;
    debug!("{:#?}", args);

    let config = Config::load()?;

    match args {
        Commands::BoardInfo(args) => board_info(args, &config),
        Commands::Flash(args) => flash(args, &config),
        Commands::Monitor(args) => serial_monitor(args, &config),
        Commands::EraseFlash(args) => erase_flash(args, &config),
    }
}

/// Connect to the badge, bailing out silently when the user dismissed the
/// port selection.
fn connect(args: &ConnectArgs, config: &Config) -> Result<Option<Session>> {
    let session = cli::connect(args, config)?;

    if session.state() == SessionState::Connected {
        Ok(Some(session))
    } else {
        Ok(None)
    }
}

fn board_info(args: ConnectArgs, config: &Config) -> Result<()> {
    let Some(mut session) = connect(&args, config)? else {
        return Ok(());
    };

    if let Some(chip) = session.chip() {
        println!("Chip type: {chip}");
    }

    session.disconnect();
    Ok(())
}

fn flash(args: FlashArgs, config: &Config) -> Result<()> {
    let Some(mut session) = connect(&args.connect_args, config)? else {
        return Ok(());
    };

    if let Some(chip) = session.chip() {
        println!("Chip type: {chip}");
    }

    let source = FirmwareSource::from_file(&args.image)?;

    let options = TransferOptions {
        erase: if args.erase_all {
            ErasePolicy::All
        } else {
            ErasePolicy::WrittenRange
        },
        compress: !args.no_compress,
        verify: args.verify,
        settings: FlashSettings::new(
            args.flash_config_args.flash_mode,
            args.flash_config_args.flash_size,
            args.flash_config_args.flash_freq,
        ),
    };

    let mut progress = FlashProgress::default();
    let result = session.flash_firmware_observed(&source, &options, Some(&mut progress));

    if let Err(e) = result {
        session.disconnect();
        return Err(e.into());
    }

    println!("Flashing has completed!");

    if args.no_monitor {
        session.stop_monitor();
    } else {
        monitor::run(&mut session)?;
    }

    session.disconnect();
    Ok(())
}

fn serial_monitor(args: ConnectArgs, config: &Config) -> Result<()> {
    let Some(mut session) = connect(&args, config)? else {
        return Ok(());
    };

    session.start_monitor()?;
    monitor::run(&mut session)?;

    session.disconnect();
    Ok(())
}

fn erase_flash(args: ConnectArgs, config: &Config) -> Result<()> {
    let Some(mut session) = connect(&args, config)? else {
        return Ok(());
    };

    let result = session.erase_flash();
    session.disconnect();
    result?;

    println!("Flash has been erased!");
    Ok(())
}
