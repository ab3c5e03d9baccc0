//! Write a firmware image to a target device
//!
//! The [Flasher] struct borrows an established [Connection] for the duration
//! of one transfer and moves a firmware image into flash: erase according to
//! the requested policy, stream the image in fixed-maximum-size frames in
//! strictly increasing address order with every frame acknowledged before the
//! next is sent, and report progress after each acknowledgment. An aborted
//! transfer leaves the flash contents undefined; retries start over from a
//! full erase.

use std::{borrow::Cow, io::Write, path::Path};

use flate2::{
    write::{ZlibDecoder, ZlibEncoder},
    Compression,
};
use log::{debug, info};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, VariantNames};

use crate::{
    chip::ChipIdentity,
    connection::{
        command::{Command, CommandType, SpiAttachParams, SpiSetParams},
        Connection,
    },
    error::{Error, ResultExt},
};

/// Maximum number of image bytes carried by one flash-data frame
pub const FLASH_WRITE_SIZE: usize = 0x400;
/// Size of one erasable flash sector
pub const FLASH_SECTOR_SIZE: usize = 0x1000;

/// Offset at which the badge application image is written
pub const APP_FLASH_OFFSET: u32 = 0x0;

/// Canonical name of the firmware asset accepted for flashing
pub const EXPECTED_FIRMWARE_ASSET: &str = "badge.bin";

/// First byte of a bootable application image header
const IMAGE_MAGIC: u8 = 0xE9;

/// Supported flash sizes
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq, Display, VariantNames, EnumIter, Serialize,
    Deserialize,
)]
#[non_exhaustive]
#[repr(u8)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum FlashSize {
    /// 1 MB
    #[serde(rename = "1MB")]
    _1Mb,
    /// 2 MB
    #[serde(rename = "2MB")]
    _2Mb,
    /// 4 MB
    #[default]
    #[serde(rename = "4MB")]
    _4Mb,
    /// 8 MB
    #[serde(rename = "8MB")]
    _8Mb,
    /// 16 MB
    #[serde(rename = "16MB")]
    _16Mb,
}

impl FlashSize {
    /// Encodes flash size into the image-header format used by the bootloader
    pub const fn encode(self) -> u8 {
        match self {
            FlashSize::_1Mb => 0,
            FlashSize::_2Mb => 1,
            FlashSize::_4Mb => 2,
            FlashSize::_8Mb => 3,
            FlashSize::_16Mb => 4,
        }
    }

    /// Returns the flash size in bytes
    pub const fn size(self) -> u32 {
        match self {
            FlashSize::_1Mb => 0x0100000,
            FlashSize::_2Mb => 0x0200000,
            FlashSize::_4Mb => 0x0400000,
            FlashSize::_8Mb => 0x0800000,
            FlashSize::_16Mb => 0x1000000,
        }
    }
}

/// Supported flash modes
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[derive(Copy, Clone, Debug, Default, VariantNames, Display, Serialize, Deserialize)]
#[non_exhaustive]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum FlashMode {
    /// Quad I/O (4 pins used for address & data)
    Qio,
    /// Quad Output (4 pins used for data)
    Qout,
    /// Dual I/O (2 pins used for address & data)
    #[default]
    Dio,
    /// Dual Output (2 pins used for data)
    Dout,
}

impl FlashMode {
    pub const fn encode(self) -> u8 {
        match self {
            FlashMode::Qio => 0,
            FlashMode::Qout => 1,
            FlashMode::Dio => 2,
            FlashMode::Dout => 3,
        }
    }
}

/// Supported flash frequencies
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[derive(Copy, Clone, Debug, Default, VariantNames, Display, Serialize, Deserialize)]
#[non_exhaustive]
pub enum FlashFrequency {
    /// 20 MHz
    #[serde(rename = "20MHz")]
    _20Mhz,
    /// 26 MHz
    #[serde(rename = "26MHz")]
    _26Mhz,
    /// 40 MHz
    #[default]
    #[serde(rename = "40MHz")]
    _40Mhz,
    /// 80 MHz
    #[serde(rename = "80MHz")]
    _80Mhz,
}

impl FlashFrequency {
    pub const fn encode(self) -> u8 {
        match self {
            FlashFrequency::_20Mhz => 0x2,
            FlashFrequency::_26Mhz => 0x1,
            FlashFrequency::_40Mhz => 0x0,
            FlashFrequency::_80Mhz => 0xf,
        }
    }
}

/// Flash geometry hints applied when flashing a device.
///
/// A `None` field keeps whatever the image header already carries.
#[derive(Copy, Clone, Debug, Serialize, Deserialize, Default)]
#[non_exhaustive]
pub struct FlashSettings {
    pub mode: Option<FlashMode>,
    pub size: Option<FlashSize>,
    #[serde(rename = "frequency")]
    pub freq: Option<FlashFrequency>,
}

impl FlashSettings {
    pub fn new(
        mode: Option<FlashMode>,
        size: Option<FlashSize>,
        freq: Option<FlashFrequency>,
    ) -> Self {
        FlashSettings { mode, size, freq }
    }
}

/// Which part of the flash is erased before writing
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ErasePolicy {
    /// Erase the entire addressable flash region before the first frame
    All,
    /// Erase only the span the new image occupies
    #[default]
    WrittenRange,
}

/// Options for one transfer
#[derive(Copy, Clone, Debug, Default)]
pub struct TransferOptions {
    pub erase: ErasePolicy,
    pub compress: bool,
    pub verify: bool,
    pub settings: FlashSettings,
}

/// A firmware image together with the name of the release asset it was
/// resolved from.
///
/// How the bytes are obtained is the caller's business; the engine only
/// requires the descriptor to name the canonical badge asset, guarding
/// against flashing an unrelated download.
#[derive(Debug, Clone)]
pub struct FirmwareSource {
    pub asset_name: String,
    pub data: Vec<u8>,
}

impl FirmwareSource {
    pub fn new(asset_name: impl Into<String>, data: Vec<u8>) -> Self {
        FirmwareSource {
            asset_name: asset_name.into(),
            data,
        }
    }

    /// Read a firmware image from disk, taking the file name as the asset
    /// name.
    pub fn from_file(path: &Path) -> Result<Self, Error> {
        let data = std::fs::read(path)
            .map_err(|e| Error::FileOpenError(path.display().to_string(), e))?;
        let asset_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        Ok(FirmwareSource { asset_name, data })
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.asset_name == EXPECTED_FIRMWARE_ASSET {
            Ok(())
        } else {
            Err(Error::InvalidImageSource {
                name: self.asset_name.clone(),
                expected: EXPECTED_FIRMWARE_ASSET,
            })
        }
    }
}

/// Progress update callbacks
pub trait ProgressCallbacks {
    /// Initialize some progress report
    fn init(&mut self, addr: u32, total: usize);
    /// Update some progress report with the cumulative bytes written
    fn update(&mut self, current: usize);
    /// Finish some progress report
    fn finish(&mut self);
}

/// Writes firmware images over an established connection.
///
/// The connection is borrowed for exactly one operation; the session
/// controller hands it out and takes it back.
pub struct Flasher<'c> {
    connection: &'c mut Connection,
    chip: ChipIdentity,
}

impl<'c> Flasher<'c> {
    pub fn new(connection: &'c mut Connection, chip: ChipIdentity) -> Self {
        Flasher { connection, chip }
    }

    /// Transfer a firmware image to the given flash address.
    ///
    /// Frames are sent strictly in increasing address order and each one is
    /// acknowledged before the next goes out. Any failure aborts the whole
    /// transfer; the flash contents are undefined afterwards and a retry must
    /// start from scratch.
    pub fn transfer(
        &mut self,
        source: &FirmwareSource,
        address: u32,
        options: &TransferOptions,
        progress: &mut Option<&mut dyn ProgressCallbacks>,
    ) -> Result<(), Error> {
        source.validate()?;

        let image = apply_flash_settings(&source.data, &options.settings);

        self.attach(&options.settings)?;

        if options.erase == ErasePolicy::All {
            info!("Erasing flash (this may take a while)");
            self.connection
                .with_timeout(CommandType::EraseFlash.timeout(), |connection| {
                    connection.command(Command::EraseFlash)
                })
                .flashing()?;
        }

        if options.compress {
            self.write_compressed(&image, address, progress)?;
        } else {
            self.write_plain(&image, address, progress)?;
        }

        if options.verify {
            self.verify_md5(&image, address)?;
        }

        Ok(())
    }

    /// Erase the entire flash without writing anything
    pub fn erase_flash(&mut self) -> Result<(), Error> {
        self.attach(&FlashSettings::default())?;

        info!("Erasing flash (this may take a while)");
        self.connection
            .with_timeout(CommandType::EraseFlash.timeout(), |connection| {
                connection.command(Command::EraseFlash)
            })
            .flashing()?;

        Ok(())
    }

    /// Attach to the device's SPI flash and, when a size hint was given,
    /// declare its geometry.
    fn attach(&mut self, settings: &FlashSettings) -> Result<(), Error> {
        self.connection
            .with_timeout(CommandType::SpiAttach.timeout(), |connection| {
                connection.command(Command::SpiAttach {
                    spi_params: SpiAttachParams::default(),
                })
            })
            .flashing()?;

        if let Some(size) = settings.size {
            let spi_params = SpiSetParams::default(size.size());
            self.connection
                .with_timeout(CommandType::SpiSetParams.timeout(), |connection| {
                    connection.command(Command::SpiSetParams { spi_params })
                })
                .flashing()?;
        }

        Ok(())
    }

    fn write_plain(
        &mut self,
        image: &[u8],
        address: u32,
        progress: &mut Option<&mut dyn ProgressCallbacks>,
    ) -> Result<(), Error> {
        let total = image.len();
        let block_count = total.div_ceil(FLASH_WRITE_SIZE);
        let supports_encryption = self.chip.supports_encryption();

        debug!("Writing {total} bytes in {block_count} frames at {address:#x}");

        self.connection
            .with_timeout(
                CommandType::FlashBegin.timeout_for_size(total as u32),
                |connection| {
                    connection.command(Command::FlashBegin {
                        size: total as u32,
                        blocks: block_count as u32,
                        block_size: FLASH_WRITE_SIZE as u32,
                        offset: address,
                        supports_encryption,
                    })
                },
            )
            .flashing()?;

        if let Some(cb) = progress.as_mut() {
            cb.init(address, total)
        }

        let mut written = 0;
        for (i, block) in image.chunks(FLASH_WRITE_SIZE).enumerate() {
            self.connection
                .with_timeout(
                    CommandType::FlashData.timeout_for_size(block.len() as u32),
                    |connection| {
                        connection.command(Command::FlashData {
                            data: block,
                            pad_to: FLASH_WRITE_SIZE,
                            pad_byte: 0xff,
                            sequence: i as u32,
                        })
                    },
                )
                .flashing()?;

            written += block.len();
            if let Some(cb) = progress.as_mut() {
                cb.update(written)
            }
        }

        self.connection
            .with_timeout(CommandType::FlashEnd.timeout(), |connection| {
                connection.command(Command::FlashEnd { reboot: false })
            })
            .flashing()?;

        if let Some(cb) = progress.as_mut() {
            cb.finish()
        }

        Ok(())
    }

    fn write_compressed(
        &mut self,
        image: &[u8],
        address: u32,
        progress: &mut Option<&mut dyn ProgressCallbacks>,
    ) -> Result<(), Error> {
        let total = image.len();
        let supports_encryption = self.chip.supports_encryption();

        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
        encoder.write_all(image)?;
        let compressed = encoder.finish()?;

        let block_count = compressed.len().div_ceil(FLASH_WRITE_SIZE);
        // the device erases the uncompressed span, rounded up to sector size
        let erase_count = total.div_ceil(FLASH_SECTOR_SIZE);
        let erase_size = (erase_count * FLASH_SECTOR_SIZE) as u32;

        debug!(
            "Writing {} compressed bytes ({total} uncompressed) in {block_count} frames at {address:#x}",
            compressed.len()
        );

        self.connection
            .with_timeout(
                CommandType::FlashDeflateBegin.timeout_for_size(erase_size),
                |connection| {
                    connection.command(Command::FlashDeflateBegin {
                        size: total as u32,
                        blocks: block_count as u32,
                        block_size: FLASH_WRITE_SIZE as u32,
                        offset: address,
                        supports_encryption,
                    })
                },
            )
            .flashing()?;

        if let Some(cb) = progress.as_mut() {
            cb.init(address, total)
        }

        // decode the frames as we go to learn how many image bytes each one
        // accounts for
        let mut decoder = ZlibDecoder::new(Vec::new());
        let mut decoded_size = 0;

        for (i, block) in compressed.chunks(FLASH_WRITE_SIZE).enumerate() {
            decoder.write_all(block)?;
            decoder.flush()?;
            let size = decoder.get_ref().len() - decoded_size;
            decoded_size = decoder.get_ref().len();

            self.connection
                .with_timeout(
                    CommandType::FlashDeflateData.timeout_for_size(size as u32),
                    |connection| {
                        connection.command(Command::FlashDeflateData {
                            data: block,
                            pad_to: 0,
                            pad_byte: 0xff,
                            sequence: i as u32,
                        })
                    },
                )
                .flashing()?;

            if let Some(cb) = progress.as_mut() {
                cb.update(decoded_size)
            }
        }

        self.connection
            .with_timeout(CommandType::FlashDeflateEnd.timeout(), |connection| {
                connection.command(Command::FlashDeflateEnd { reboot: false })
            })
            .flashing()?;

        if let Some(cb) = progress.as_mut() {
            cb.finish()
        }

        Ok(())
    }

    /// Compare the device's digest of the written span against a local one
    fn verify_md5(&mut self, image: &[u8], address: u32) -> Result<(), Error> {
        let mut hasher = Md5::new();
        hasher.update(image);
        let local = hasher.finalize();

        let device: u128 = self
            .connection
            .with_timeout(CommandType::FlashMd5.timeout(), |connection| {
                connection
                    .command(Command::FlashMd5 {
                        offset: address,
                        size: image.len() as u32,
                    })?
                    .try_into()
            })
            .flashing()?;

        if local.as_slice() != device.to_be_bytes() {
            return Err(Error::VerifyFailed);
        }

        debug!("Flash contents verified");
        Ok(())
    }
}

/// Patch the flash-parameter bytes of a bootable image header.
///
/// Byte 2 carries the flash mode and byte 3 packs size (high nibble) and
/// frequency (low nibble); a `None` setting keeps the image's value. Images
/// without the header magic are passed through untouched.
fn apply_flash_settings<'a>(data: &'a [u8], settings: &FlashSettings) -> Cow<'a, [u8]> {
    let untouched =
        settings.mode.is_none() && settings.size.is_none() && settings.freq.is_none();
    if untouched || data.len() < 4 || data[0] != IMAGE_MAGIC {
        return Cow::Borrowed(data);
    }

    let mut patched = data.to_vec();
    if let Some(mode) = settings.mode {
        patched[2] = mode.encode();
    }

    let mut size_freq = patched[3];
    if let Some(size) = settings.size {
        size_freq = (size.encode() << 4) | (size_freq & 0x0f);
    }
    if let Some(freq) = settings.freq {
        size_freq = (size_freq & 0xf0) | freq.encode();
    }
    patched[3] = size_freq;

    Cow::Owned(patched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        chip::Chip,
        transport::mock::{MockTransport, Recorder},
    };

    #[derive(Default)]
    struct RecordingProgress {
        init: Option<(u32, usize)>,
        updates: Vec<usize>,
        finished: bool,
    }

    impl ProgressCallbacks for RecordingProgress {
        fn init(&mut self, addr: u32, total: usize) {
            self.init = Some((addr, total));
        }

        fn update(&mut self, current: usize) {
            self.updates.push(current);
        }

        fn finish(&mut self) {
            self.finished = true;
        }
    }

    fn connection(mock: MockTransport) -> (Connection, Recorder) {
        let recorder = mock.recorder();
        (Connection::new(Box::new(mock)), recorder)
    }

    fn transfer(
        mock: MockTransport,
        image: Vec<u8>,
        options: &TransferOptions,
    ) -> (Result<(), Error>, Recorder, RecordingProgress) {
        let (mut conn, recorder) = connection(mock);
        let mut flasher = Flasher::new(&mut conn, ChipIdentity::Known(Chip::Esp32c3));
        let source = FirmwareSource::new(EXPECTED_FIRMWARE_ASSET, image);
        let mut progress = RecordingProgress::default();

        let result = flasher.transfer(
            &source,
            APP_FLASH_OFFSET,
            options,
            &mut Some(&mut progress),
        );

        (result, recorder, progress)
    }

    #[test]
    fn full_image_transfer_is_framed_ordered_and_acknowledged() {
        let options = TransferOptions {
            erase: ErasePolicy::All,
            ..TransferOptions::default()
        };
        let (result, recorder, progress) = transfer(MockTransport::new(), vec![0xAB; 159_744], &options);

        result.unwrap();

        // 159744 bytes in 0x400-byte frames
        assert_eq!(recorder.count_op(CommandType::FlashData), 156);
        assert_eq!(
            recorder.data_sequences(),
            (0..156).collect::<Vec<u32>>()
        );

        // erase confirmation strictly precedes streaming
        let ops = recorder.ops();
        let erase = ops.iter().position(|&op| op == CommandType::EraseFlash as u8);
        let begin = ops.iter().position(|&op| op == CommandType::FlashBegin as u8);
        let first_data = ops.iter().position(|&op| op == CommandType::FlashData as u8);
        assert!(erase < begin && begin < first_data);

        // progress reported after every frame, monotone, final report == total
        assert_eq!(progress.init, Some((0, 159_744)));
        assert_eq!(progress.updates.len(), 156);
        assert!(progress.updates.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(progress.updates.last(), Some(&159_744));
        assert!(progress.finished);
    }

    #[test]
    fn short_final_frame_is_acknowledged_like_full_frames() {
        let (result, recorder, progress) =
            transfer(MockTransport::new(), vec![0x11; 2_500], &TransferOptions::default());

        result.unwrap();

        assert_eq!(recorder.count_op(CommandType::FlashData), 3);
        assert_eq!(recorder.data_sequences(), vec![0, 1, 2]);
        assert_eq!(progress.updates, vec![1024, 2048, 2500]);

        // the final frame is padded out to the full block size on the wire
        let frames = recorder.frames_with_op(CommandType::FlashData);
        let declared_size =
            u32::from_le_bytes([frames[2][8], frames[2][9], frames[2][10], frames[2][11]]);
        assert_eq!(declared_size, FLASH_WRITE_SIZE as u32);
    }

    #[test]
    fn written_range_erase_skips_the_erase_command() {
        let (result, recorder, _) =
            transfer(MockTransport::new(), vec![0x22; 4096], &TransferOptions::default());

        result.unwrap();
        assert_eq!(recorder.count_op(CommandType::EraseFlash), 0);
        assert_eq!(recorder.count_op(CommandType::FlashBegin), 1);
    }

    #[test]
    fn frame_failure_aborts_with_progress_frozen() {
        let mut mock = MockTransport::new();
        mock.fail_on = Some((CommandType::FlashData as u8, 3));

        let (result, recorder, progress) =
            transfer(mock, vec![0x33; 10 * 1024], &TransferOptions::default());

        result.unwrap_err();

        // the failing frame went out, nothing after it did
        assert_eq!(recorder.count_op(CommandType::FlashData), 3);
        assert_eq!(progress.updates, vec![1024, 2048]);
        assert!(!progress.finished);
    }

    #[test]
    fn wrong_asset_name_is_rejected_before_any_wire_io() {
        let (mut conn, recorder) = connection(MockTransport::new());
        let mut flasher = Flasher::new(&mut conn, ChipIdentity::Known(Chip::Esp32c3));
        let source = FirmwareSource::new("wrong-name.bin", vec![0u8; 1024]);

        let err = flasher
            .transfer(&source, 0, &TransferOptions::default(), &mut None)
            .unwrap_err();

        assert!(matches!(err, Error::InvalidImageSource { .. }));
        assert!(recorder.is_empty());
    }

    #[test]
    fn compressed_transfer_accounts_progress_in_image_bytes() {
        let image: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        let options = TransferOptions {
            compress: true,
            ..TransferOptions::default()
        };

        let (result, recorder, progress) = transfer(MockTransport::new(), image, &options);

        result.unwrap();

        assert_eq!(recorder.count_op(CommandType::FlashData), 0);
        assert_eq!(recorder.count_op(CommandType::FlashDeflateBegin), 1);
        assert!(recorder.count_op(CommandType::FlashDeflateData) >= 1);
        assert_eq!(recorder.count_op(CommandType::FlashDeflateEnd), 1);

        assert_eq!(progress.init, Some((0, 20_000)));
        assert!(progress.updates.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(progress.updates.last(), Some(&20_000));
        assert!(progress.finished);
    }

    #[test]
    fn verification_compares_device_digest() {
        let image = vec![0x5A; 4096];
        let digest = u128::from_be_bytes(Md5::digest(&image).into());

        let mut mock = MockTransport::new();
        mock.md5_response = Some(digest);
        let options = TransferOptions {
            verify: true,
            ..TransferOptions::default()
        };
        let (result, _, _) = transfer(mock, image.clone(), &options);
        result.unwrap();

        let mut mock = MockTransport::new();
        mock.md5_response = Some(digest.wrapping_add(1));
        let (result, _, _) = transfer(mock, image, &options);
        assert!(matches!(result.unwrap_err(), Error::VerifyFailed));
    }

    #[test]
    fn flash_settings_patch_the_image_header() {
        let mut image = vec![0u8; 2048];
        image[0] = 0xE9;
        image[3] = 0x2f;

        let options = TransferOptions {
            settings: FlashSettings::new(
                Some(FlashMode::Dio),
                Some(FlashSize::_8Mb),
                None,
            ),
            ..TransferOptions::default()
        };
        let (result, recorder, _) = transfer(MockTransport::new(), image, &options);

        result.unwrap();

        let frames = recorder.frames_with_op(CommandType::FlashData);
        // frame payload starts after the 16-byte block params at offset 8
        let header = &frames[0][24..28];
        assert_eq!(header[0], 0xE9);
        assert_eq!(header[2], FlashMode::Dio.encode());
        // size nibble replaced, frequency nibble kept
        assert_eq!(header[3], (FlashSize::_8Mb.encode() << 4) | 0x0f);
    }

    #[test]
    fn header_patching_keeps_unrelated_images_untouched() {
        let raw = vec![0x42u8; 64];
        let patched = apply_flash_settings(
            &raw,
            &FlashSettings::new(Some(FlashMode::Qio), None, None),
        );
        assert!(matches!(patched, Cow::Borrowed(_)));
    }
}
