//! Chip identification
//!
//! The boot ROM of every supported device exposes a magic value at a fixed
//! register address; reading it during bring-up tells us which chip family we
//! are talking to. An unrecognized magic value is not fatal: the device can
//! still be flashed with conservative defaults, it just reports a generic
//! identity.

use std::fmt;

use strum::{Display, EnumIter, EnumString, VariantNames};

use crate::error::Error;

/// All supported devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter, EnumString, VariantNames)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[non_exhaustive]
#[strum(serialize_all = "lowercase")]
pub enum Chip {
    /// ESP32
    Esp32,
    /// ESP32-C2, ESP8684
    Esp32c2,
    /// ESP32-C3, ESP8685
    Esp32c3,
    /// ESP32-C6
    Esp32c6,
    /// ESP32-H2
    Esp32h2,
    /// ESP32-S2
    Esp32s2,
    /// ESP32-S3
    Esp32s3,
}

impl Chip {
    /// Look up a chip from the magic value read out of the chip-detect
    /// register during bring-up.
    pub fn from_magic(magic: u32) -> Result<Self, Error> {
        let chip = match magic {
            0x00f0_1d83 => Chip::Esp32,
            // ECO0, ECO1
            0x6f51_306f | 0x7c41_a06f => Chip::Esp32c2,
            // ECO1 + ECO2, ECO3, ECO6, ECO7
            0x6921_506f | 0x1b31_506f | 0x4881_606f | 0x4361_606f => Chip::Esp32c3,
            0x2ce0_806f => Chip::Esp32c6,
            0xd7b7_3e80 => Chip::Esp32h2,
            0x0000_07c6 => Chip::Esp32s2,
            0x0000_0009 => Chip::Esp32s3,
            _ => return Err(Error::ChipDetectError(magic)),
        };

        Ok(chip)
    }

    /// Whether the chip's `FlashBegin` parameters carry the trailing
    /// encryption field. The original ESP32 predates it.
    pub fn supports_encryption(&self) -> bool {
        !matches!(self, Chip::Esp32)
    }

    /// Marketing name, for display
    pub fn name(&self) -> &'static str {
        match self {
            Chip::Esp32 => "ESP32",
            Chip::Esp32c2 => "ESP32-C2",
            Chip::Esp32c3 => "ESP32-C3",
            Chip::Esp32c6 => "ESP32-C6",
            Chip::Esp32h2 => "ESP32-H2",
            Chip::Esp32s2 => "ESP32-S2",
            Chip::Esp32s3 => "ESP32-S3",
        }
    }
}

/// The identity reported by a device during bring-up
///
/// `Unknown` carries the unrecognized magic value; it never aborts a connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChipIdentity {
    Known(Chip),
    Unknown(u32),
}

impl ChipIdentity {
    pub fn chip(&self) -> Option<Chip> {
        match self {
            ChipIdentity::Known(chip) => Some(*chip),
            ChipIdentity::Unknown(_) => None,
        }
    }

    pub fn supports_encryption(&self) -> bool {
        match self {
            ChipIdentity::Known(chip) => chip.supports_encryption(),
            // Conservative default: the short parameter layout is accepted by
            // every ROM loader.
            ChipIdentity::Unknown(_) => false,
        }
    }
}

impl fmt::Display for ChipIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChipIdentity::Known(chip) => write!(f, "{}", chip.name()),
            ChipIdentity::Unknown(magic) => write!(f, "Unknown chip (magic {magic:#010x})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_known_magic_values() {
        assert_eq!(Chip::from_magic(0x00f0_1d83).unwrap(), Chip::Esp32);
        assert_eq!(Chip::from_magic(0x1b31_506f).unwrap(), Chip::Esp32c3);
        assert_eq!(Chip::from_magic(0x2ce0_806f).unwrap(), Chip::Esp32c6);
    }

    #[test]
    fn unknown_magic_is_soft() {
        let err = Chip::from_magic(0xdead_beef).unwrap_err();
        assert!(matches!(err, Error::ChipDetectError(0xdead_beef)));

        let identity = ChipIdentity::Unknown(0xdead_beef);
        assert_eq!(identity.chip(), None);
        assert!(!identity.supports_encryption());
        assert_eq!(identity.to_string(), "Unknown chip (magic 0xdeadbeef)");
    }
}
