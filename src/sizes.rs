//! Flash-size encoding shared by the image header codec and the directive
//! parser.
//!
//! Mirrors the shape of `espflash::flasher::FlashSize`: a closed enum of the
//! sizes the ESP32 image header can actually encode, plus the nibble it
//! encodes to/from.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, VariantNames};

use crate::error::Error;

/// Flash chip sizes the image header's high nibble can represent.
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Display, EnumIter, VariantNames, Serialize,
    Deserialize,
)]
#[non_exhaustive]
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
    /// 32 MB
    #[serde(rename = "32MB")]
    _32Mb,
    /// 64 MB
    #[serde(rename = "64MB")]
    _64Mb,
    /// 128 MB
    #[serde(rename = "128MB")]
    _128Mb,
}

impl FlashSize {
    /// Number of bytes this size represents.
    pub const fn bytes(self) -> u64 {
        match self {
            FlashSize::_1Mb => 1 << 20,
            FlashSize::_2Mb => 2 << 20,
            FlashSize::_4Mb => 4 << 20,
            FlashSize::_8Mb => 8 << 20,
            FlashSize::_16Mb => 16 << 20,
            FlashSize::_32Mb => 32 << 20,
            FlashSize::_64Mb => 64 << 20,
            FlashSize::_128Mb => 128 << 20,
        }
    }

    /// The closest representable size that is `>= bytes`, used when a
    /// `--flash-size` directive is given as a raw byte count.
    pub fn from_bytes(bytes: u64) -> Result<Self, Error> {
        use FlashSize::*;
        for size in [_1Mb, _2Mb, _4Mb, _8Mb, _16Mb, _32Mb, _64Mb, _128Mb] {
            if size.bytes() == bytes {
                return Ok(size);
            }
        }
        Err(Error::InvalidImage(format!(
            "{bytes:#x} is not one of the flash sizes the image header can encode"
        )))
    }

    /// Encodes this size into the nibble stored in the image header's
    /// `spi_speed_size` byte.
    pub const fn encode(self) -> u8 {
        match self {
            FlashSize::_1Mb => 0,
            FlashSize::_2Mb => 1,
            FlashSize::_4Mb => 2,
            FlashSize::_8Mb => 3,
            FlashSize::_16Mb => 4,
            FlashSize::_32Mb => 5,
            FlashSize::_64Mb => 6,
            FlashSize::_128Mb => 7,
        }
    }

    /// Decodes the nibble stored in the image header's `spi_speed_size` byte.
    pub fn decode(nibble: u8) -> Result<Self, Error> {
        use FlashSize::*;
        match nibble {
            0 => Ok(_1Mb),
            1 => Ok(_2Mb),
            2 => Ok(_4Mb),
            3 => Ok(_8Mb),
            4 => Ok(_16Mb),
            5 => Ok(_32Mb),
            6 => Ok(_64Mb),
            7 => Ok(_128Mb),
            other => Err(Error::InvalidImage(format!(
                "unrecognised flash-size nibble {other:#x}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_variant() {
        for size in [
            FlashSize::_1Mb,
            FlashSize::_2Mb,
            FlashSize::_4Mb,
            FlashSize::_8Mb,
            FlashSize::_16Mb,
            FlashSize::_32Mb,
            FlashSize::_64Mb,
            FlashSize::_128Mb,
        ] {
            assert_eq!(FlashSize::decode(size.encode()).unwrap(), size);
        }
    }

    #[test]
    fn from_bytes_matches_encode() {
        assert_eq!(FlashSize::from_bytes(8 << 20).unwrap(), FlashSize::_8Mb);
        assert!(FlashSize::from_bytes(3 << 20).is_err());
    }
}
