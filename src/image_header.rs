//! ESP32 bootloader / application image header codec
//!
//! Every bootable image — the second-stage bootloader at flash offset
//! 0x1000, and every `app`-type partition's contents — begins with the
//! 24-byte [`ImageHeader`] below, optionally followed by a trailing
//! SHA-256 digest of the whole image.
//!
//! See: <https://docs.espressif.com/projects/esptool/en/latest/esp32/advanced-topics/firmware-image-format.html>

use std::mem::size_of;

use bytemuck::{bytes_of, from_bytes, Pod, Zeroable};
use sha2::{Digest, Sha256};

use crate::{
    error::Error,
    sizes::FlashSize,
};

const ESP_MAGIC: u8 = 0xE9;
const SEG_HEADER_LEN: usize = 8;
const SHA256_LEN: usize = 32;

/// Firmware header used by the ESP-IDF second-stage bootloader and by every
/// `app`-type partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C, packed)]
pub struct ImageHeader {
    pub magic: u8,
    pub num_segments: u8,
    pub spi_mode: u8,
    /// Low nibble: SPI speed. High nibble: [`FlashSize`] encoding.
    pub spi_speed_size: u8,
    pub entry_addr: u32,
    pub wp_pin: u8,
    pub spi_pin_drv: [u8; 3],
    pub chip_id: u16,
    pub min_chip_rev: u8,
    pub reserved: [u8; 8],
    /// `1` if a trailing SHA-256 digest of the image follows the segments.
    pub hash_appended: u8,
}

impl Default for ImageHeader {
    fn default() -> Self {
        ImageHeader {
            magic: ESP_MAGIC,
            num_segments: 0,
            spi_mode: 0,
            spi_speed_size: (FlashSize::default().encode() << 4),
            entry_addr: 0,
            wp_pin: 0xEE,
            spi_pin_drv: [0; 3],
            chip_id: 0,
            min_chip_rev: 0,
            reserved: [0; 8],
            hash_appended: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C, packed)]
struct SegmentHeader {
    addr: u32,
    length: u32,
}

impl ImageHeader {
    pub const SIZE: usize = size_of::<ImageHeader>();

    /// Parses the 24-byte header at the start of `bytes`.
    pub fn parse(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < Self::SIZE {
            return Err(Error::InvalidImage(format!(
                "image is only {} bytes, need at least {}",
                bytes.len(),
                Self::SIZE
            )));
        }
        let header: ImageHeader = *from_bytes(&bytes[..Self::SIZE]);
        if header.magic != ESP_MAGIC {
            return Err(Error::InvalidImage(format!(
                "bad magic byte {:#04x}, expected {ESP_MAGIC:#04x}",
                header.magic
            )));
        }
        Ok(header)
    }

    /// Serializes the header back to its 24-byte on-flash representation.
    pub fn emit(&self) -> [u8; ImageHeader::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out.copy_from_slice(bytes_of(self));
        out
    }

    pub fn flash_size(&self) -> Result<FlashSize, Error> {
        FlashSize::decode(self.spi_speed_size >> 4)
    }

    /// Rewrites the flash-size nibble in place.
    pub fn set_flash_size(&mut self, size: FlashSize) {
        self.spi_speed_size = (self.spi_speed_size & 0x0F) | (size.encode() << 4);
    }

    pub fn hash_appended(&self) -> bool {
        self.hash_appended != 0
    }

    /// Walks the segment chain following the header to find the total size
    /// of the image (header + segments + checksum byte + optional digest).
    ///
    /// `image` must start at the header itself (offset 0 of this image, not
    /// of the enclosing partition/flash).
    pub fn size_of_image(image: &[u8]) -> Result<usize, Error> {
        let header = Self::parse(image)?;
        let mut offset = Self::SIZE;

        for _ in 0..header.num_segments {
            let seg_header_bytes = image.get(offset..offset + SEG_HEADER_LEN).ok_or_else(|| {
                Error::InvalidImage("truncated image: segment header out of bounds".into())
            })?;
            let seg: SegmentHeader = *from_bytes(seg_header_bytes);
            offset += SEG_HEADER_LEN + seg.length as usize;
            if offset > image.len() {
                return Err(Error::InvalidImage(
                    "truncated image: segment body out of bounds".into(),
                ));
            }
        }

        // Pad with zero bytes until exactly one more byte (the checksum)
        // brings the running length to a multiple of 16.
        let padding = (15 - offset % 16).rem_euclid(16);
        let mut total = offset + padding + 1;
        debug_assert_eq!(total % 16, 0);

        if header.hash_appended() {
            total += SHA256_LEN;
        }

        if total > image.len() {
            return Err(Error::InvalidImage(
                "truncated image: digest out of bounds".into(),
            ));
        }

        Ok(total)
    }

    /// Recomputes the SHA-256 over `image[..end-32]` and compares it against
    /// the trailing 32 bytes at `image[end-32..end]`.
    pub fn validate_hash(image: &[u8], end: usize) -> Result<bool, Error> {
        if end < SHA256_LEN || end > image.len() {
            return Err(Error::RangeError(
                "hash range falls outside the image".into(),
            ));
        }
        let (body, digest) = image[..end].split_at(end - SHA256_LEN);
        let mut hasher = Sha256::new();
        hasher.update(body);
        let computed = hasher.finalize();
        Ok(computed.as_slice() == digest)
    }

    /// Recomputes the SHA-256 over `image[..end-32]` and overwrites the
    /// trailing 32 bytes with it, returning the new digest.
    pub fn rehash(image: &mut [u8], end: usize) -> Result<[u8; SHA256_LEN], Error> {
        if end < SHA256_LEN || end > image.len() {
            return Err(Error::RangeError(
                "hash range falls outside the image".into(),
            ));
        }
        let mut hasher = Sha256::new();
        hasher.update(&image[..end - SHA256_LEN]);
        let digest = hasher.finalize();
        let mut out = [0u8; SHA256_LEN];
        out.copy_from_slice(&digest);
        image[end - SHA256_LEN..end].copy_from_slice(&out);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_image(num_segments: u8, hash_appended: bool) -> Vec<u8> {
        let mut header = ImageHeader {
            num_segments,
            hash_appended: hash_appended as u8,
            ..Default::default()
        };
        header.set_flash_size(FlashSize::_4Mb);
        let mut data = header.emit().to_vec();
        for i in 0..num_segments {
            data.extend_from_slice(&(0x3F400000u32 + i as u32).to_le_bytes());
            data.extend_from_slice(&4u32.to_le_bytes());
            data.extend_from_slice(&[0xAA; 4]);
        }
        let padding = (15 - data.len() % 16).rem_euclid(16);
        data.resize(data.len() + padding, 0);
        data.push(0); // checksum byte, value not checked by size_of_image
        assert_eq!(data.len() % 16, 0);
        if hash_appended {
            let end = data.len() + 32;
            data.resize(end, 0);
            ImageHeader::rehash(&mut data, end).unwrap();
        }
        data
    }

    #[test]
    fn parse_rejects_bad_magic() {
        let bytes = [0u8; 24];
        assert!(ImageHeader::parse(&bytes).is_err());
    }

    #[test]
    fn parse_emit_round_trips() {
        let mut header = ImageHeader::default();
        header.set_flash_size(FlashSize::_16Mb);
        header.entry_addr = 0x4008_0000;
        let bytes = header.emit();
        let parsed = ImageHeader::parse(&bytes).unwrap();
        assert_eq!(parsed.flash_size().unwrap(), FlashSize::_16Mb);
        assert_eq!({ parsed.entry_addr }, 0x4008_0000);
    }

    #[test]
    fn flash_size_nibble_round_trips() {
        let mut header = ImageHeader::default();
        for size in [FlashSize::_1Mb, FlashSize::_8Mb, FlashSize::_128Mb] {
            header.set_flash_size(size);
            assert_eq!(header.flash_size().unwrap(), size);
        }
    }

    #[test]
    fn rehash_then_validate_succeeds() {
        let mut image = minimal_image(2, true);
        let end = image.len();
        assert!(ImageHeader::validate_hash(&image, end).unwrap());

        // Corrupting a body byte must break validation...
        image[30] ^= 0xFF;
        assert!(!ImageHeader::validate_hash(&image, end).unwrap());

        // ...and rehashing must restore it.
        ImageHeader::rehash(&mut image, end).unwrap();
        assert!(ImageHeader::validate_hash(&image, end).unwrap());
    }
}
