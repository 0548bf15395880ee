//! Bounded partition view
//!
//! Wraps a [`FlashIo`] and a byte range so that every caller above this
//! layer — the image codec, the OTA engine, the filesystem adapter —
//! addresses bytes relative to a single partition and can never read or
//! write past its boundary, mirroring the windowed-access pattern
//! `espflash`'s flash targets use to keep segment writes inside their
//! declared region.

use crate::{error::Error, flash_io::FlashIo, image_header::ImageHeader, partition::BLOCK_ALIGN};

fn round_up(value: u32, align: u32) -> u32 {
    (value + align - 1) / align * align
}

/// A `[base, base + len)` window onto a [`FlashIo`], addressed with
/// partition-relative offsets.
pub struct PartitionIo<'a> {
    io: &'a mut dyn FlashIo,
    base: u32,
    len: u32,
}

impl<'a> PartitionIo<'a> {
    pub fn new(io: &'a mut dyn FlashIo, base: u32, len: u32) -> Self {
        PartitionIo { io, base, len }
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn check_bounds(&self, offset: u32, size: usize) -> Result<(), Error> {
        let end = offset as u64 + size as u64;
        if end > self.len as u64 {
            return Err(Error::RangeError(format!(
                "offset {offset:#x} + {size} bytes exceeds partition length {:#x}",
                self.len
            )));
        }
        Ok(())
    }

    /// Reads `len` bytes at partition-relative `offset`.
    pub fn read(&mut self, offset: u32, len: usize) -> Result<Vec<u8>, Error> {
        self.check_bounds(offset, len)?;
        self.io.read(self.base + offset, len)
    }

    /// Reads the partition's full contents.
    pub fn read_all(&mut self) -> Result<Vec<u8>, Error> {
        self.read(0, self.len as usize)
    }

    /// Writes `data` at partition-relative `offset`.
    pub fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), Error> {
        self.check_bounds(offset, data.len())?;
        self.io.write(self.base + offset, data)
    }

    /// Erases `len` bytes at partition-relative `offset`.
    pub fn erase(&mut self, offset: u32, len: usize) -> Result<(), Error> {
        self.check_bounds(offset, len)?;
        self.io.erase(self.base + offset, len)
    }

    /// Erases the entire partition.
    pub fn erase_all(&mut self) -> Result<(), Error> {
        self.erase(0, self.len as usize)
    }

    /// Writes `data` at offset `0` and blank-fills the remainder of the
    /// partition, used when a written image is smaller than its partition.
    pub fn truncate_write(&mut self, data: &[u8]) -> Result<(), Error> {
        if data.len() as u64 > self.len as u64 {
            return Err(Error::RangeError(format!(
                "{} bytes do not fit in a {:#x}-byte partition",
                data.len(),
                self.len
            )));
        }
        self.write(0, data)?;
        let remaining = self.len as usize - data.len();
        if remaining > 0 {
            self.erase(data.len() as u32, remaining)?;
        }
        Ok(())
    }

    /// Writes an app image, validating its header and, if the header says a
    /// digest is appended, recomputing and overwriting the trailing SHA-256
    /// so it always matches exactly what ends up on flash.
    pub fn write_app_image(&mut self, data: &[u8]) -> Result<(), Error> {
        let header = ImageHeader::parse(data)?;
        if !header.hash_appended() {
            return self.truncate_write(data);
        }
        let end = ImageHeader::size_of_image(data)?;
        let mut buf = data[..end].to_vec();
        ImageHeader::rehash(&mut buf, end)?;
        self.truncate_write(&buf)
    }

    /// Reads the partition's contents cut off after `at` bytes.
    pub fn truncate(&mut self, at: u32) -> Result<Vec<u8>, Error> {
        self.read(0, at.min(self.len) as usize)
    }

    /// Returns the bytes up to a 16-byte boundary after the last non-`0xFF`
    /// byte, discarding trailing blank padding.
    pub fn trim(&mut self) -> Result<Vec<u8>, Error> {
        self.trim_to_boundary(16)
    }

    /// Returns the bytes up to a 4 KiB boundary after the last non-`0xFF`
    /// byte.
    pub fn trim_blocks(&mut self) -> Result<Vec<u8>, Error> {
        self.trim_to_boundary(BLOCK_ALIGN)
    }

    fn trim_to_boundary(&mut self, align: u32) -> Result<Vec<u8>, Error> {
        let data = self.read_all()?;
        let at = match data.iter().rposition(|&b| b != 0xFF) {
            Some(last) => round_up(last as u32 + 1, align),
            None => 0,
        };
        self.truncate(at)
    }

    /// Number of `block_size`-byte blocks this partition spans. Used by the
    /// LittleFS adapter to size its block device.
    pub fn blocks(&self, block_size: u32) -> u32 {
        self.len / block_size
    }

    /// Reads one `block_size`-byte block by index.
    pub fn read_block(&mut self, index: u32, block_size: u32) -> Result<Vec<u8>, Error> {
        self.read(index * block_size, block_size as usize)
    }

    /// Writes one `block_size`-byte block by index.
    pub fn write_block(&mut self, index: u32, block_size: u32, data: &[u8]) -> Result<(), Error> {
        if data.len() as u32 != block_size {
            return Err(Error::RangeError(format!(
                "block write of {} bytes does not match block size {block_size}",
                data.len()
            )));
        }
        self.write(index * block_size, data)
    }

    /// Erases one `block_size`-byte block by index.
    pub fn erase_block(&mut self, index: u32, block_size: u32) -> Result<(), Error> {
        self.erase(index * block_size, block_size as usize)
    }

    pub fn flush(&mut self) -> Result<(), Error> {
        self.io.flush()
    }
}
