//! Block device binding
//!
//! The trait a LittleFS driver expects a backing store to satisfy, and the
//! one real implementation this crate provides: a fixed-size-block view onto
//! a [`PartitionIo`].

use crate::{error::Error, partition_io::PartitionIo};

use super::BLOCK_SIZE;

pub trait BlockDevice {
    fn block_size(&self) -> u32;
    fn block_count(&self) -> u32;
    fn read_block(&mut self, index: u32) -> Result<Vec<u8>, Error>;
    fn write_block(&mut self, index: u32, data: &[u8]) -> Result<(), Error>;
    fn erase_block(&mut self, index: u32) -> Result<(), Error>;
}

/// Binds a partition as a block device with `BLOCK_SIZE`-byte blocks.
pub struct PartitionBlockDevice<'a, 'io> {
    io: &'a mut PartitionIo<'io>,
}

impl<'a, 'io> PartitionBlockDevice<'a, 'io> {
    pub fn new(io: &'a mut PartitionIo<'io>) -> Self {
        PartitionBlockDevice { io }
    }
}

impl BlockDevice for PartitionBlockDevice<'_, '_> {
    fn block_size(&self) -> u32 {
        BLOCK_SIZE
    }

    fn block_count(&self) -> u32 {
        self.io.blocks(BLOCK_SIZE)
    }

    fn read_block(&mut self, index: u32) -> Result<Vec<u8>, Error> {
        self.io.read_block(index, BLOCK_SIZE)
    }

    fn write_block(&mut self, index: u32, data: &[u8]) -> Result<(), Error> {
        self.io.write_block(index, BLOCK_SIZE, data)
    }

    fn erase_block(&mut self, index: u32) -> Result<(), Error> {
        self.io.erase_block(index, BLOCK_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash_io::FileFlashIo;
    use tempfile::NamedTempFile;

    #[test]
    fn block_count_matches_partition_size() {
        let tmp = NamedTempFile::new().unwrap();
        let mut io = FileFlashIo::create(tmp.path(), 0x20000).unwrap();
        let mut view = PartitionIo::new(&mut io, 0, 0x10000);
        let device = PartitionBlockDevice::new(&mut view);
        assert_eq!(device.block_count(), 16);
    }

    #[test]
    fn write_then_read_block_round_trips() {
        let tmp = NamedTempFile::new().unwrap();
        let mut io = FileFlashIo::create(tmp.path(), 0x20000).unwrap();
        let mut view = PartitionIo::new(&mut io, 0, 0x10000);
        let mut device = PartitionBlockDevice::new(&mut view);
        let data = vec![0x42u8; BLOCK_SIZE as usize];
        device.write_block(2, &data).unwrap();
        assert_eq!(device.read_block(2).unwrap(), data);
    }
}
