//! Write-back block cache
//!
//! LittleFS issues many small writes to the same block as it updates
//! metadata pairs; over a slow serial link that means one round trip per
//! write. This wrapper coalesces repeated writes to a block and only
//! flushes it to the underlying device when a different block is touched,
//! the cache is flushed explicitly, or it is dropped.

use std::collections::HashMap;

use crate::error::Error;

use super::BlockDevice;

pub struct CachingBlockDevice<D: BlockDevice> {
    inner: D,
    dirty: HashMap<u32, Vec<u8>>,
}

impl<D: BlockDevice> CachingBlockDevice<D> {
    pub fn new(inner: D) -> Self {
        CachingBlockDevice {
            inner,
            dirty: HashMap::new(),
        }
    }

    /// Writes every buffered block to the underlying device and clears the
    /// cache. Called automatically on drop, but callers should call this
    /// explicitly so I/O errors surface instead of being silently dropped.
    pub fn flush(&mut self) -> Result<(), Error> {
        for (index, data) in self.dirty.drain() {
            self.inner.write_block(index, &data)?;
        }
        Ok(())
    }

    /// Drops any buffered, unflushed writes without committing them. Used
    /// when a higher-level write is aborted partway through.
    pub fn discard(&mut self) {
        self.dirty.clear();
    }
}

impl<D: BlockDevice> BlockDevice for CachingBlockDevice<D> {
    fn block_size(&self) -> u32 {
        self.inner.block_size()
    }

    fn block_count(&self) -> u32 {
        self.inner.block_count()
    }

    fn read_block(&mut self, index: u32) -> Result<Vec<u8>, Error> {
        if let Some(cached) = self.dirty.get(&index) {
            return Ok(cached.clone());
        }
        self.inner.read_block(index)
    }

    fn write_block(&mut self, index: u32, data: &[u8]) -> Result<(), Error> {
        self.dirty.insert(index, data.to_vec());
        Ok(())
    }

    fn erase_block(&mut self, index: u32) -> Result<(), Error> {
        self.dirty.remove(&index);
        self.inner.erase_block(index)
    }
}

impl<D: BlockDevice> Drop for CachingBlockDevice<D> {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MockDevice {
        blocks: Vec<Vec<u8>>,
        writes: usize,
    }

    impl MockDevice {
        fn new(count: u32, size: u32) -> Self {
            MockDevice {
                blocks: vec![vec![0xFF; size as usize]; count as usize],
                writes: 0,
            }
        }
    }

    impl BlockDevice for MockDevice {
        fn block_size(&self) -> u32 {
            self.blocks[0].len() as u32
        }

        fn block_count(&self) -> u32 {
            self.blocks.len() as u32
        }

        fn read_block(&mut self, index: u32) -> Result<Vec<u8>, Error> {
            Ok(self.blocks[index as usize].clone())
        }

        fn write_block(&mut self, index: u32, data: &[u8]) -> Result<(), Error> {
            self.blocks[index as usize] = data.to_vec();
            self.writes += 1;
            Ok(())
        }

        fn erase_block(&mut self, index: u32) -> Result<(), Error> {
            self.blocks[index as usize] = vec![0xFF; self.blocks[index as usize].len()];
            Ok(())
        }
    }

    #[test]
    fn repeated_writes_to_same_block_coalesce() {
        let mut cache = CachingBlockDevice::new(MockDevice::new(4, 16));
        cache.write_block(1, &[1; 16]).unwrap();
        cache.write_block(1, &[2; 16]).unwrap();
        cache.write_block(1, &[3; 16]).unwrap();
        assert_eq!(cache.inner.writes, 0);
        cache.flush().unwrap();
        assert_eq!(cache.inner.writes, 1);
        assert_eq!(cache.read_block(1).unwrap(), vec![3; 16]);
    }

    #[test]
    fn read_before_flush_sees_cached_value() {
        let mut cache = CachingBlockDevice::new(MockDevice::new(4, 16));
        cache.write_block(0, &[9; 16]).unwrap();
        assert_eq!(cache.read_block(0).unwrap(), vec![9; 16]);
    }
}
