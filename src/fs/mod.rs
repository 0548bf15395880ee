//! LittleFS adapter
//!
//! The filesystem implementation itself is an external collaborator: this
//! module only binds a partition to the block-device shape a LittleFS
//! driver expects, and declares the filesystem operations the rest of the
//! crate dispatches `fs:` directives through. [`MemFs`] stands in for a real
//! driver — it persists its tree into the bound partition's own blocks, so
//! `mkfs`/`mount` round-trip across separate calls, but the on-disk layout
//! it uses is private to this crate, not a real LittleFS image.

mod block_device;
mod caching;
mod mem_fs;

pub use block_device::{BlockDevice, PartitionBlockDevice};
pub use caching::CachingBlockDevice;
pub use mem_fs::MemFs;

use crate::error::Error;

/// Block size the LittleFS binding uses for every partition: one flash
/// sector, matching `PartitionIo`'s own block granularity.
pub const BLOCK_SIZE: u32 = 0x1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskUsage {
    pub used_blocks: u32,
    pub total_blocks: u32,
    pub block_size: u32,
}

/// The operations a mounted LittleFS volume exposes to the rest of the
/// crate. A real binding wraps a block device matching [`BLOCK_SIZE`]; this
/// crate never implements the filesystem algorithm itself.
pub trait FileSystem {
    fn ls(&self, path: &str) -> Result<Vec<DirEntry>, Error>;
    fn cat(&self, path: &str) -> Result<Vec<u8>, Error>;
    fn write_file(&mut self, path: &str, data: &[u8]) -> Result<(), Error>;
    fn mkdir(&mut self, path: &str, parents: bool) -> Result<(), Error>;
    fn remove(&mut self, path: &str, recursive: bool) -> Result<(), Error>;
    fn rename(&mut self, old: &str, new: &str) -> Result<(), Error>;
    fn df(&self) -> Result<DiskUsage, Error>;
    /// Increases the volume's reported block count to `total_blocks`
    /// without touching any existing file's contents. Used after a
    /// partition-table resize has already grown the underlying partition.
    fn grow(&mut self, total_blocks: u32) -> Result<(), Error>;
}

/// Formats `device` as a fresh, empty LittleFS volume and persists it.
/// `MemFs` stands in for a real LittleFS driver, which this crate treats as
/// an external collaborator bound through [`BlockDevice`] and
/// [`FileSystem`].
pub fn mkfs(device: &mut dyn BlockDevice) -> Result<MemFs, Error> {
    let fs = MemFs::format(device.block_count(), device.block_size())?;
    fs.flush_to(device)?;
    Ok(fs)
}

/// Mounts the volume already persisted on `device` by [`mkfs`], or fails
/// with [`Error::FsError`] if it was never formatted.
pub fn mount(device: &mut dyn BlockDevice) -> Result<MemFs, Error> {
    MemFs::mount(device)
}

/// Resolves a `cp -r`-style copy target: if `dst` ends in `/` or already
/// names a directory, `src`'s basename is appended to it.
pub fn resolve_put_target(fs: &dyn FileSystem, src_name: &str, dst: &str) -> String {
    let dst_is_dir = dst.ends_with('/') || fs.ls(dst).is_ok();
    if dst_is_dir {
        format!("{}/{src_name}", dst.trim_end_matches('/'))
    } else {
        dst.to_string()
    }
}

/// Splits a directive path like `vfs2:/dir/file` into its partition name
/// (defaulting to `"vfs"` when absent) and the in-filesystem path.
pub fn split_partition_path(token: &str) -> (&str, &str) {
    match token.split_once(':') {
        Some((partition, path)) => (partition, path),
        None => ("vfs", token),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_partition_path_defaults_to_vfs() {
        assert_eq!(split_partition_path("/dir/file"), ("vfs", "/dir/file"));
        assert_eq!(split_partition_path("vfs2:/dir"), ("vfs2", "/dir"));
    }

    #[test]
    fn resolve_put_target_appends_basename_for_an_empty_existing_directory() {
        let mut fs = MemFs::format(16, 4096).unwrap();
        fs.mkdir("/a", false).unwrap();
        assert_eq!(resolve_put_target(&fs, "f.txt", "/a"), "/a/f.txt");
        assert_eq!(resolve_put_target(&fs, "f.txt", "/a/new.txt"), "/a/new.txt");
    }
}
