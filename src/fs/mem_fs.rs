//! In-memory filesystem test double
//!
//! Stands in for a real LittleFS driver so the `fs:` directive dispatch and
//! path-resolution logic (see [`super::resolve_put_target`]) can be tested
//! without one. Tracks block usage against the block device it was formatted
//! over purely for [`FileSystem::df`]; it does not actually touch the
//! device's blocks.

use std::collections::BTreeMap;

use crate::error::Error;

use super::{BlockDevice, DirEntry, DiskUsage, FileSystem};

const MAGIC: [u8; 4] = *b"MFS1";

fn corrupt() -> Error {
    Error::FsError("corrupt littlefs adapter image".into())
}

#[derive(Debug, Clone)]
enum Node {
    File(Vec<u8>),
    Dir,
}

/// An in-memory filesystem, keyed by absolute path (always starting with
/// `/`). Directories are represented by explicit `Dir` entries so `ls` and
/// `mkdir -p` behave the way a real volume's metadata would.
pub struct MemFs {
    nodes: BTreeMap<String, Node>,
    total_blocks: u32,
    block_size: u32,
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

fn parent_of(path: &str) -> String {
    match path.rfind('/') {
        Some(0) => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
        None => "/".to_string(),
    }
}

impl MemFs {
    pub fn format(total_blocks: u32, block_size: u32) -> Result<Self, Error> {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), Node::Dir);
        Ok(MemFs {
            nodes,
            total_blocks,
            block_size,
        })
    }

    /// Mounts an already-formatted volume for testing, bypassing
    /// [`BlockDevice`] entirely.
    #[cfg(test)]
    pub fn mounted_empty(device: &dyn BlockDevice) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), Node::Dir);
        MemFs {
            nodes,
            total_blocks: device.block_count(),
            block_size: device.block_size(),
        }
    }

    /// Serializes every node into a private binary blob this adapter alone
    /// understands. Not a real LittleFS image — there is no driver for one
    /// in this crate — but it lets `mkfs`/`mount` round-trip through a
    /// partition's actual blocks instead of vanishing between calls.
    fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&MAGIC);
        buf.extend_from_slice(&self.total_blocks.to_le_bytes());
        buf.extend_from_slice(&self.block_size.to_le_bytes());
        buf.extend_from_slice(&(self.nodes.len() as u32).to_le_bytes());
        for (path, node) in &self.nodes {
            let path_bytes = path.as_bytes();
            buf.extend_from_slice(&(path_bytes.len() as u16).to_le_bytes());
            buf.extend_from_slice(path_bytes);
            match node {
                Node::Dir => buf.push(0),
                Node::File(data) => {
                    buf.push(1);
                    buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
                    buf.extend_from_slice(data);
                }
            }
        }
        buf
    }

    fn deserialize(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < 16 || bytes[0..4] != MAGIC {
            return Err(Error::FsError(
                "partition does not hold a formatted volume".into(),
            ));
        }
        let total_blocks = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        let block_size = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        let count = u32::from_le_bytes(bytes[12..16].try_into().unwrap());

        let mut nodes = BTreeMap::new();
        let mut offset = 16usize;
        for _ in 0..count {
            let name_len =
                u16::from_le_bytes(bytes.get(offset..offset + 2).ok_or_else(corrupt)?.try_into().unwrap())
                    as usize;
            offset += 2;
            let name = String::from_utf8(bytes.get(offset..offset + name_len).ok_or_else(corrupt)?.to_vec())
                .map_err(|_| corrupt())?;
            offset += name_len;
            let kind = *bytes.get(offset).ok_or_else(corrupt)?;
            offset += 1;
            let node = match kind {
                0 => Node::Dir,
                1 => {
                    let len = u32::from_le_bytes(
                        bytes.get(offset..offset + 4).ok_or_else(corrupt)?.try_into().unwrap(),
                    ) as usize;
                    offset += 4;
                    let data = bytes.get(offset..offset + len).ok_or_else(corrupt)?.to_vec();
                    offset += len;
                    Node::File(data)
                }
                _ => return Err(corrupt()),
            };
            nodes.insert(name, node);
        }

        Ok(MemFs {
            nodes,
            total_blocks,
            block_size,
        })
    }

    /// Reads every block of `device` and reconstructs the volume previously
    /// written by [`MemFs::flush_to`].
    pub fn mount(device: &mut dyn BlockDevice) -> Result<Self, Error> {
        let mut blob = Vec::new();
        for i in 0..device.block_count() {
            blob.extend_from_slice(&device.read_block(i)?);
        }
        Self::deserialize(&blob)
    }

    /// Serializes the volume and writes it across `device`'s blocks,
    /// `0xFF`-padding the remainder.
    pub fn flush_to(&self, device: &mut dyn BlockDevice) -> Result<(), Error> {
        let capacity = device.block_count() as usize * device.block_size() as usize;
        let mut blob = self.serialize();
        if blob.len() > capacity {
            return Err(Error::FsError(
                "filesystem contents no longer fit in the partition".into(),
            ));
        }
        blob.resize(capacity, 0xFF);
        for i in 0..device.block_count() {
            let start = i as usize * device.block_size() as usize;
            let end = start + device.block_size() as usize;
            device.write_block(i, &blob[start..end])?;
        }
        Ok(())
    }

    fn used_blocks(&self) -> u32 {
        let bytes: usize = self
            .nodes
            .values()
            .map(|n| match n {
                Node::File(data) => data.len(),
                Node::Dir => 0,
            })
            .sum();
        (bytes as u32).div_ceil(self.block_size.max(1))
    }
}

impl FileSystem for MemFs {
    fn ls(&self, path: &str) -> Result<Vec<DirEntry>, Error> {
        let path = normalize(path);
        match self.nodes.get(&path) {
            Some(Node::Dir) => {}
            Some(Node::File(_)) => {
                return Err(Error::FsError(format!("{path} is a file, not a directory")))
            }
            None => return Err(Error::FsError(format!("{path}: no such file or directory"))),
        }

        let prefix = if path == "/" { "/".to_string() } else { format!("{path}/") };
        let mut entries = Vec::new();
        for (candidate, node) in &self.nodes {
            if candidate == &path {
                continue;
            }
            if let Some(rest) = candidate.strip_prefix(&prefix) {
                if !rest.is_empty() && !rest.contains('/') {
                    entries.push(DirEntry {
                        name: rest.to_string(),
                        is_dir: matches!(node, Node::Dir),
                        size: match node {
                            Node::File(data) => data.len() as u64,
                            Node::Dir => 0,
                        },
                    });
                }
            }
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn cat(&self, path: &str) -> Result<Vec<u8>, Error> {
        let path = normalize(path);
        match self.nodes.get(&path) {
            Some(Node::File(data)) => Ok(data.clone()),
            Some(Node::Dir) => Err(Error::FsError(format!("{path} is a directory"))),
            None => Err(Error::FsError(format!("{path}: no such file or directory"))),
        }
    }

    fn write_file(&mut self, path: &str, data: &[u8]) -> Result<(), Error> {
        let path = normalize(path);
        let parent = parent_of(&path);
        if !matches!(self.nodes.get(&parent), Some(Node::Dir)) {
            return Err(Error::FsError(format!(
                "{parent}: no such directory (create it with mkdir first)"
            )));
        }
        self.nodes.insert(path, Node::File(data.to_vec()));
        Ok(())
    }

    fn mkdir(&mut self, path: &str, parents: bool) -> Result<(), Error> {
        let path = normalize(path);
        if parents {
            let mut built = String::new();
            for segment in path.split('/').filter(|s| !s.is_empty()) {
                built.push('/');
                built.push_str(segment);
                self.nodes.entry(built.clone()).or_insert(Node::Dir);
            }
            return Ok(());
        }
        let parent = parent_of(&path);
        if !matches!(self.nodes.get(&parent), Some(Node::Dir)) {
            return Err(Error::FsError(format!("{parent}: no such directory")));
        }
        if self.nodes.contains_key(&path) {
            return Err(Error::FsError(format!("{path}: already exists")));
        }
        self.nodes.insert(path, Node::Dir);
        Ok(())
    }

    fn remove(&mut self, path: &str, recursive: bool) -> Result<(), Error> {
        let path = normalize(path);
        if path == "/" {
            return Err(Error::FsError("cannot remove the root directory".into()));
        }
        match self.nodes.get(&path) {
            None => return Err(Error::FsError(format!("{path}: no such file or directory"))),
            Some(Node::Dir) => {
                let prefix = format!("{path}/");
                let has_children = self.nodes.keys().any(|k| k.starts_with(&prefix));
                if has_children && !recursive {
                    return Err(Error::FsError(format!("{path}: directory not empty")));
                }
                self.nodes.retain(|k, _| !(k == &path || k.starts_with(&prefix)));
            }
            Some(Node::File(_)) => {
                self.nodes.remove(&path);
            }
        }
        Ok(())
    }

    fn rename(&mut self, old: &str, new: &str) -> Result<(), Error> {
        let old = normalize(old);
        let new = normalize(new);
        let moved: Vec<(String, Node)> = self
            .nodes
            .iter()
            .filter(|(k, _)| **k == old || k.starts_with(&format!("{old}/")))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if moved.is_empty() {
            return Err(Error::FsError(format!("{old}: no such file or directory")));
        }
        for (path, node) in moved {
            let renamed = format!("{new}{}", &path[old.len()..]);
            self.nodes.remove(&path);
            self.nodes.insert(renamed, node);
        }
        Ok(())
    }

    fn df(&self) -> Result<DiskUsage, Error> {
        Ok(DiskUsage {
            used_blocks: self.used_blocks(),
            total_blocks: self.total_blocks,
            block_size: self.block_size,
        })
    }

    fn grow(&mut self, total_blocks: u32) -> Result<(), Error> {
        if total_blocks < self.total_blocks {
            return Err(Error::FsError(format!(
                "grow cannot shrink the volume from {} to {total_blocks} blocks",
                self.total_blocks
            )));
        }
        self.total_blocks = total_blocks;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_cat_round_trips() {
        let mut fs = MemFs::format(16, 4096).unwrap();
        fs.write_file("/boot.py", b"print('hi')").unwrap();
        assert_eq!(fs.cat("/boot.py").unwrap(), b"print('hi')");
    }

    #[test]
    fn mkdir_parents_creates_intermediate_directories() {
        let mut fs = MemFs::format(16, 4096).unwrap();
        fs.mkdir("/a/b/c", true).unwrap();
        let entries = fs.ls("/a/b").unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].is_dir);
    }

    #[test]
    fn remove_nonempty_dir_requires_recursive() {
        let mut fs = MemFs::format(16, 4096).unwrap();
        fs.mkdir("/a", false).unwrap();
        fs.write_file("/a/f.txt", b"x").unwrap();
        assert!(fs.remove("/a", false).is_err());
        fs.remove("/a", true).unwrap();
        assert!(fs.ls("/").unwrap().is_empty());
    }

    #[test]
    fn rename_moves_a_subtree() {
        let mut fs = MemFs::format(16, 4096).unwrap();
        fs.mkdir("/a", false).unwrap();
        fs.write_file("/a/f.txt", b"x").unwrap();
        fs.rename("/a", "/b").unwrap();
        assert_eq!(fs.cat("/b/f.txt").unwrap(), b"x");
        assert!(fs.cat("/a/f.txt").is_err());
    }

    #[test]
    fn df_reports_used_blocks() {
        let mut fs = MemFs::format(16, 4096).unwrap();
        fs.write_file("/f", &vec![0u8; 5000]).unwrap();
        let usage = fs.df().unwrap();
        assert_eq!(usage.used_blocks, 2);
        assert_eq!(usage.total_blocks, 16);
    }

    #[test]
    fn flush_to_and_mount_round_trip_through_a_device() {
        use crate::flash_io::FileFlashIo;
        use crate::partition_io::PartitionIo;
        use crate::fs::PartitionBlockDevice;
        use tempfile::NamedTempFile;

        let tmp = NamedTempFile::new().unwrap();
        let mut io = FileFlashIo::create(tmp.path(), 0x20000).unwrap();

        {
            let mut view = PartitionIo::new(&mut io, 0, 0x10000);
            let mut device = PartitionBlockDevice::new(&mut view);
            let mut fs = MemFs::format(device.block_count(), device.block_size()).unwrap();
            fs.mkdir("/a", false).unwrap();
            fs.write_file("/a/f.txt", b"hello").unwrap();
            fs.flush_to(&mut device).unwrap();
        }
        {
            let mut view = PartitionIo::new(&mut io, 0, 0x10000);
            let mut device = PartitionBlockDevice::new(&mut view);
            let mut mounted = MemFs::mount(&mut device).unwrap();
            assert_eq!(mounted.cat("/a/f.txt").unwrap(), b"hello");
            mounted.write_file("/a/g.txt", b"world").unwrap();
            mounted.flush_to(&mut device).unwrap();
        }
        {
            let mut view = PartitionIo::new(&mut io, 0, 0x10000);
            let mut device = PartitionBlockDevice::new(&mut view);
            let mounted = MemFs::mount(&mut device).unwrap();
            assert_eq!(mounted.cat("/a/g.txt").unwrap(), b"world");
        }
    }

    #[test]
    fn mount_rejects_an_unformatted_device() {
        use crate::flash_io::FileFlashIo;
        use crate::partition_io::PartitionIo;
        use crate::fs::PartitionBlockDevice;
        use tempfile::NamedTempFile;

        let tmp = NamedTempFile::new().unwrap();
        let mut io = FileFlashIo::create(tmp.path(), 0x10000).unwrap();
        let mut view = PartitionIo::new(&mut io, 0, 0x10000);
        let mut device = PartitionBlockDevice::new(&mut view);
        assert!(MemFs::mount(&mut device).is_err());
    }

    #[test]
    fn grow_raises_total_blocks_without_touching_files() {
        let mut fs = MemFs::format(16, 4096).unwrap();
        fs.write_file("/f", b"x").unwrap();
        fs.grow(32).unwrap();
        assert_eq!(fs.df().unwrap().total_blocks, 32);
        assert_eq!(fs.cat("/f").unwrap(), b"x");
        assert!(fs.grow(8).is_err());
    }
}
