//! Firmware facade
//!
//! The single entry point the CLI (and library consumers) drive: opens a
//! target (a file or a live device), exposes the bootloader header and
//! partition table, and carries out every [`Directive`] against it. Mirrors
//! the role `espflash`'s connection/flasher pair plays for its teacher
//! codebase, collapsed into one object per the crate's "single capability
//! set" design rather than a handful of polymorphic collaborators.

use std::{
    fs,
    path::{Path, PathBuf},
};

use log::{debug, info, warn};

use crate::{
    directive::{Directive, TableDirective, TrimMode},
    error::Error,
    flash_io::{DeviceFlashIo, FileFlashIo, FlashIo, StubTransport},
    fs::{split_partition_path, BlockDevice, FileSystem, PartitionBlockDevice},
    image_header::ImageHeader,
    ota::Ota,
    partition::{PartitionRecord, PartitionTable, SubType, Type, BLOCK_ALIGN, TABLE_LENGTH, TABLE_OFFSET},
    partition_io::PartitionIo,
    progress::ProgressCallback,
    sizes::FlashSize,
};

const BOOTLOADER_OFFSET: u32 = 0x1000;

/// A named byte range this facade can resolve a partition-qualified path
/// against: a real table entry, or one of the two synthetic regions that
/// never appear in the partition table itself.
#[derive(Debug, Clone)]
enum Target {
    Bootloader,
    Table,
    Partition(PartitionRecord),
}

impl Target {
    fn offset(&self) -> u32 {
        match self {
            Target::Bootloader => BOOTLOADER_OFFSET,
            Target::Table => TABLE_OFFSET,
            Target::Partition(p) => p.offset,
        }
    }

    fn size(&self) -> u32 {
        match self {
            Target::Bootloader => TABLE_OFFSET - BOOTLOADER_OFFSET,
            Target::Table => TABLE_LENGTH as u32,
            Target::Partition(p) => p.size,
        }
    }
}

pub struct Firmware {
    io: Box<dyn FlashIo>,
    is_device: bool,
    header: ImageHeader,
    table: PartitionTable,
}

impl Firmware {
    /// Opens an on-disk image file, parsing the bootloader header and
    /// partition table already present in it.
    pub fn open_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let len = fs::metadata(path)
            .map_err(|source| Error::Io {
                path: path.to_path_buf(),
                source,
            })?
            .len();
        let mut io: Box<dyn FlashIo> = Box::new(FileFlashIo::open(path, len)?);
        let (header, table) = Self::read_header_and_table(io.as_mut(), len)?;
        Ok(Firmware {
            io,
            is_device: false,
            header,
            table,
        })
    }

    /// Creates a brand-new, blank image file of `size` and installs a
    /// minimal default header so a `--table` directive has something to
    /// replace.
    pub fn create_file(path: impl AsRef<Path>, size: FlashSize) -> Result<Self, Error> {
        let mut io: Box<dyn FlashIo> = Box::new(FileFlashIo::create(path, size.bytes())?);
        let mut header = ImageHeader::default();
        header.set_flash_size(size);
        io.write(BOOTLOADER_OFFSET, &header.emit())?;
        let table = PartitionTable::new(Vec::new(), size.bytes());
        io.write(TABLE_OFFSET, &table.emit()?)?;
        Ok(Firmware {
            io,
            is_device: false,
            header,
            table,
        })
    }

    /// Connects to a live device through a bootloader stub transport.
    pub fn open_device(transport: Box<dyn StubTransport>) -> Result<Self, Error> {
        let mut io: Box<dyn FlashIo> = Box::new(DeviceFlashIo::connect(transport)?);
        let capacity = io.capacity();
        let (header, table) = Self::read_header_and_table(io.as_mut(), capacity)?;
        Ok(Firmware {
            io,
            is_device: true,
            header,
            table,
        })
    }

    fn read_header_and_table(io: &mut dyn FlashIo, flash_size: u64) -> Result<(ImageHeader, PartitionTable), Error> {
        let header_bytes = io.read(BOOTLOADER_OFFSET, ImageHeader::SIZE)?;
        let header = ImageHeader::parse(&header_bytes)?;
        let table_bytes = io.read(TABLE_OFFSET, TABLE_LENGTH)?;
        let table = PartitionTable::parse(&table_bytes, flash_size)
            .unwrap_or_else(|_| PartitionTable::new(Vec::new(), flash_size));
        Ok((header, table))
    }

    pub fn header(&self) -> &ImageHeader {
        &self.header
    }

    pub fn table(&self) -> &PartitionTable {
        &self.table
    }

    pub fn set_progress(&mut self, callback: Option<ProgressCallback>) {
        self.io.set_progress(callback);
    }

    /// Resolves a partition name, or one of the synthetic names
    /// `"bootloader"` and `"partition_table"`, to a byte range.
    fn find_by_name(&self, name: &str) -> Result<Target, Error> {
        match name {
            "bootloader" => Ok(Target::Bootloader),
            "partition_table" => Ok(Target::Table),
            other => self
                .table
                .find(other)
                .cloned()
                .map(Target::Partition)
                .ok_or_else(|| Error::NotFound(other.to_string())),
        }
    }

    fn view(&mut self, name: &str) -> Result<PartitionIo<'_>, Error> {
        let target = self.find_by_name(name)?;
        Ok(PartitionIo::new(self.io.as_mut(), target.offset(), target.size()))
    }

    /// Runs every directive in `directives`. Table-affecting directives are
    /// batched and planned together, in their relative order, before any
    /// I/O directive runs; this matches how a single command line mixing
    /// `--resize` and `--read` flags is expected to behave; the resize is
    /// visible to every following read/write regardless of argument order.
    pub fn run(&mut self, directives: &[Directive]) -> Result<Vec<String>, Error> {
        let table_directives: Vec<TableDirective> = directives
            .iter()
            .filter_map(|d| match d {
                Directive::Table(t) => Some(t.clone()),
                _ => None,
            })
            .collect();

        let touched = if table_directives.is_empty() {
            Vec::new()
        } else {
            self.apply_table(&table_directives)?
        };

        for directive in directives {
            match directive {
                Directive::Table(_) => {}
                Directive::Read { name, path, trim } => self.read_partition(name, path, *trim)?,
                Directive::Write { name, path } => self.write_partition(name, path)?,
                Directive::Erase(names) => {
                    for name in names {
                        self.view(name)?.erase_all()?;
                    }
                }
                Directive::EraseFs(names) => {
                    for name in names {
                        self.format_fs(name)?;
                    }
                }
                Directive::ExtractApp { partition, path } => self.extract_app(partition.as_deref(), path)?,
                Directive::OtaUpdate(path) => self.ota_update(path)?,
                Directive::Flash(path) => self.reflash(path)?,
                Directive::Fs(args) => self.dispatch_fs(args)?,
            }
        }

        self.io.flush()?;
        Ok(touched)
    }

    /// Applies a planning pass and writes the result back. Device backends
    /// blank-erase the first block of every touched data partition, relying
    /// on the caller to repopulate it; file backends instead carry forward
    /// the overlapping byte range of each renamed-in-place or resized data
    /// partition, so a grown `vfs` keeps its existing files.
    fn apply_table(&mut self, directives: &[TableDirective]) -> Result<Vec<String>, Error> {
        let old_table = self.table.clone();
        let plan = crate::planner::plan(&old_table, directives)?;

        if self.is_device {
            let bytes = plan.table.emit()?;
            self.io.write(TABLE_OFFSET, &bytes)?;
            for name in &plan.touched {
                if let Some(p) = plan.table.find(name) {
                    debug!("auto-erasing touched partition {name:?} at {:#x}", p.offset);
                    self.io.erase(p.offset, BLOCK_ALIGN as usize)?;
                }
            }
        } else {
            for new in plan.table.partitions() {
                if new.is_app() {
                    continue;
                }
                if let Some(old) = old_table.find(&new.name) {
                    if old.offset != new.offset || old.size != new.size {
                        debug!(
                            "carrying forward {:?}: {:#x}/{:#x} -> {:#x}/{:#x}",
                            new.name, old.offset, old.size, new.offset, new.size
                        );
                        self.carry_forward(old, new)?;
                    }
                }
            }
            let bytes = plan.table.emit()?;
            self.io.write(TABLE_OFFSET, &bytes)?;
        }

        if let Some(TableDirective::ResizeFlash(new_size)) = directives
            .iter()
            .rev()
            .find(|d| matches!(d, TableDirective::ResizeFlash(_)))
        {
            let size = FlashSize::from_bytes(*new_size)?;
            if self.is_device && *new_size < self.io.capacity() {
                warn!(
                    "--flash-size requests {size} ({new_size:#x} bytes), smaller than the \
                     {:#x} bytes the device itself reports; this only limits how much of the \
                     device esppart is willing to address, it does not shrink the chip",
                    self.io.capacity()
                );
            }
            info!("overriding flash size to {size} ({new_size:#x} bytes)");
            self.header.set_flash_size(size);

            let mut bootloader = self.io.read(BOOTLOADER_OFFSET, (TABLE_OFFSET - BOOTLOADER_OFFSET) as usize)?;
            bootloader[..ImageHeader::SIZE].copy_from_slice(&self.header.emit());
            if self.header.hash_appended() {
                let end = ImageHeader::size_of_image(&bootloader)?;
                debug!("re-hashing bootloader image ({end} bytes) after flash-size patch");
                ImageHeader::rehash(&mut bootloader, end)?;
            }
            self.io.write(BOOTLOADER_OFFSET, &bootloader)?;
        }

        self.table = plan.table;
        Ok(plan.touched)
    }

    /// Copies the overlapping byte range of a data partition from its old
    /// location to its new one, blank-filling the rest of the new range.
    fn carry_forward(&mut self, old: &PartitionRecord, new: &PartitionRecord) -> Result<(), Error> {
        let overlap = (old.size).min(new.size) as usize;
        let data = self.io.read(old.offset, overlap)?;
        self.io.erase(new.offset, new.size as usize)?;
        self.io.write(new.offset, &data)
    }

    fn read_partition(&mut self, name: &str, path: &Path, trim: TrimMode) -> Result<(), Error> {
        let mut view = self.view(name)?;
        let data = match trim {
            TrimMode::None => view.read_all()?,
            TrimMode::Trim => view.trim()?,
            TrimMode::TrimBlocks => view.trim_blocks()?,
        };
        fs::write(path, data).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    fn write_partition(&mut self, name: &str, path: &Path) -> Result<(), Error> {
        let data = fs::read(path).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let is_app = matches!(self.find_by_name(name)?, Target::Partition(p) if p.is_app());
        if is_app {
            self.view(name)?.write_app_image(&data)
        } else {
            self.view(name)?.truncate_write(&data)
        }
    }

    fn extract_app(&mut self, partition: Option<&str>, path: &Path) -> Result<(), Error> {
        let name = match partition {
            Some(name) => name.to_string(),
            None => self.booted_app_partition()?,
        };
        let image = self.view(&name)?.read_all()?;
        let len = ImageHeader::size_of_image(&image)?;
        fs::write(path, &image[..len]).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Recomputes the SHA-256 digest trailing the currently booted app
    /// image and compares it against the one stored there, returning
    /// `false` on a mismatch rather than an error.
    pub fn verify_app(&mut self) -> Result<bool, Error> {
        let name = self.booted_app_partition()?;
        let image = self.view(&name)?.read_all()?;
        let end = ImageHeader::size_of_image(&image)?;
        ImageHeader::validate_hash(&image, end)
    }

    /// Name of the app partition the `otadata` slot selection currently
    /// points at, or the sole `factory` partition if there is no OTA set.
    fn booted_app_partition(&mut self) -> Result<String, Error> {
        if let Some(otadata) = self.table.find("otadata").cloned() {
            let mut view = PartitionIo::new(self.io.as_mut(), otadata.offset, otadata.size);
            let mut ota = Ota::new(&mut view)?;
            let slot = ota.current_slot()?;
            let n = slot.number().unwrap_or(0);
            return self
                .table
                .partitions()
                .iter()
                .find(|p| matches!(p.sub_type, SubType::App(crate::partition::AppSubType::Ota(s)) if s == n))
                .map(|p| p.name.clone())
                .ok_or_else(|| Error::NotFound(format!("ota_{n}")));
        }
        self.table
            .partitions()
            .iter()
            .find(|p| p.is_app())
            .map(|p| p.name.clone())
            .ok_or_else(|| Error::layout(crate::error::LayoutReason::NoAppPartition, "table"))
    }

    /// Writes `path`'s contents into the OTA slot that is not currently
    /// selected, then selects it, leaving the previously running slot
    /// untouched until the new one is confirmed.
    fn ota_update(&mut self, path: &Path) -> Result<(), Error> {
        let image = fs::read(path).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let otadata = self
            .table
            .find("otadata")
            .cloned()
            .ok_or_else(|| Error::layout(crate::error::LayoutReason::MissingOtadata, "table"))?;

        let target_number = {
            let mut view = PartitionIo::new(self.io.as_mut(), otadata.offset, otadata.size);
            let mut ota = Ota::new(&mut view)?;
            ota.next_update_slot()?
        };

        let target_name = self
            .table
            .partitions()
            .iter()
            .find(|p| matches!(p.sub_type, SubType::App(crate::partition::AppSubType::Ota(n)) if Some(n) == target_number.number()))
            .map(|p| p.name.clone())
            .ok_or_else(|| Error::NotFound("no free ota_N partition".into()))?;

        self.view(&target_name)?.write_app_image(&image)?;

        let mut view = PartitionIo::new(self.io.as_mut(), otadata.offset, otadata.size);
        let mut ota = Ota::new(&mut view)?;
        ota.set_current_slot(target_number)
    }

    /// Overwrites the whole image with the contents of `path`, then
    /// re-parses the bootloader header and partition table from it.
    fn reflash(&mut self, path: &Path) -> Result<(), Error> {
        let image = fs::read(path).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
        self.io.write(0, &image)?;
        let capacity = self.io.capacity();
        let (header, table) = Self::read_header_and_table(self.io.as_mut(), capacity)?;
        self.header = header;
        self.table = table;
        Ok(())
    }

    fn format_fs(&mut self, name: &str) -> Result<(), Error> {
        let target = self.find_by_name(name)?;
        let mut view = PartitionIo::new(self.io.as_mut(), target.offset(), target.size());
        let mut device = PartitionBlockDevice::new(&mut view);
        crate::fs::mkfs(&mut device)?;
        Ok(())
    }

    /// Dispatches a pre-split `--fs OP ARGS...` directive against the
    /// `FileSystem` this module is built against; see the `fs` module's
    /// [`crate::fs::MemFs`] stand-in for a real LittleFS driver.
    fn dispatch_fs(&mut self, args: &[String]) -> Result<(), Error> {
        let (op, rest) = args
            .split_first()
            .ok_or_else(|| Error::user("fs", "missing fs subcommand"))?;

        match op.as_str() {
            "mkfs" => {
                let partition = rest.first().map(String::as_str).unwrap_or("vfs").to_string();
                return self.format_fs(&partition);
            }
            "grow" => {
                let partition = rest.first().map(String::as_str).unwrap_or("vfs").to_string();
                let block_count = rest
                    .get(1)
                    .map(|s| s.parse::<u32>().map_err(|_| Error::user(s.as_str(), "expected a block count")))
                    .transpose()?;
                let target = self.find_by_name(&partition)?;
                let mut view = PartitionIo::new(self.io.as_mut(), target.offset(), target.size());
                let mut device = PartitionBlockDevice::new(&mut view);
                let mut volume = crate::fs::mount(&mut device)?;
                let total_blocks = block_count.unwrap_or_else(|| device.block_count());
                volume.grow(total_blocks)?;
                return volume.flush_to(&mut device);
            }
            "put" => {
                let src = rest.first().ok_or_else(|| Error::user("fs", "put requires a source path"))?;
                let dst_token = rest.get(1).ok_or_else(|| Error::user("fs", "put requires a destination"))?;
                let data = fs::read(src).map_err(|source| Error::Io {
                    path: PathBuf::from(src),
                    source,
                })?;
                let (partition, fs_dst) = split_partition_path(dst_token);
                let partition = partition.to_string();
                let fs_dst = fs_dst.to_string();
                let target = self.find_by_name(&partition)?;
                let mut view = PartitionIo::new(self.io.as_mut(), target.offset(), target.size());
                let mut device = PartitionBlockDevice::new(&mut view);
                let mut volume = crate::fs::mount(&mut device)?;
                let src_name = Path::new(src).file_name().and_then(|n| n.to_str()).unwrap_or(src);
                let resolved = crate::fs::resolve_put_target(&volume, src_name, &fs_dst);
                volume.write_file(&resolved, &data)?;
                return volume.flush_to(&mut device);
            }
            "get" => {
                let src_token = rest.first().ok_or_else(|| Error::user("fs", "get requires a source path"))?;
                let dst = rest.get(1).ok_or_else(|| Error::user("fs", "get requires a destination"))?;
                let (partition, fs_src) = split_partition_path(src_token);
                let partition = partition.to_string();
                let fs_src = fs_src.to_string();
                let target = self.find_by_name(&partition)?;
                let mut view = PartitionIo::new(self.io.as_mut(), target.offset(), target.size());
                let mut device = PartitionBlockDevice::new(&mut view);
                let mut volume = crate::fs::mount(&mut device)?;
                let data = volume.cat(&fs_src)?;
                return fs::write(dst, &data).map_err(|source| Error::Io {
                    path: PathBuf::from(dst),
                    source,
                });
            }
            _ => {}
        }

        let path_arg = rest.first().map(String::as_str).unwrap_or("/");
        let (partition, fs_path) = split_partition_path(path_arg);
        let partition = partition.to_string();
        let fs_path = fs_path.to_string();
        let target = self.find_by_name(&partition)?;
        let mut view = PartitionIo::new(self.io.as_mut(), target.offset(), target.size());
        let mut device = PartitionBlockDevice::new(&mut view);
        let mut volume = crate::fs::mount(&mut device)?;

        match op.as_str() {
            "ls" => {
                for entry in volume.ls(&fs_path)? {
                    let suffix = if entry.is_dir { "/" } else { "" };
                    println!("{}{suffix}\t{}", entry.name, entry.size);
                }
            }
            "cat" => {
                use std::io::Write;
                std::io::stdout().write_all(&volume.cat(&fs_path)?).map_err(|source| Error::Io {
                    path: PathBuf::from(&fs_path),
                    source,
                })?;
            }
            "mkdir" => {
                volume.mkdir(&fs_path, true)?;
                volume.flush_to(&mut device)?;
            }
            "rm" => {
                volume.remove(&fs_path, true)?;
                volume.flush_to(&mut device)?;
            }
            "rename" => {
                let dst = rest
                    .get(1)
                    .cloned()
                    .ok_or_else(|| Error::user("fs", "rename requires a destination"))?;
                volume.rename(&fs_path, &dst)?;
                volume.flush_to(&mut device)?;
            }
            "df" => {
                let usage = volume.df()?;
                println!("{}/{} blocks used ({} bytes/block)", usage.used_blocks, usage.total_blocks, usage.block_size);
            }
            other => return Err(Error::user("fs", format!("unknown fs subcommand {other:?}"))),
        }
        Ok(())
    }
}

impl Drop for Firmware {
    fn drop(&mut self) {
        let _ = self.io.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn create_then_reopen_round_trips_header_and_table() {
        let tmp = NamedTempFile::new().unwrap();
        {
            let fw = Firmware::create_file(tmp.path(), FlashSize::_4Mb).unwrap();
            assert_eq!(fw.header().flash_size().unwrap(), FlashSize::_4Mb);
        }
        let fw = Firmware::open_file(tmp.path()).unwrap();
        assert_eq!(fw.header().flash_size().unwrap(), FlashSize::_4Mb);
        assert!(fw.table().partitions().is_empty());
    }

    #[test]
    fn read_and_write_partition_round_trip() {
        let tmp = NamedTempFile::new().unwrap();
        let mut fw = Firmware::create_file(tmp.path(), FlashSize::_4Mb).unwrap();
        fw.table = PartitionTable::new(
            vec![PartitionRecord::new(
                "nvs",
                Type::Data,
                SubType::Data(crate::partition::DataSubType::Nvs),
                0x9000,
                0x6000,
            )],
            4 << 20,
        );

        let src = NamedTempFile::new().unwrap();
        std::fs::write(src.path(), b"settings blob").unwrap();
        fw.write_partition("nvs", src.path()).unwrap();

        let dst = NamedTempFile::new().unwrap();
        fw.read_partition("nvs", dst.path(), TrimMode::None).unwrap();
        let roundtrip = std::fs::read(dst.path()).unwrap();
        assert_eq!(&roundtrip[..13], b"settings blob");
    }
}
