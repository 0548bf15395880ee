//! Binary partition-table codec
//!
//! The table is a sequence of 32-byte [`PartitionRecord`]s starting at flash
//! offset `0x8000`, terminated by the first record whose magic isn't
//! `0x50AA`. When that terminator's first two bytes are `0xEBEB` it is an MD5
//! record: the MD5 digest of every preceding record's bytes. The region is
//! exactly [`TABLE_LENGTH`] (0xC00) bytes and is 0xFF-padded after the MD5
//! record.

use std::io::Write;

use md5::{Digest, Md5};
use strum::Display;

use crate::error::Error;

/// Default flash offset of the partition-table region.
pub const TABLE_OFFSET: u32 = 0x8000;
/// Fixed length of the partition-table region.
pub const TABLE_LENGTH: usize = 0xC00;
/// Size of one on-flash partition record.
pub const RECORD_SIZE: usize = 32;
/// Alignment required of every partition's offset and size.
pub const BLOCK_ALIGN: u32 = 0x1000;
/// Alignment required of `app`-type partition offsets.
pub const APP_ALIGN: u32 = 0x10000;

const PARTITION_MAGIC: u16 = 0x50AA;
const MD5_MAGIC: [u8; 2] = [0xEB, 0xEB];
/// Longest partition name the 16-byte name field can hold, excluding the
/// terminating NUL the codec always leaves room for.
pub const MAX_NAME_LEN: usize = 15;

/// `type` field of a [`PartitionRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Type {
    App,
    Data,
}

impl Type {
    fn as_u8(self) -> u8 {
        match self {
            Type::App => 0x00,
            Type::Data => 0x01,
        }
    }

    fn from_u8(value: u8) -> Result<Self, Error> {
        match value {
            0x00 => Ok(Type::App),
            0x01 => Ok(Type::Data),
            other => Err(Error::BadTable(format!("unknown partition type {other:#04x}"))),
        }
    }
}

/// `subtype` field of an `app`-type partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppSubType {
    Factory,
    Ota(u8),
    Test,
}

impl AppSubType {
    fn as_u8(self) -> u8 {
        match self {
            AppSubType::Factory => 0x00,
            AppSubType::Ota(n) => 0x10 + n,
            AppSubType::Test => 0x20,
        }
    }

    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(AppSubType::Factory),
            0x10..=0x1F => Some(AppSubType::Ota(value - 0x10)),
            0x20 => Some(AppSubType::Test),
            _ => None,
        }
    }

    fn name(self) -> String {
        match self {
            AppSubType::Factory => "factory".into(),
            AppSubType::Ota(n) => format!("ota_{n}"),
            AppSubType::Test => "test".into(),
        }
    }
}

/// `subtype` field of a `data`-type partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSubType {
    Ota,
    Nvs,
    Phy,
    NvsKeys,
    EFuse,
    CoreDump,
    Fat,
    Spiffs,
    Littlefs,
    Undefined,
}

impl DataSubType {
    fn as_u8(self) -> u8 {
        match self {
            DataSubType::Ota => 0x00,
            DataSubType::Phy => 0x01,
            DataSubType::Nvs => 0x02,
            DataSubType::CoreDump => 0x03,
            DataSubType::NvsKeys => 0x04,
            DataSubType::EFuse => 0x05,
            DataSubType::Undefined => 0x06,
            DataSubType::Fat => 0x81,
            DataSubType::Spiffs => 0x82,
            DataSubType::Littlefs => 0x83,
        }
    }

    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(DataSubType::Ota),
            0x01 => Some(DataSubType::Phy),
            0x02 => Some(DataSubType::Nvs),
            0x03 => Some(DataSubType::CoreDump),
            0x04 => Some(DataSubType::NvsKeys),
            0x05 => Some(DataSubType::EFuse),
            0x06 => Some(DataSubType::Undefined),
            0x81 => Some(DataSubType::Fat),
            0x82 => Some(DataSubType::Spiffs),
            0x83 => Some(DataSubType::Littlefs),
            _ => None,
        }
    }

    fn name(self) -> String {
        match self {
            DataSubType::Ota => "ota".into(),
            DataSubType::Nvs => "nvs".into(),
            DataSubType::Phy => "phy".into(),
            DataSubType::NvsKeys => "nvs_keys".into(),
            DataSubType::EFuse => "efuse".into(),
            DataSubType::CoreDump => "coredump".into(),
            DataSubType::Fat => "fat".into(),
            DataSubType::Spiffs => "spiffs".into(),
            DataSubType::Littlefs => "littlefs".into(),
            DataSubType::Undefined => "undefined".into(),
        }
    }
}

/// The `subtype` byte of a [`PartitionRecord`], interpreted against its
/// `type`. Unknown values are preserved numerically rather than rejected, per
/// the partition-table codec invariant that a round trip never loses data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubType {
    App(AppSubType),
    Data(DataSubType),
    /// A subtype byte this crate doesn't have a name for.
    Unknown(u8),
}

impl SubType {
    fn as_u8(self) -> u8 {
        match self {
            SubType::App(s) => s.as_u8(),
            SubType::Data(s) => s.as_u8(),
            SubType::Unknown(b) => b,
        }
    }

    /// Interprets a raw subtype byte against `ty`, falling back to
    /// [`SubType::Unknown`] for values this crate doesn't have a name for.
    pub fn decode(ty: Type, value: u8) -> Self {
        match ty {
            Type::App => AppSubType::from_u8(value)
                .map(SubType::App)
                .unwrap_or(SubType::Unknown(value)),
            Type::Data => DataSubType::from_u8(value)
                .map(SubType::Data)
                .unwrap_or(SubType::Unknown(value)),
        }
    }

    /// Human-readable subtype name, as printed in table listings.
    pub fn name(self) -> String {
        match self {
            SubType::App(s) => s.name(),
            SubType::Data(s) => s.name(),
            SubType::Unknown(b) => format!("{b:#04x}"),
        }
    }
}

/// One 32-byte entry in the partition table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionRecord {
    pub name: String,
    pub ty: Type,
    pub sub_type: SubType,
    pub offset: u32,
    pub size: u32,
    pub flags: u32,
}

impl PartitionRecord {
    pub fn new(name: impl Into<String>, ty: Type, sub_type: SubType, offset: u32, size: u32) -> Self {
        PartitionRecord {
            name: name.into(),
            ty,
            sub_type,
            offset,
            size,
            flags: 0,
        }
    }

    pub fn end(&self) -> u32 {
        self.offset + self.size
    }

    pub fn is_app(&self) -> bool {
        matches!(self.ty, Type::App)
    }

    pub fn is_ota_app(&self) -> bool {
        matches!(self.sub_type, SubType::App(AppSubType::Ota(_)))
    }

    pub fn is_otadata(&self) -> bool {
        matches!((self.ty, self.sub_type), (Type::Data, SubType::Data(DataSubType::Ota)))
    }

    fn parse(bytes: &[u8; RECORD_SIZE]) -> Result<Self, Error> {
        let magic = u16::from_le_bytes([bytes[0], bytes[1]]);
        if magic != PARTITION_MAGIC {
            return Err(Error::BadTable(format!(
                "partition record has bad magic {magic:#06x}"
            )));
        }
        let ty = Type::from_u8(bytes[2])?;
        let sub_type = SubType::decode(ty, bytes[3]);
        let offset = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        let size = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        let name_bytes = &bytes[12..28];
        let name_len = name_bytes.iter().position(|&b| b == 0).unwrap_or(16);
        let name = String::from_utf8_lossy(&name_bytes[..name_len]).into_owned();
        let flags = u32::from_le_bytes(bytes[28..32].try_into().unwrap());

        Ok(PartitionRecord {
            name,
            ty,
            sub_type,
            offset,
            size,
            flags,
        })
    }

    fn write<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_all(&PARTITION_MAGIC.to_le_bytes())?;
        w.write_all(&[self.ty.as_u8(), self.sub_type.as_u8()])?;
        w.write_all(&self.offset.to_le_bytes())?;
        w.write_all(&self.size.to_le_bytes())?;

        let mut name_bytes = [0u8; 16];
        for (dest, src) in name_bytes.iter_mut().zip(self.name.bytes().take(16)) {
            *dest = src;
        }
        w.write_all(&name_bytes)?;
        w.write_all(&self.flags.to_le_bytes())?;
        Ok(())
    }
}

/// The decoded contents of the 0xC00-byte partition-table region, plus the
/// flash metadata needed to validate it.
#[derive(Debug, Clone)]
pub struct PartitionTable {
    partitions: Vec<PartitionRecord>,
    pub flash_size: u64,
    pub table_offset: u32,
}

impl PartitionTable {
    pub fn new(partitions: Vec<PartitionRecord>, flash_size: u64) -> Self {
        PartitionTable {
            partitions,
            flash_size,
            table_offset: TABLE_OFFSET,
        }
    }

    pub fn partitions(&self) -> &[PartitionRecord] {
        &self.partitions
    }

    pub fn into_partitions(self) -> Vec<PartitionRecord> {
        self.partitions
    }

    pub fn find(&self, name: &str) -> Option<&PartitionRecord> {
        self.partitions.iter().find(|p| p.name == name)
    }

    /// Parses a table from the raw `0xC00`-byte region.
    pub fn parse(bytes: &[u8], flash_size: u64) -> Result<Self, Error> {
        if bytes.len() < TABLE_LENGTH {
            return Err(Error::BadTable(format!(
                "partition table region is {} bytes, need {TABLE_LENGTH}",
                bytes.len()
            )));
        }

        let mut partitions = Vec::new();
        let mut offset = 0usize;
        let mut md5_input_end = 0usize;

        loop {
            let chunk: &[u8; RECORD_SIZE] = bytes
                .get(offset..offset + RECORD_SIZE)
                .ok_or_else(|| {
                    Error::BadTable("no terminator record found before the end of the table region".into())
                })?
                .try_into()
                .expect("slice has exactly RECORD_SIZE bytes");
            let magic = u16::from_le_bytes([chunk[0], chunk[1]]);

            if magic == PARTITION_MAGIC {
                partitions.push(PartitionRecord::parse(chunk)?);
                md5_input_end = offset + RECORD_SIZE;
                offset += RECORD_SIZE;
                continue;
            }

            if chunk[0] == MD5_MAGIC[0] && chunk[1] == MD5_MAGIC[1] {
                let expected = Md5::digest(&bytes[..md5_input_end]);
                let stored = &bytes[offset + 16..offset + RECORD_SIZE];
                if expected.as_slice() != stored {
                    return Err(Error::BadTable(
                        "MD5 record does not match the preceding partitions".into(),
                    ));
                }
            }
            break;
        }

        Ok(PartitionTable::new(partitions, flash_size))
    }

    /// Serializes the table back to its `0xC00`-byte on-flash representation.
    pub fn emit(&self) -> Result<[u8; TABLE_LENGTH], Error> {
        let mut buf = Vec::with_capacity(TABLE_LENGTH);
        for partition in &self.partitions {
            partition
                .write(&mut buf)
                .map_err(|e| Error::BadTable(e.to_string()))?;
        }

        let digest = Md5::digest(&buf);
        buf.extend_from_slice(&MD5_MAGIC);
        buf.extend_from_slice(&[0xFF; 14]);
        buf.extend_from_slice(&digest);

        if buf.len() > TABLE_LENGTH {
            return Err(Error::BadTable(format!(
                "{} partitions do not fit in the {TABLE_LENGTH}-byte table region",
                self.partitions.len()
            )));
        }
        buf.resize(TABLE_LENGTH, 0xFF);

        let mut out = [0u8; TABLE_LENGTH];
        out.copy_from_slice(&buf);
        Ok(out)
    }
}
