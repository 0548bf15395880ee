//! Directive parsing
//!
//! Turns the string arguments accepted by the `esppart` command line (and,
//! in library use, passed directly to [`crate::Firmware`] methods) into the
//! typed [`Directive`] values the rest of the crate acts on. Kept separate
//! from `clap`'s own parsing: a `--resize name=size` argument is still just
//! a string pair until this module turns it into a byte count and validates
//! the partition name shape.

use std::path::PathBuf;

use regex::Regex;
use std::sync::OnceLock;

use crate::{
    error::Error,
    partition::{AppSubType, DataSubType, SubType, Type, MAX_NAME_LEN},
};

/// A parsed, partition-table-affecting directive, ready for [`crate::planner::plan`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableDirective {
    /// `--flash-size <size>`
    ResizeFlash(u64),
    /// `--table <default|original|ota>`
    TableTemplate(TableTemplate),
    /// `--table-csv <entries>`, already split into per-partition entries.
    TableLayout(Vec<LayoutEntry>),
    /// `--add <name>=<subtype>:<offset>:<size>` (offset is optional, type is
    /// inferred from the subtype)
    AddPart(AddSpec),
    /// `--delete <name>[,<name>...]`
    DeletePart(Vec<String>),
    /// `--resize <name>=<size>` (size 0 means "grow to next fixed partition")
    ResizePart { name: String, size: u32 },
    /// `--rename <old>=<new>`
    RenamePart { old: String, new: String },
    /// `--app-size <size>`
    AppSize(u32),
    /// `--from-csv <path>`, expanded into `TableLayout` before reaching the planner.
    FromCsv(PathBuf),
}

/// A complete directive, spanning both the table planner and I/O operations
/// dispatched directly against an open [`crate::Firmware`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    Table(TableDirective),
    /// `--read <name>=<path>`, optionally trimmed by `--trim`/`--trimblocks`
    Read { name: String, path: PathBuf, trim: TrimMode },
    /// `--write <name>=<path>`
    Write { name: String, path: PathBuf },
    /// `--erase <name>[,<name>...]`
    Erase(Vec<String>),
    /// `--erase-fs <name>[,<name>...]` (reformat rather than blank-erase)
    EraseFs(Vec<String>),
    /// `--extract-app [name]=<path>`, defaulting to the currently booted slot
    ExtractApp { partition: Option<String>, path: PathBuf },
    /// `--ota-update <path>`, writing an app image into the next OTA slot
    OtaUpdate(PathBuf),
    /// `--flash <path>` (overwrite the whole image with the contents of `path`)
    Flash(PathBuf),
    /// Filesystem sub-directives, e.g. `fs:ls:vfs:/` — parsed but dispatched
    /// by the `fs` module rather than the planner.
    Fs(Vec<String>),
}

/// How far a `--read` output is trimmed before being written to disk.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum TrimMode {
    /// The full partition, untouched.
    #[default]
    None,
    /// Up to a 16-byte boundary after the last non-`0xFF` byte.
    Trim,
    /// Up to a 4 KiB boundary after the last non-`0xFF` byte.
    TrimBlocks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableTemplate {
    Default,
    Original,
    Ota,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutEntry {
    pub name: String,
    pub ty: Type,
    pub sub_type: SubType,
    /// Size in bytes, or `0` for "grow to fill the remaining space".
    pub size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddSpec {
    pub name: String,
    pub sub_type: SubType,
    pub offset: Option<u32>,
    pub size: u32,
}

fn size_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^(0x[0-9a-f]+|[0-9]+)([bkm])?$").unwrap())
}

/// Parses a size literal: a decimal or `0x`-prefixed hex number, optionally
/// suffixed with `b` (one 0x1000 flash block), `k` (1024) or `m` (1024²).
/// `0` is returned verbatim so callers can give it the "fill remaining space"
/// meaning.
pub fn parse_size(token: &str) -> Result<u32, Error> {
    let caps = size_regex()
        .captures(token.trim())
        .ok_or_else(|| Error::user(token, "not a size literal (e.g. 4096, 0x1000, 2M)"))?;

    let digits = &caps[1];
    let value: u64 = if let Some(hex) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
            .map_err(|e| Error::user(token, format!("invalid hex literal: {e}")))?
    } else {
        digits
            .parse()
            .map_err(|e| Error::user(token, format!("invalid decimal literal: {e}")))?
    };

    let multiplier: u64 = match caps.get(2).map(|m| m.as_str().to_ascii_lowercase()) {
        None => 1,
        Some(ref s) if s == "b" => 0x1000,
        Some(ref s) if s == "k" => 1024,
        Some(ref s) if s == "m" => 1024 * 1024,
        Some(other) => return Err(Error::user(token, format!("unknown size suffix {other:?}"))),
    };

    let bytes = value
        .checked_mul(multiplier)
        .ok_or_else(|| Error::user(token, "size literal overflows a 64-bit byte count"))?;

    u32::try_from(bytes).map_err(|_| Error::user(token, "size literal too large for a 32-bit flash offset"))
}

fn validate_name(token: &str, name: &str) -> Result<(), Error> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(Error::user(
            token,
            format!("partition name must be 1-{MAX_NAME_LEN} bytes, got {:?}", name),
        ));
    }
    Ok(())
}

/// Parses the bare `<subtype>` field of an `--add` spec, e.g. `fat`,
/// `ota_0`, `0x40` for a subtype this crate has no name for. The partition
/// `type` is never spelled out separately; it's inferred from which
/// subtype table the name matches, falling back to `data` for a raw
/// numeric byte, which mirrors how `apply_add` treats an undecodable
/// subtype byte.
fn parse_subtype(token: &str, sub_str: &str) -> Result<SubType, Error> {
    match sub_str {
        "factory" => Ok(SubType::App(AppSubType::Factory)),
        "test" => Ok(SubType::App(AppSubType::Test)),
        other if other.starts_with("ota_") => {
            let n: u8 = other[4..]
                .parse()
                .map_err(|_| Error::user(token, format!("invalid ota slot {other:?}")))?;
            Ok(SubType::App(AppSubType::Ota(n)))
        }
        "nvs" => Ok(SubType::Data(DataSubType::Nvs)),
        "phy" => Ok(SubType::Data(DataSubType::Phy)),
        "ota" => Ok(SubType::Data(DataSubType::Ota)),
        "nvs_keys" => Ok(SubType::Data(DataSubType::NvsKeys)),
        "efuse" => Ok(SubType::Data(DataSubType::EFuse)),
        "coredump" => Ok(SubType::Data(DataSubType::CoreDump)),
        "fat" => Ok(SubType::Data(DataSubType::Fat)),
        "spiffs" => Ok(SubType::Data(DataSubType::Spiffs)),
        "littlefs" => Ok(SubType::Data(DataSubType::Littlefs)),
        other if other.starts_with("0x") => {
            let value = u8::from_str_radix(&other[2..], 16)
                .map_err(|_| Error::user(token, format!("invalid subtype byte {other:?}")))?;
            Ok(SubType::decode(Type::Data, value))
        }
        other => Err(Error::user(token, format!("unknown subtype {other:?}"))),
    }
}

/// Parses `--add name=subtype:size` or `name=subtype:offset:size`.
pub fn parse_add(token: &str) -> Result<AddSpec, Error> {
    let (name, rest) = token
        .split_once('=')
        .ok_or_else(|| Error::user(token, "expected name=subtype[:offset]:size"))?;
    validate_name(token, name)?;

    let parts: Vec<&str> = rest.split(':').collect();
    let (sub_type, offset, size) = match parts.as_slice() {
        [sub, size] => (parse_subtype(token, sub)?, None, parse_size(size)?),
        [sub, offset, size] => (
            parse_subtype(token, sub)?,
            Some(parse_size(offset)?),
            parse_size(size)?,
        ),
        _ => {
            return Err(Error::user(
                token,
                "expected name=subtype[:offset]:size",
            ))
        }
    };

    Ok(AddSpec {
        name: name.to_string(),
        sub_type,
        offset,
        size,
    })
}

/// Parses `--resize name=size`.
pub fn parse_resize(token: &str) -> Result<(String, u32), Error> {
    let (name, size) = token
        .split_once('=')
        .ok_or_else(|| Error::user(token, "expected name=size"))?;
    validate_name(token, name)?;
    Ok((name.to_string(), parse_size(size)?))
}

/// Parses `--rename old=new`.
pub fn parse_rename(token: &str) -> Result<(String, String), Error> {
    let (old, new) = token
        .split_once('=')
        .ok_or_else(|| Error::user(token, "expected old=new"))?;
    validate_name(token, old)?;
    validate_name(token, new)?;
    Ok((old.to_string(), new.to_string()))
}

/// Parses a `--delete name[,name...]` or `--erase name[,name...]` list.
pub fn parse_name_list(token: &str) -> Result<Vec<String>, Error> {
    let names: Vec<String> = token.split(',').map(str::to_string).collect();
    for name in &names {
        validate_name(token, name)?;
    }
    Ok(names)
}

/// Parses `--table <default|original|ota>`.
pub fn parse_table_template(token: &str) -> Result<TableTemplate, Error> {
    match token {
        "default" => Ok(TableTemplate::Default),
        "original" => Ok(TableTemplate::Original),
        "ota" => Ok(TableTemplate::Ota),
        other => Err(Error::user(
            token,
            format!("unknown table template {other:?}, expected default, original or ota"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_size_accepts_suffixes() {
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert_eq!(parse_size("0x1000").unwrap(), 0x1000);
        assert_eq!(parse_size("2M").unwrap(), 2 * 1024 * 1024);
        assert_eq!(parse_size("3B").unwrap(), 3 * 0x1000);
        assert_eq!(parse_size("0").unwrap(), 0);
    }

    #[test]
    fn parse_size_rejects_garbage() {
        assert!(parse_size("banana").is_err());
        assert!(parse_size("4Mi").is_err());
    }

    #[test]
    fn parse_add_with_and_without_offset() {
        let spec = parse_add("vfs2=fat:2M").unwrap();
        assert_eq!(spec.name, "vfs2");
        assert_eq!(spec.offset, None);
        assert_eq!(spec.size, 2 * 1024 * 1024);
        assert_eq!(spec.sub_type, SubType::Data(DataSubType::Fat));

        let spec = parse_add("ota_1=ota_1:0x210000:0x200000").unwrap();
        assert_eq!(spec.offset, Some(0x210000));
        assert_eq!(spec.sub_type, SubType::App(AppSubType::Ota(1)));
    }

    #[test]
    fn parse_add_matches_seed_scenario_five() {
        let spec = parse_add("vfs2=fat:2M:1M").unwrap();
        assert_eq!(spec.sub_type, SubType::Data(DataSubType::Fat));
        assert_eq!(spec.offset, Some(2 * 1024 * 1024));
        assert_eq!(spec.size, 1024 * 1024);
    }

    #[test]
    fn parse_resize_rejects_overlong_name() {
        let err = parse_resize("this_name_is_way_too_long_for_a_partition=1M").unwrap_err();
        assert!(matches!(err, Error::UserError { .. }));
    }

    #[test]
    fn parse_name_list_splits_on_comma() {
        let names = parse_name_list("nvs,phy_init,vfs").unwrap();
        assert_eq!(names, vec!["nvs", "phy_init", "vfs"]);
    }
}
