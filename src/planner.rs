//! Partition-table planner
//!
//! Takes a [`PartitionTable`] and an ordered list of [`TableDirective`]s and
//! produces a new, validated table plus the set of data partitions that must
//! be erased as a result (see [`Plan::touched`]).
//!
//! Each directive is applied to an internal working list in order; alignment
//! and ordering are normalised after every directive and once more at the
//! end, matching the distilled specification's "applied after each directive
//! and once again at the end" rule.

use crate::{
    directive::{AddSpec, LayoutEntry, TableDirective, TableTemplate},
    error::{Error, LayoutReason},
    partition::{
        AppSubType, DataSubType, PartitionRecord, PartitionTable, SubType, Type, APP_ALIGN,
        BLOCK_ALIGN, MAX_NAME_LEN,
    },
};

/// Result of a successful planning pass.
#[derive(Debug)]
pub struct Plan {
    pub table: PartitionTable,
    /// Names of data partitions whose offset or size changed (or whose byte
    /// range now overlaps a different region than before), and therefore
    /// must be erased by the caller. App partitions that merely moved are
    /// *not* included here — the facade only warns about those.
    pub touched: Vec<String>,
}

fn round_up(value: u32, align: u32) -> u32 {
    value.div_ceil(align) * align
}

/// Applies `directives` to `table`, returning the new table and the touched
/// data-partition list, or a [`LayoutReason`]-tagged error.
pub fn plan(table: &PartitionTable, directives: &[TableDirective]) -> Result<Plan, Error> {
    let before = table.partitions().to_vec();
    let mut working = before.clone();
    let mut flash_size = table.flash_size;
    let mut zero_grow_used = false;

    for directive in directives {
        match directive {
            TableDirective::ResizeFlash(size) => {
                apply_resize_flash(&mut working, &mut flash_size, *size)?;
            }
            TableDirective::TableTemplate(template) => {
                working = build_template(*template, flash_size);
            }
            TableDirective::TableLayout(entries) => {
                working = build_layout(entries, flash_size)?;
            }
            TableDirective::AddPart(spec) => {
                apply_add(&mut working, spec)?;
            }
            TableDirective::DeletePart(names) => {
                apply_delete(&mut working, names);
            }
            TableDirective::ResizePart { name, size } => {
                apply_resize_part(&mut working, flash_size, name, *size, &mut zero_grow_used)?;
            }
            TableDirective::RenamePart { old, new } => {
                apply_rename(&mut working, old, new)?;
            }
            TableDirective::AppSize(size) => {
                apply_app_size(&mut working, flash_size, *size)?;
            }
            TableDirective::FromCsv(_path) => {
                // Reading and parsing the CSV itself is a C9/CLI concern;
                // by the time a directive reaches the planner it has already
                // been expanded into AddPart/TableLayout directives. A
                // lingering FromCsv this deep is a programmer error upstream.
                return Err(Error::user(
                    "--from-csv",
                    "FromCsv must be expanded before reaching the planner",
                ));
            }
        }
        normalize(&mut working)?;
    }

    validate(&working, flash_size)?;

    let touched = touched_partitions(&before, &working);
    let table = PartitionTable::new(working, flash_size);
    Ok(Plan { table, touched })
}

/// Re-sorts by offset and rounds sizes/app-offsets to their required
/// alignment, inserting gaps where necessary. Does not validate; that is
/// [`validate`]'s job, called once after every directive.
fn normalize(partitions: &mut [PartitionRecord]) -> Result<(), Error> {
    for p in partitions.iter_mut() {
        p.size = round_up(p.size, BLOCK_ALIGN);
        if p.is_app() {
            p.offset = round_up(p.offset, APP_ALIGN);
        } else {
            p.offset = round_up(p.offset, BLOCK_ALIGN);
        }
    }
    partitions.sort_by_key(|p| p.offset);
    Ok(())
}

fn validate(partitions: &[PartitionRecord], flash_size: u64) -> Result<(), Error> {
    let mut sorted: Vec<&PartitionRecord> = partitions.iter().collect();
    sorted.sort_by_key(|p| p.offset);

    let mut names = std::collections::HashSet::new();
    let mut has_app = false;
    let mut has_otadata = false;
    let mut has_ota_app = false;

    for (i, p) in sorted.iter().enumerate() {
        if p.name.is_empty() || p.name.len() > MAX_NAME_LEN {
            return Err(Error::layout(
                LayoutReason::InvalidName,
                format!("{:?}", p.name),
            ));
        }
        if !names.insert(&p.name) {
            return Err(Error::layout(LayoutReason::DuplicateName, p.name.clone()));
        }
        if p.size % BLOCK_ALIGN != 0 || p.offset % BLOCK_ALIGN != 0 {
            return Err(Error::layout(
                LayoutReason::Overlap,
                format!("{} is not block-aligned", p.name),
            ));
        }
        if p.is_app() && p.offset % APP_ALIGN != 0 {
            return Err(Error::layout(
                LayoutReason::Overlap,
                format!("app partition {} is not 64K-aligned", p.name),
            ));
        }
        if p.end() as u64 > flash_size {
            return Err(Error::layout(LayoutReason::Overflow, p.name.clone()));
        }
        if let Some(next) = sorted.get(i + 1) {
            if p.end() > next.offset {
                return Err(Error::layout(
                    LayoutReason::Overlap,
                    format!("{} overlaps {}", p.name, next.name),
                ));
            }
        }
        has_app |= p.is_app();
        has_otadata |= p.is_otadata();
        has_ota_app |= p.is_ota_app();
    }

    if !has_app {
        return Err(Error::layout(LayoutReason::NoAppPartition, "table"));
    }
    if has_ota_app && !has_otadata {
        return Err(Error::layout(LayoutReason::MissingOtadata, "table"));
    }

    Ok(())
}

fn touched_partitions(before: &[PartitionRecord], after: &[PartitionRecord]) -> Vec<String> {
    let mut touched = Vec::new();
    for p in after {
        if p.is_app() {
            continue;
        }
        match before.iter().find(|b| b.name == p.name) {
            Some(prior) if prior.offset == p.offset && prior.size == p.size => {}
            _ => touched.push(p.name.clone()),
        }
    }
    touched
}

fn find_mut<'a>(
    partitions: &'a mut [PartitionRecord],
    name: &str,
) -> Result<&'a mut PartitionRecord, Error> {
    partitions
        .iter_mut()
        .find(|p| p.name == name)
        .ok_or_else(|| Error::NotFound(name.to_string()))
}

fn apply_resize_flash(
    partitions: &mut [PartitionRecord],
    flash_size: &mut u64,
    new_size: u64,
) -> Result<(), Error> {
    let fixed_end: u32 = partitions
        .iter()
        .rev()
        .skip(1)
        .map(|p| p.end())
        .max()
        .unwrap_or(0);
    if fixed_end as u64 > new_size {
        return Err(Error::layout(
            LayoutReason::Overflow,
            "fixed partitions exceed the requested flash size",
        ));
    }
    *flash_size = new_size;
    if let Some(last) = partitions.iter_mut().max_by_key(|p| p.offset) {
        let new_end = new_size as u32;
        if new_end <= last.offset {
            return Err(Error::layout(
                LayoutReason::Overflow,
                "last partition no longer fits after shrinking flash",
            ));
        }
        last.size = new_end - last.offset;
    }
    Ok(())
}

fn build_template(template: TableTemplate, flash_size: u64) -> Vec<PartitionRecord> {
    let end = flash_size as u32;
    match template {
        TableTemplate::Default => vec![
            PartitionRecord::new("nvs", Type::Data, SubType::Data(DataSubType::Nvs), 0x9000, 0x6000),
            PartitionRecord::new(
                "phy_init",
                Type::Data,
                SubType::Data(DataSubType::Phy),
                0xf000,
                0x1000,
            ),
            PartitionRecord::new(
                "factory",
                Type::App,
                SubType::App(AppSubType::Factory),
                0x10000,
                end - 0x10000,
            ),
        ],
        TableTemplate::Original => vec![
            PartitionRecord::new("nvs", Type::Data, SubType::Data(DataSubType::Nvs), 0x9000, 0x6000),
            PartitionRecord::new(
                "phy_init",
                Type::Data,
                SubType::Data(DataSubType::Phy),
                0xf000,
                0x1000,
            ),
            PartitionRecord::new(
                "factory",
                Type::App,
                SubType::App(AppSubType::Factory),
                0x10000,
                end - 0x10000,
            ),
        ],
        TableTemplate::Ota => {
            let ota_size = round_up(end / 4, APP_ALIGN);
            let ota0_offset = 0x10000;
            let ota1_offset = ota0_offset + ota_size;
            let vfs_offset = ota1_offset + ota_size;
            vec![
                PartitionRecord::new("nvs", Type::Data, SubType::Data(DataSubType::Nvs), 0x9000, 0x5000),
                PartitionRecord::new(
                    "otadata",
                    Type::Data,
                    SubType::Data(DataSubType::Ota),
                    0xe000,
                    0x2000,
                ),
                PartitionRecord::new(
                    "ota_0",
                    Type::App,
                    SubType::App(AppSubType::Ota(0)),
                    ota0_offset,
                    ota_size,
                ),
                PartitionRecord::new(
                    "ota_1",
                    Type::App,
                    SubType::App(AppSubType::Ota(1)),
                    ota1_offset,
                    ota_size,
                ),
                PartitionRecord::new(
                    "vfs",
                    Type::Data,
                    SubType::Data(DataSubType::Fat),
                    vfs_offset,
                    end - vfs_offset,
                ),
            ]
        }
    }
}

fn build_layout(entries: &[LayoutEntry], flash_size: u64) -> Result<Vec<PartitionRecord>, Error> {
    let mut partitions = Vec::with_capacity(entries.len());
    let mut offset = 0x9000u32;

    for (i, entry) in entries.iter().enumerate() {
        let ty = match entry.sub_type {
            SubType::App(_) => Type::App,
            SubType::Data(_) | SubType::Unknown(_) => entry.ty,
        };
        let aligned = if matches!(ty, Type::App) {
            round_up(offset, APP_ALIGN)
        } else {
            round_up(offset, BLOCK_ALIGN)
        };

        let size = if entry.size == 0 {
            if i + 1 != entries.len() {
                return Err(Error::layout(
                    LayoutReason::ZeroGrowAmbiguous,
                    "size=0 only allowed on the last layout entry",
                ));
            }
            (flash_size as u32).saturating_sub(aligned)
        } else {
            round_up(entry.size, BLOCK_ALIGN)
        };

        partitions.push(PartitionRecord::new(
            entry.name.clone(),
            ty,
            entry.sub_type,
            aligned,
            size,
        ));
        offset = aligned + size;
    }

    Ok(partitions)
}

fn apply_add(partitions: &mut Vec<PartitionRecord>, spec: &AddSpec) -> Result<(), Error> {
    if partitions.iter().any(|p| p.name == spec.name) {
        return Err(Error::layout(LayoutReason::DuplicateName, spec.name.clone()));
    }

    let ty = match spec.sub_type {
        SubType::App(_) => Type::App,
        SubType::Data(_) | SubType::Unknown(_) => Type::Data,
    };

    let offset = match spec.offset {
        Some(offset) => offset,
        None => {
            let prev_end = partitions.iter().map(|p| p.end()).max().unwrap_or(0x9000);
            if matches!(ty, Type::App) {
                round_up(prev_end, APP_ALIGN)
            } else {
                round_up(prev_end, BLOCK_ALIGN)
            }
        }
    };

    let size = round_up(spec.size, BLOCK_ALIGN);
    let new_end = offset + size;

    for existing in partitions.iter() {
        let overlaps = offset < existing.end() && existing.offset < new_end;
        if overlaps {
            return Err(Error::layout(
                LayoutReason::Overlap,
                format!("{} overlaps {}", spec.name, existing.name),
            ));
        }
    }

    partitions.push(PartitionRecord::new(
        spec.name.clone(),
        ty,
        spec.sub_type,
        offset,
        size,
    ));
    Ok(())
}

fn apply_delete(partitions: &mut Vec<PartitionRecord>, names: &[String]) {
    partitions.retain(|p| !names.iter().any(|n| n == &p.name));
}

fn apply_resize_part(
    partitions: &mut [PartitionRecord],
    flash_size: u64,
    name: &str,
    new_size: u32,
    zero_grow_used: &mut bool,
) -> Result<(), Error> {
    let mut sorted_offsets: Vec<u32> = partitions.iter().map(|p| p.offset).collect();
    sorted_offsets.sort_unstable();

    let (offset, old_size) = {
        let p = find_mut(partitions, name)?;
        (p.offset, p.size)
    };

    let next_fixed_offset = sorted_offsets
        .iter()
        .copied()
        .find(|&o| o > offset)
        .unwrap_or(flash_size as u32);

    let resolved_size = if new_size == 0 {
        if *zero_grow_used {
            return Err(Error::layout(
                LayoutReason::ZeroGrowAmbiguous,
                "only one partition may grow to fill remaining space per pass",
            ));
        }
        *zero_grow_used = true;
        next_fixed_offset.saturating_sub(offset)
    } else {
        round_up(new_size, BLOCK_ALIGN)
    };

    let delta = resolved_size as i64 - old_size as i64;
    {
        let p = find_mut(partitions, name)?;
        p.size = resolved_size;
    }

    // Growth first consumes any slack already sitting between this partition
    // and the next one (e.g. space an earlier DeletePart freed up); only the
    // overflow past that slack needs to push later partitions forward.
    // Shrinking always pulls the tail back by the full delta.
    let gap = next_fixed_offset.saturating_sub(offset + old_size) as i64;
    let shift = if delta > 0 { (delta - gap).max(0) } else { delta };

    if shift != 0 {
        for p in partitions.iter_mut() {
            if p.offset > offset {
                p.offset = (p.offset as i64 + shift) as u32;
            }
        }
    }

    Ok(())
}

fn apply_rename(partitions: &mut [PartitionRecord], old: &str, new: &str) -> Result<(), Error> {
    if partitions.iter().any(|p| p.name == new) {
        return Err(Error::layout(LayoutReason::DuplicateName, new.to_string()));
    }
    find_mut(partitions, old)?.name = new.to_string();
    Ok(())
}

fn apply_app_size(partitions: &mut [PartitionRecord], flash_size: u64, size: u32) -> Result<(), Error> {
    let mut sorted_offsets: Vec<u32> = partitions.iter().map(|p| p.offset).collect();
    sorted_offsets.sort_unstable();
    let new_size = round_up(size, BLOCK_ALIGN);

    let old_sizes: Vec<(u32, u32)> = partitions
        .iter()
        .filter(|p| p.is_app())
        .map(|p| (p.offset, p.size))
        .collect();

    for &(offset, _) in &old_sizes {
        let next_fixed_offset = sorted_offsets
            .iter()
            .copied()
            .find(|&o| o > offset)
            .unwrap_or(flash_size as u32);
        if offset + new_size > next_fixed_offset {
            return Err(Error::layout(
                LayoutReason::AppSizeExceeds,
                format!("app partition at {offset:#x} would exceed {next_fixed_offset:#x}"),
            ));
        }
    }

    for p in partitions.iter_mut() {
        if p.is_app() {
            p.size = new_size;
        }
    }

    // Slide every non-app partition that followed a resized app partition.
    for (offset, old_size) in old_sizes {
        let delta = new_size as i64 - old_size as i64;
        if delta == 0 {
            continue;
        }
        for p in partitions.iter_mut() {
            if p.offset > offset && !p.is_app() {
                p.offset = (p.offset as i64 + delta) as u32;
            }
        }
    }

    Ok(())
}
