//! Human-readable rendering
//!
//! Partition tables print as a `comfy-table`, matching the style
//! `espflash`'s `partition_table` CLI command uses for the same data.

use comfy_table::{presets::UTF8_FULL, Cell, Table};

use crate::{image_header::ImageHeader, partition::PartitionTable};

pub fn partition_table(table: &PartitionTable) -> Table {
    let mut rendered = Table::new();
    rendered.load_preset(UTF8_FULL);
    rendered.set_header(vec!["Name", "Type", "SubType", "Offset", "Size"]);

    for partition in table.partitions() {
        rendered.add_row(vec![
            Cell::new(&partition.name),
            Cell::new(partition.ty.to_string()),
            Cell::new(partition.sub_type.name()),
            Cell::new(format!("{:#x}", partition.offset)),
            Cell::new(format!("{:#x}", partition.size)),
        ]);
    }

    rendered
}

pub fn header_summary(header: &ImageHeader) -> Table {
    let mut rendered = Table::new();
    rendered.load_preset(UTF8_FULL);
    rendered.set_header(vec!["Field", "Value"]);
    rendered.add_row(vec!["Segments", &header.num_segments.to_string()]);
    rendered.add_row(vec![
        "Flash size",
        &header
            .flash_size()
            .map(|s| s.to_string())
            .unwrap_or_else(|_| "unknown".to_string()),
    ]);
    rendered.add_row(vec!["Entry point", &format!("{:#010x}", { header.entry_addr })]);
    rendered.add_row(vec!["Hash appended", &header.hash_appended().to_string()]);
    rendered
}
