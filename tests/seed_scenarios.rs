//! End-to-end tests against the `Firmware` facade, covering the seed
//! scenarios from the specification's testable-properties section. Fixtures
//! are built as Rust literals/builders rather than YAML, matching the rest
//! of this crate's test style.

use esppart::directive::{Directive, LayoutEntry, TableDirective, TableTemplate};
use esppart::error::{Error, LayoutReason};
use esppart::partition::{AppSubType, DataSubType, SubType, Type};
use esppart::sizes::FlashSize;
use esppart::{Firmware, ImageHeader};
use tempfile::NamedTempFile;

/// Builds a table matching the layout of the `ESP32_GENERIC-20231005-v1.21.0.bin`
/// fixture named in the specification: `nvs@0x9000/0x6000`,
/// `phy_init@0xf000/0x1000`, `factory@0x10000/0x1f0000`, `vfs@0x200000/0x200000`
/// on a 4 MiB image.
fn fixture_layout() -> Vec<LayoutEntry> {
    vec![
        LayoutEntry {
            name: "nvs".into(),
            ty: Type::Data,
            sub_type: SubType::Data(DataSubType::Nvs),
            size: 0x6000,
        },
        LayoutEntry {
            name: "phy_init".into(),
            ty: Type::Data,
            sub_type: SubType::Data(DataSubType::Phy),
            size: 0x1000,
        },
        LayoutEntry {
            name: "factory".into(),
            ty: Type::App,
            sub_type: SubType::App(AppSubType::Factory),
            size: 0x1f0000,
        },
        LayoutEntry {
            name: "vfs".into(),
            ty: Type::Data,
            sub_type: SubType::Data(DataSubType::Fat),
            size: 0, // fill remaining space
        },
    ]
}

fn open_fixture(size: FlashSize) -> (NamedTempFile, Firmware) {
    let tmp = NamedTempFile::new().unwrap();
    let mut fw = Firmware::create_file(tmp.path(), size).unwrap();
    fw.run(&[Directive::Table(TableDirective::TableLayout(fixture_layout()))])
        .unwrap();
    (tmp, fw)
}

/// A minimal, well-formed app image: header plus a zero-length segment
/// chain, checksum byte, and a correctly computed trailing SHA-256 digest.
/// `marker` is stashed in the header's `entry_addr` field purely so two
/// images built by this helper can be told apart later.
fn minimal_app_image(marker: u32) -> Vec<u8> {
    let mut header = ImageHeader {
        hash_appended: 1,
        entry_addr: marker,
        ..ImageHeader::default()
    };
    header.set_flash_size(FlashSize::_4Mb);
    let mut data = header.emit().to_vec();
    let padding = (15 - data.len() % 16).rem_euclid(16);
    data.resize(data.len() + padding, 0);
    data.push(0); // checksum byte
    assert_eq!(data.len() % 16, 0);
    let end = data.len() + 32;
    data.resize(end, 0);
    ImageHeader::rehash(&mut data, end).unwrap();
    data
}

// --- Scenario 1: open fixture, inspect table -------------------------------

#[test]
fn scenario1_opening_fixture_reports_expected_partitions() {
    let (_tmp, fw) = open_fixture(FlashSize::_4Mb);

    let nvs = fw.table().find("nvs").unwrap();
    assert_eq!((nvs.offset, nvs.size), (0x9000, 0x6000));

    let phy = fw.table().find("phy_init").unwrap();
    assert_eq!((phy.offset, phy.size), (0xf000, 0x1000));

    let factory = fw.table().find("factory").unwrap();
    assert_eq!((factory.offset, factory.size), (0x10000, 0x1f0000));

    let vfs = fw.table().find("vfs").unwrap();
    assert_eq!((vfs.offset, vfs.size), (0x200000, 0x200000));

    assert_eq!(fw.table().flash_size, FlashSize::_4Mb.bytes());
    assert_eq!(fw.table().partitions().len(), 4);

    // The table round-trips through its own MD5-checked codec: re-parsing
    // the emitted bytes must reproduce the same records.
    let bytes = fw.table().emit().unwrap();
    let reparsed = esppart::partition::PartitionTable::parse(&bytes, fw.table().flash_size).unwrap();
    assert_eq!(reparsed.partitions(), fw.table().partitions());
}

// --- Scenario 2: grow flash to 8 MiB, `vfs` resized to fill the rest -------

#[test]
fn scenario2_resize_flash_to_8mb_grows_vfs_and_rehashes_header() {
    let (_tmp, mut fw) = open_fixture(FlashSize::_4Mb);

    fw.run(&[
        Directive::Table(TableDirective::ResizeFlash(FlashSize::_8Mb.bytes())),
        Directive::Table(TableDirective::ResizePart {
            name: "vfs".into(),
            size: 0,
        }),
    ])
    .unwrap();

    let vfs = fw.table().find("vfs").unwrap();
    assert_eq!(vfs.offset, 0x200000);
    assert_eq!(vfs.size, 0x800000 - 0x200000);

    assert_eq!(fw.header().flash_size().unwrap(), FlashSize::_8Mb);

    // Every other partition is untouched.
    let nvs = fw.table().find("nvs").unwrap();
    assert_eq!((nvs.offset, nvs.size), (0x9000, 0x6000));
    let factory = fw.table().find("factory").unwrap();
    assert_eq!((factory.offset, factory.size), (0x10000, 0x1f0000));
}

// --- Scenario 3: `--table ota` on an 8 MiB fixture -------------------------

#[test]
fn scenario3_table_template_ota_on_8mb_flash() {
    let tmp = NamedTempFile::new().unwrap();
    let mut fw = Firmware::create_file(tmp.path(), FlashSize::_8Mb).unwrap();
    fw.run(&[Directive::Table(TableDirective::TableTemplate(TableTemplate::Ota))])
        .unwrap();

    let nvs = fw.table().find("nvs").unwrap();
    assert_eq!((nvs.offset, nvs.size), (0x9000, 0x5000));

    let otadata = fw.table().find("otadata").unwrap();
    assert_eq!((otadata.offset, otadata.size), (0xe000, 0x2000));

    let ota0 = fw.table().find("ota_0").unwrap();
    assert_eq!((ota0.offset, ota0.size), (0x10000, 0x200000));

    let ota1 = fw.table().find("ota_1").unwrap();
    assert_eq!((ota1.offset, ota1.size), (0x210000, 0x200000));

    let vfs = fw.table().find("vfs").unwrap();
    assert_eq!((vfs.offset, vfs.size), (0x410000, 0x3f0000));
}

// --- Scenario 4: delete + zero-resize slides the tail ----------------------

#[test]
fn scenario4_delete_phy_init_and_grow_nvs_slides_factory_unchanged() {
    let (_tmp, mut fw) = open_fixture(FlashSize::_4Mb);

    fw.run(&[
        Directive::Table(TableDirective::DeletePart(vec!["phy_init".into()])),
        Directive::Table(TableDirective::ResizePart {
            name: "nvs".into(),
            size: 0,
        }),
    ])
    .unwrap();

    assert!(fw.table().find("phy_init").is_none());
    let nvs = fw.table().find("nvs").unwrap();
    assert_eq!((nvs.offset, nvs.size), (0x9000, 0x7000));
    // `factory` is app-typed, so it keeps its 64 KiB-aligned offset rather
    // than sliding down to meet the grown `nvs`.
    let factory = fw.table().find("factory").unwrap();
    assert_eq!(factory.offset, 0x10000);

    // The table still round-trips through the MD5-checked codec after the
    // edit.
    let bytes = fw.table().emit().unwrap();
    assert!(esppart::partition::PartitionTable::parse(&bytes, fw.table().flash_size).is_ok());
}

// --- Scenario 5: adding an overlapping partition is rejected ---------------

#[test]
fn scenario5_add_overlapping_partition_is_a_layout_error() {
    let (_tmp, mut fw) = open_fixture(FlashSize::_4Mb);

    let err = fw
        .run(&[Directive::Table(TableDirective::AddPart(
            esppart::directive::AddSpec {
                name: "vfs2".into(),
                sub_type: SubType::Data(DataSubType::Fat),
                offset: Some(0x200000),
                size: 0x100000,
            },
        ))])
        .unwrap_err();

    assert!(matches!(
        err,
        Error::LayoutError {
            reason: LayoutReason::Overlap,
            ..
        }
    ));

    // A rejected directive must not have mutated the in-memory table.
    assert!(fw.table().find("vfs2").is_none());
    let vfs = fw.table().find("vfs").unwrap();
    assert_eq!((vfs.offset, vfs.size), (0x200000, 0x200000));
}

// --- Scenario 6: OTA update leaves the active slot untouched ---------------

#[test]
fn scenario6_ota_update_writes_inactive_slot_and_advances_otadata() {
    let tmp = NamedTempFile::new().unwrap();
    let mut fw = Firmware::create_file(tmp.path(), FlashSize::_8Mb).unwrap();
    fw.run(&[Directive::Table(TableDirective::TableTemplate(TableTemplate::Ota))])
        .unwrap();

    let first = NamedTempFile::new().unwrap();
    std::fs::write(first.path(), minimal_app_image(0xAAAA_AAAA)).unwrap();

    // Three successive updates: None -> ota_0 (seq 1) -> ota_1 (seq 2) ->
    // ota_0 (seq 3), matching the "active is ota_0 seq=3" starting point
    // the scenario describes.
    for _ in 0..3 {
        fw.run(&[Directive::OtaUpdate(first.path().to_path_buf())]).unwrap();
    }

    let active_before_out = tmp.path().with_extension("active_before");
    fw.run(&[Directive::ExtractApp {
        partition: Some("ota_0".into()),
        path: active_before_out.clone(),
    }])
    .unwrap();
    let active_before = std::fs::read(&active_before_out).unwrap();

    let update = NamedTempFile::new().unwrap();
    let new_image = minimal_app_image(0xBBBB_BBBB);
    std::fs::write(update.path(), &new_image).unwrap();

    fw.run(&[Directive::OtaUpdate(update.path().to_path_buf())]).unwrap();

    // The previously active slot (ota_0) is byte-for-byte unchanged.
    let active_after_out = tmp.path().with_extension("active_after");
    fw.run(&[Directive::ExtractApp {
        partition: Some("ota_0".into()),
        path: active_after_out.clone(),
    }])
    .unwrap();
    let active_after = std::fs::read(&active_after_out).unwrap();
    assert_eq!(active_before, active_after);

    // The inactive slot (ota_1) now holds the new image with a freshly
    // computed trailing digest.
    let inactive_out = tmp.path().with_extension("inactive");
    fw.run(&[Directive::ExtractApp {
        partition: Some("ota_1".into()),
        path: inactive_out.clone(),
    }])
    .unwrap();
    let inactive = std::fs::read(&inactive_out).unwrap();
    let end = ImageHeader::size_of_image(&inactive).unwrap();
    assert!(ImageHeader::validate_hash(&inactive, end).unwrap());
    assert_eq!({ ImageHeader::parse(&inactive).unwrap().entry_addr }, 0xBBBB_BBBB);
}
