//! esppart — inspect and rewrite ESP32 firmware images, partition tables and
//! OTA state, on disk or on a live device.
//!
//! The [`Firmware`] facade is the entry point: open an image file or a live
//! device, then drive it with [`Directive`]s parsed by the [`directive`]
//! module, or call its methods directly from library code.

pub mod directive;
pub mod error;
pub mod firmware;
pub mod flash_io;
pub mod fs;
pub mod image_header;
pub mod ota;
pub mod partition;
pub mod partition_io;
pub mod planner;
pub mod progress;
pub mod sizes;

#[cfg(feature = "cli")]
pub mod cli;

pub use directive::Directive;
pub use error::Error;
pub use firmware::Firmware;
pub use image_header::ImageHeader;
pub use partition::{PartitionRecord, PartitionTable};
pub use sizes::FlashSize;
