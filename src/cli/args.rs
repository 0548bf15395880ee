//! Command-line argument shape
//!
//! One flat set of flags rather than a subcommand tree: every directive in
//! a single invocation is applied to one open target in argument order,
//! matching the surface the original tool exposes.

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "esppart", about, version)]
pub struct Cli {
    /// Image file, or a short device name like `u0`/`c1` naming a serial port.
    pub filename: String,

    /// Rewrites the flash-size nibble and grows/shrinks the last partition
    /// to match (e.g. `4M`, `0x800000`).
    #[arg(long)]
    pub flash_size: Option<String>,

    /// Resizes every `app`-type partition to this size, sliding later
    /// partitions by the delta.
    #[arg(long)]
    pub app_size: Option<String>,

    /// Replaces the partition table with a named template: `default`,
    /// `original` or `ota`.
    #[arg(long)]
    pub table: Option<String>,

    /// Comma-separated partition names to delete.
    #[arg(long, value_delimiter = ',')]
    pub delete: Vec<String>,

    /// Adds a partition: `name=subtype[:offset]:size`. May be repeated.
    #[arg(long)]
    pub add: Vec<String>,

    /// Resizes a partition: `name=size`. May be repeated.
    #[arg(long)]
    pub resize: Vec<String>,

    /// Renames a partition: `old=new`. May be repeated.
    #[arg(long)]
    pub rename: Vec<String>,

    /// Replaces the partition table from a CSV file in the usual
    /// `esp-idf` `gen_esp32part.py` format.
    #[arg(long)]
    pub from_csv: Option<PathBuf>,

    /// Comma-separated partition names to blank-erase.
    #[arg(long, value_delimiter = ',')]
    pub erase: Vec<String>,

    /// Comma-separated partition names to reformat as a fresh LittleFS
    /// volume rather than blank-erase.
    #[arg(long, value_delimiter = ',')]
    pub erase_fs: Vec<String>,

    /// Reads a partition out to a file: `name=path`. May be repeated.
    #[arg(long)]
    pub read: Vec<String>,

    /// Writes a file into a partition: `name=path`. May be repeated.
    #[arg(long)]
    pub write: Vec<String>,

    /// Extracts the currently running app image to a file, optionally
    /// naming the source partition: `[name=]path`.
    #[arg(long)]
    pub extract_app: Option<String>,

    /// Writes an app image into the free OTA slot and selects it.
    #[arg(long)]
    pub ota_update: Option<PathBuf>,

    /// Overwrites the whole image with the contents of a file.
    #[arg(long)]
    pub flash: Option<PathBuf>,

    /// Runs an `fs:` filesystem directive, e.g. `ls vfs:/` or `cat vfs:/boot.py`.
    #[arg(long, num_args = 1..)]
    pub fs: Vec<String>,

    /// Verifies the running app image's trailing SHA-256 digest.
    #[arg(long)]
    pub check_app: bool,

    /// Trims every `--read` output to a 16-byte boundary past its last
    /// non-`0xFF` byte instead of writing the whole partition.
    #[arg(long, conflicts_with = "trimblocks")]
    pub trim: bool,

    /// Trims every `--read` output to a 4 KiB boundary past its last
    /// non-`0xFF` byte instead of writing the whole partition.
    #[arg(long)]
    pub trimblocks: bool,

    /// Skips confirming the new OTA slot before leaving it selected.
    #[arg(long)]
    pub no_rollback: bool,

    /// Leaves the device in the bootloader stub rather than resetting it
    /// into the app on close.
    #[arg(long)]
    pub no_reset: bool,

    /// Serial baud rate to use once the initial handshake completes.
    #[arg(long)]
    pub baud: Option<u32>,

    /// Reset sequence to use when entering the bootloader stub.
    #[arg(long)]
    pub method: Option<String>,

    /// Writes rendered table/header output to a file instead of stdout.
    #[arg(long)]
    pub output: Option<PathBuf>,

    /// Also tees log output to this file, in addition to stderr.
    #[arg(long)]
    pub log: Option<PathBuf>,

    /// Suppresses all but error output.
    #[arg(short, long)]
    pub quiet: bool,

    /// Emits debug-level logging.
    #[arg(short, long)]
    pub debug: bool,
}
