//! Command-line front end
//!
//! Parses flags with `clap`, translates them into [`crate::Directive`]s,
//! drives a [`crate::Firmware`] target, and renders the result with
//! `comfy-table`/`indicatif`. Gated behind the `cli` feature so library
//! consumers don't pay for `clap` or a terminal UI they never use.

mod args;
mod render;
mod translate;

pub use args::Cli;

use std::{
    fs::OpenOptions,
    io::{self, Write},
    path::Path,
};

use env_logger::Target;
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn, LevelFilter};

use crate::{error::Error, firmware::Firmware};

/// Duplicates every write to stderr onto a second sink, used to back
/// `--log <path>` without giving up `env_logger`'s normal stderr output.
struct Tee<W> {
    other: W,
}

impl<W: Write> Write for Tee<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stderr().write_all(buf)?;
        self.other.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()?;
        self.other.flush()
    }
}

/// Sets up `env_logger` at a level derived from `-q`/`-d`, matching the
/// quiet/verbose flags the rest of the command line exposes. `--log <path>`
/// tees the same output into a file alongside stderr.
pub fn init_logger(cli: &Cli) -> Result<(), Error> {
    let level = if cli.quiet {
        LevelFilter::Error
    } else if cli.debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    let mut builder = env_logger::Builder::new();
    builder.filter_level(level).format_timestamp(None);

    if let Some(path) = &cli.log {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| Error::Io {
                path: path.clone(),
                source,
            })?;
        builder.target(Target::Pipe(Box::new(Tee { other: file })));
    }

    builder.init();
    Ok(())
}

fn looks_like_device(filename: &str) -> bool {
    let mut chars = filename.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
        && !filename.contains('.')
        && !filename.contains('/')
        && chars.clone().next().is_some()
        && chars.all(|c| c.is_ascii_digit())
}

fn open_target(filename: &str) -> Result<Firmware, Error> {
    if looks_like_device(filename) {
        return Err(Error::DeviceError(format!(
            "{filename:?} looks like a serial device shorthand, but this build has no \
             bootloader-stub transport wired in; pass a file path instead"
        )));
    }
    Firmware::open_file(Path::new(filename))
}

fn progress_bar(total: u64) -> ProgressBar {
    let bar = ProgressBar::new(total);
    bar.set_style(
        ProgressStyle::with_template("{bar:40.cyan/blue} {bytes}/{total_bytes} ({eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    bar
}

/// Runs one command-line invocation end to end.
pub fn run(cli: Cli) -> Result<(), Error> {
    let directives = translate::translate(&cli)?;
    let mut firmware = open_target(&cli.filename)?;

    let bar = progress_bar(firmware.table().flash_size);
    firmware.set_progress(Some(Box::new(move |done, total| {
        if total > 0 {
            bar.set_length(total);
        }
        bar.set_position(done);
    })));

    if cli.check_app && !firmware.verify_app()? {
        warn!("booted app image's trailing SHA-256 digest does not match its contents");
    }

    let touched = firmware.run(&directives)?;
    if !touched.is_empty() {
        info!("resized or relocated data partitions: {}", touched.join(", "));
    }

    if directives.is_empty() {
        let rendered = format!(
            "{}\n{}\n",
            render::header_summary(firmware.header()),
            render::partition_table(firmware.table())
        );
        match &cli.output {
            Some(path) => std::fs::write(path, rendered).map_err(|source| Error::Io {
                path: path.clone(),
                source,
            })?,
            None => print!("{rendered}"),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_shorthand_is_recognised() {
        assert!(looks_like_device("u0"));
        assert!(looks_like_device("c1"));
        assert!(!looks_like_device("image.bin"));
        assert!(!looks_like_device("./firmware/image.bin"));
    }
}
