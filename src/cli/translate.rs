//! Translates parsed command-line flags into [`Directive`]s
//!
//! Kept separate from [`super::args::Cli`] itself so the string-to-directive
//! rules live beside the rest of the directive parser rather than inside the
//! `clap` definitions.

use std::path::PathBuf;

use crate::{
    directive::{self, Directive, TableDirective, TrimMode},
    error::Error,
    sizes::FlashSize,
};

use super::args::Cli;

fn trim_mode(cli: &Cli) -> TrimMode {
    if cli.trimblocks {
        TrimMode::TrimBlocks
    } else if cli.trim {
        TrimMode::Trim
    } else {
        TrimMode::None
    }
}

pub fn translate(cli: &Cli) -> Result<Vec<Directive>, Error> {
    let mut directives = Vec::new();
    let trim = trim_mode(cli);

    if let Some(size) = &cli.flash_size {
        let bytes = directive::parse_size(size)?;
        directives.push(Directive::Table(TableDirective::ResizeFlash(bytes as u64)));
    }

    if let Some(template) = &cli.table {
        directives.push(Directive::Table(TableDirective::TableTemplate(
            directive::parse_table_template(template)?,
        )));
    }

    if let Some(path) = &cli.from_csv {
        directives.push(Directive::Table(TableDirective::FromCsv(path.clone())));
    }

    for spec in &cli.add {
        directives.push(Directive::Table(TableDirective::AddPart(directive::parse_add(spec)?)));
    }

    if !cli.delete.is_empty() {
        directives.push(Directive::Table(TableDirective::DeletePart(cli.delete.clone())));
    }

    for spec in &cli.resize {
        let (name, size) = directive::parse_resize(spec)?;
        directives.push(Directive::Table(TableDirective::ResizePart { name, size }));
    }

    for spec in &cli.rename {
        let (old, new) = directive::parse_rename(spec)?;
        directives.push(Directive::Table(TableDirective::RenamePart { old, new }));
    }

    if let Some(size) = &cli.app_size {
        directives.push(Directive::Table(TableDirective::AppSize(directive::parse_size(size)?)));
    }

    for spec in &cli.read {
        let (name, path) = split_name_path(spec)?;
        directives.push(Directive::Read { name, path, trim });
    }

    for spec in &cli.write {
        let (name, path) = split_name_path(spec)?;
        directives.push(Directive::Write { name, path });
    }

    if !cli.erase.is_empty() {
        directives.push(Directive::Erase(cli.erase.clone()));
    }

    if !cli.erase_fs.is_empty() {
        directives.push(Directive::EraseFs(cli.erase_fs.clone()));
    }

    if let Some(spec) = &cli.extract_app {
        let (partition, path) = match spec.split_once('=') {
            Some((name, path)) => (Some(name.to_string()), PathBuf::from(path)),
            None => (None, PathBuf::from(spec)),
        };
        directives.push(Directive::ExtractApp { partition, path });
    }

    if let Some(path) = &cli.ota_update {
        directives.push(Directive::OtaUpdate(path.clone()));
    }

    if let Some(path) = &cli.flash {
        directives.push(Directive::Flash(path.clone()));
    }

    if !cli.fs.is_empty() {
        directives.push(Directive::Fs(cli.fs.clone()));
    }

    Ok(directives)
}

fn split_name_path(token: &str) -> Result<(String, PathBuf), Error> {
    let (name, path) = token
        .split_once('=')
        .ok_or_else(|| Error::user(token, "expected name=path"))?;
    Ok((name.to_string(), PathBuf::from(path)))
}

/// Resolves `--flash-size` (or, absent that, the file's own length) into a
/// concrete [`FlashSize`] when creating a brand-new image.
pub fn resolve_create_size(cli: &Cli) -> Result<FlashSize, Error> {
    match &cli.flash_size {
        Some(size) => FlashSize::from_bytes(directive::parse_size(size)? as u64),
        None => Ok(FlashSize::default()),
    }
}
