//! Deterministic zip encoding of a bundle.
//!
//! Entries are written in the order given (callers pass a sorted map),
//! deflated, with a fixed DOS epoch timestamp and fixed permissions, so
//! identical inputs always produce identical bytes.

use std::collections::BTreeMap;
use std::io::{Cursor, Read, Write};

use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipArchive, ZipWriter};

use crate::error::BundleResult;

pub fn write_archive<'a, I>(entries: I) -> BundleResult<Vec<u8>>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(DateTime::default())
        .unix_permissions(0o644);

    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    for (path, text) in entries {
        writer.start_file(path, options)?;
        writer.write_all(text.as_bytes())?;
    }
    Ok(writer.finish()?.into_inner())
}

/// Decode an archive back into path → text.
pub fn read_archive(bytes: &[u8]) -> BundleResult<BTreeMap<String, String>> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))?;
    let mut entries = BTreeMap::new();
    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;
        let name = file.name().to_string();
        let mut text = String::new();
        file.read_to_string(&mut text)?;
        entries.insert(name, text);
    }
    Ok(entries)
}
