use anyhow::{Context, Result};
use flate2::read::MultiGzDecoder;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use super::fs::is_gzipped;

const READ_BUFFER_BYTES: usize = 256 * 1024;

/// Build a tab-delimited CSV reader for a file (plain, gzip or BGZF) or stdin (`-`).
pub fn get_reader<P: AsRef<Path>>(path: P, has_headers: bool) -> Result<csv::Reader<Box<dyn Read>>> {
    let path = path.as_ref();
    let raw_reader: Box<dyn Read> = if path.as_os_str() == "-" {
        Box::new(BufReader::with_capacity(READ_BUFFER_BYTES, io::stdin()))
    } else {
        let file =
            File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
        if is_gzipped(path) {
            Box::new(BufReader::with_capacity(
                READ_BUFFER_BYTES,
                MultiGzDecoder::new(file),
            ))
        } else {
            Box::new(BufReader::with_capacity(READ_BUFFER_BYTES, file))
        }
    };

    Ok(csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(has_headers)
        .comment(Some(b'#'))
        .flexible(true)
        .from_reader(raw_reader))
}

/// Locate a named column in a header row.
pub fn column_index(headers: &csv::StringRecord, name: &str) -> Result<usize> {
    headers
        .iter()
        .position(|h| h.eq_ignore_ascii_case(name))
        .ok_or_else(|| anyhow::anyhow!("Column '{}' not found", name))
}
