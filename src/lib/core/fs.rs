use std::ffi::OsStr;
use std::fs;
use std::path::Path;

use crate::core::error::Result;

/// Create a directory (and its parents) when missing.
pub fn ensure_dir<P: AsRef<Path>>(path: P) -> Result<()> {
    fs::create_dir_all(path.as_ref())?;
    Ok(())
}

/// Detect whether a path uses a gzip-compatible extension.
pub fn is_gzipped<P: AsRef<Path>>(path: P) -> bool {
    matches!(
        path.as_ref().extension().unwrap_or_else(|| OsStr::new("")),
        ext if ext == "gz" || ext == "gzip" || ext == "bgz" || ext == "bgzf"
    )
}
