//! Site list loading

use std::path::Path;

use anyhow::Context;
use log::info;

use crate::core::error::{Result, ScsnvError};
use crate::core::io::{column_index, get_reader};
use crate::pipeline::snvmat::variant_index::VariantIndex;

fn first_column(headers: &csv::StringRecord, names: &[&str]) -> anyhow::Result<usize> {
    names
        .iter()
        .find_map(|name| column_index(headers, name).ok())
        .ok_or_else(|| anyhow::anyhow!("None of the columns {:?} found", names))
}

/// Build a [`VariantIndex`] from a tab-separated site list (plain or gzip).
///
/// The header must name a contig column (`contig`/`chrom`/`chr`), a 1-based
/// position column (`position`/`pos`) and `ref`/`alt` allele columns. Sites are
/// indexed in file order.
pub fn read_sites_from_tsv<P: AsRef<Path>>(path: P) -> Result<VariantIndex> {
    let path = path.as_ref();
    let mut reader = get_reader(path, true)?;
    let headers = reader.headers()?.clone();
    let contig_idx = first_column(&headers, &["contig", "chrom", "chr"])
        .with_context(|| format!("Invalid site list header in {}", path.display()))?;
    let pos_idx = first_column(&headers, &["position", "pos"])
        .with_context(|| format!("Invalid site list header in {}", path.display()))?;
    let ref_idx = first_column(&headers, &["ref", "ref_allele"])
        .with_context(|| format!("Invalid site list header in {}", path.display()))?;
    let alt_idx = first_column(&headers, &["alt", "alt_allele"])
        .with_context(|| format!("Invalid site list header in {}", path.display()))?;

    let mut index = VariantIndex::new();
    for record in reader.records() {
        let record = record?;
        let line = record.position().map(|p| p.line()).unwrap_or_default();
        let field = |idx: usize| {
            record.get(idx).ok_or_else(|| {
                ScsnvError::Parse(format!("{}:{}: missing column {}", path.display(), line, idx + 1))
            })
        };
        let position = field(pos_idx)?.trim().parse::<u64>().map_err(|e| {
            ScsnvError::Parse(format!("{}:{}: invalid position: {}", path.display(), line, e))
        })?;
        index.register(field(contig_idx)?, position, field(ref_idx)?, field(alt_idx)?)?;
    }

    info!("Loaded {} variant sites from {}", index.len(), path.display());
    Ok(index)
}
