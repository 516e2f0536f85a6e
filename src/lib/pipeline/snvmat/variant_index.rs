//! Variant site registry mapping genomic coordinates to dense matrix columns

use rustc_hash::FxHashMap;
use serde::Serialize;
use smartstring::alias::String as CompactString;

use crate::core::error::{Result, ScsnvError};

/// Metadata for a single variant site (one matrix column).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VariantSite {
    /// Contig name
    pub contig: CompactString,
    /// 1-based genomic position
    pub position: u64,
    /// Reference allele (uppercase nucleotides)
    pub ref_allele: CompactString,
    /// Alternate allele (uppercase nucleotides)
    pub alt_allele: CompactString,
}

/// Dense index of variant sites.
///
/// Sites are registered with `&mut self` before the parallel phase starts and
/// looked up through `&self` afterwards, so lookups never take a lock.
#[derive(Debug, Default, Clone)]
pub struct VariantIndex {
    sites: Vec<VariantSite>,
    by_contig: FxHashMap<CompactString, FxHashMap<u64, u32>>,
}

pub(crate) fn normalize_allele(raw: &str) -> Option<CompactString> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let mut allele = CompactString::new();
    for byte in trimmed.bytes() {
        match byte.to_ascii_uppercase() {
            b @ (b'A' | b'C' | b'G' | b'T') => allele.push(b as char),
            _ => return None,
        }
    }
    Some(allele)
}

impl VariantIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a site, returning its column index.
    ///
    /// Registering an identical site twice returns the existing index; the same
    /// coordinate with different alleles is a [`ScsnvError::DuplicateSite`].
    pub fn register(
        &mut self,
        contig: &str,
        position: u64,
        ref_allele: &str,
        alt_allele: &str,
    ) -> Result<u32> {
        let contig = contig.trim();
        if contig.is_empty() {
            return Err(ScsnvError::InvalidInput("Empty contig name".to_string()));
        }
        if position == 0 {
            return Err(ScsnvError::InvalidInput(format!(
                "Positions must be 1-based ({}:{})",
                contig, position
            )));
        }
        let ref_norm = normalize_allele(ref_allele).ok_or_else(|| {
            ScsnvError::InvalidInput(format!(
                "Invalid reference allele '{}' at {}:{}",
                ref_allele, contig, position
            ))
        })?;
        let alt_norm = normalize_allele(alt_allele).ok_or_else(|| {
            ScsnvError::InvalidInput(format!(
                "Invalid alternate allele '{}' at {}:{}",
                alt_allele, contig, position
            ))
        })?;
        if ref_norm == alt_norm {
            return Err(ScsnvError::InvalidInput(format!(
                "Reference and alternate alleles are identical at {}:{}",
                contig, position
            )));
        }

        if let Some(&existing) = self
            .by_contig
            .get(contig)
            .and_then(|positions| positions.get(&position))
        {
            let site = &self.sites[existing as usize];
            if site.ref_allele == ref_norm && site.alt_allele == alt_norm {
                return Ok(existing);
            }
            return Err(ScsnvError::DuplicateSite {
                contig: contig.to_string(),
                position,
                existing_ref: site.ref_allele.to_string(),
                existing_alt: site.alt_allele.to_string(),
                ref_allele: ref_norm.to_string(),
                alt_allele: alt_norm.to_string(),
            });
        }

        let index = u32::try_from(self.sites.len())
            .map_err(|_| ScsnvError::InvalidInput("Too many variant sites".to_string()))?;
        self.sites.push(VariantSite {
            contig: CompactString::from(contig),
            position,
            ref_allele: ref_norm,
            alt_allele: alt_norm,
        });
        self.by_contig
            .entry(CompactString::from(contig))
            .or_default()
            .insert(position, index);
        Ok(index)
    }

    /// Look up the column index of a site.
    #[inline]
    pub fn lookup(&self, contig: &str, position: u64) -> Option<u32> {
        self.by_contig
            .get(contig)
            .and_then(|positions| positions.get(&position))
            .copied()
    }

    #[inline]
    pub fn site(&self, index: u32) -> Option<&VariantSite> {
        self.sites.get(index as usize)
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &VariantSite)> {
        self.sites.iter().enumerate().map(|(i, s)| (i as u32, s))
    }
}
