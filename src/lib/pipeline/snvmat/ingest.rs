//! Normalization of raw per-read evidence into counted observations

use std::fmt;

use serde::Serialize;

use crate::core::read_filter::{DefaultRecordFilter, RecordFilter};
use crate::pipeline::snvmat::barcode::{normalize_barcode, BarcodeRegistry};
use crate::pipeline::snvmat::config::BuildConfig;
use crate::pipeline::snvmat::variant_index::{normalize_allele, VariantIndex};
use crate::pipeline::snvmat::AlleleChannel;

/// Longest UMI that fits the 2-bit packing behind the sentinel bit.
pub const MAX_UMI_LEN: usize = 31;

/// One read's evidence at one variant site, as produced by an alignment front end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    /// Cell barcode as found in the alignment tag
    pub barcode: String,
    pub contig: String,
    /// 1-based position
    pub position: u64,
    /// Observed allele at the site
    pub allele: String,
    /// Base quality (Phred)
    pub quality: u8,
    pub umi: Option<String>,
    /// Multiplicity of this record
    pub weight: u32,
}

impl RawRecord {
    pub fn new(
        barcode: impl Into<String>,
        contig: impl Into<String>,
        position: u64,
        allele: impl Into<String>,
        quality: u8,
    ) -> Self {
        Self {
            barcode: barcode.into(),
            contig: contig.into(),
            position,
            allele: allele.into(),
            quality,
            umi: None,
            weight: 1,
        }
    }

    pub fn with_umi(mut self, umi: impl Into<String>) -> Self {
        self.umi = Some(umi.into());
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }
}

/// A normalized observation routed to an accumulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    /// Provisional cell id from the barcode registry
    pub cell: u32,
    pub site: u32,
    pub channel: AlleleChannel,
    pub weight: u32,
    /// Packed UMI, 0 in raw-read mode
    pub umi: u64,
}

/// Why a record was not counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Rejection {
    LowQuality,
    UnknownSite,
    AmbiguousAllele,
    OtherAllele,
    MissingUmi,
    MalformedUmi,
    MalformedBarcode,
    UnlistedBarcode,
    /// The source could not parse the row
    MalformedRecord,
}

impl Rejection {
    pub const COUNT: usize = 9;
    pub const ALL: [Rejection; 9] = [
        Rejection::LowQuality,
        Rejection::UnknownSite,
        Rejection::AmbiguousAllele,
        Rejection::OtherAllele,
        Rejection::MissingUmi,
        Rejection::MalformedUmi,
        Rejection::MalformedBarcode,
        Rejection::UnlistedBarcode,
        Rejection::MalformedRecord,
    ];

    #[inline]
    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Rejection::LowQuality => "base quality below threshold",
            Rejection::UnknownSite => "position is not a registered site",
            Rejection::AmbiguousAllele => "ambiguous or invalid allele",
            Rejection::OtherAllele => "non ref/alt allele while other tracking is off",
            Rejection::MissingUmi => "missing UMI",
            Rejection::MalformedUmi => "malformed UMI",
            Rejection::MalformedBarcode => "malformed barcode",
            Rejection::UnlistedBarcode => "barcode not in whitelist",
            Rejection::MalformedRecord => "unparseable input row",
        };
        f.write_str(reason)
    }
}

/// Per-reason rejection counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RejectionTally {
    counts: [u64; Rejection::COUNT],
}

impl RejectionTally {
    #[inline]
    pub fn record(&mut self, rejection: Rejection) {
        self.counts[rejection.index()] += 1;
    }

    pub fn get(&self, rejection: Rejection) -> u64 {
        self.counts[rejection.index()]
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    pub fn merge(&mut self, other: &RejectionTally) {
        for (mine, theirs) in self.counts.iter_mut().zip(other.counts.iter()) {
            *mine += theirs;
        }
    }

    /// Non-zero reasons with their counts.
    pub fn iter(&self) -> impl Iterator<Item = (Rejection, u64)> + '_ {
        Rejection::ALL
            .iter()
            .map(move |&r| (r, self.get(r)))
            .filter(|&(_, n)| n > 0)
    }
}

/// Pack a UMI as 2-bit nucleotides behind a leading sentinel bit.
///
/// The sentinel keeps `A`, `AA` and `AAA` distinct and reserves 0 for "no UMI".
pub fn encode_umi(raw: &str) -> Option<u64> {
    let umi = raw.trim();
    if umi.is_empty() || umi.len() > MAX_UMI_LEN {
        return None;
    }
    let mut code = 1u64;
    for byte in umi.bytes() {
        let bits = match byte.to_ascii_uppercase() {
            b'A' => 0,
            b'C' => 1,
            b'G' => 2,
            b'T' => 3,
            _ => return None,
        };
        code = (code << 2) | bits;
    }
    Some(code)
}

/// Turns [`RawRecord`]s into [`Observation`]s.
///
/// Shared by reference across producer threads; the barcode registry is its only
/// mutable collaborator.
pub struct ReadIngestor<'a, F: RecordFilter = DefaultRecordFilter> {
    index: &'a VariantIndex,
    registry: &'a BarcodeRegistry,
    filter: F,
    umi_mode: bool,
    track_other: bool,
}

impl<'a> ReadIngestor<'a, DefaultRecordFilter> {
    pub fn new(index: &'a VariantIndex, registry: &'a BarcodeRegistry, config: &BuildConfig) -> Self {
        Self::with_filter(
            index,
            registry,
            config,
            DefaultRecordFilter::new(config.quality_threshold),
        )
    }
}

impl<'a, F: RecordFilter> ReadIngestor<'a, F> {
    pub fn with_filter(
        index: &'a VariantIndex,
        registry: &'a BarcodeRegistry,
        config: &BuildConfig,
        filter: F,
    ) -> Self {
        Self {
            index,
            registry,
            filter,
            umi_mode: config.umi_mode(),
            track_other: config.track_other_allele,
        }
    }

    /// Normalize one record. Barcodes are only registered for records that pass
    /// every other check.
    pub fn ingest(&self, record: &RawRecord) -> Result<Observation, Rejection> {
        if !self.filter.filter_record(record) {
            return Err(Rejection::LowQuality);
        }

        let site_idx = self
            .index
            .lookup(record.contig.trim(), record.position)
            .ok_or(Rejection::UnknownSite)?;
        let channel = self.classify_allele(site_idx, &record.allele)?;

        let umi = if self.umi_mode {
            let raw = record.umi.as_deref().ok_or(Rejection::MissingUmi)?;
            if raw.trim().is_empty() {
                return Err(Rejection::MissingUmi);
            }
            encode_umi(raw).ok_or(Rejection::MalformedUmi)?
        } else {
            0
        };

        let barcode = normalize_barcode(&record.barcode).ok_or(Rejection::MalformedBarcode)?;
        let cell = self
            .registry
            .id_of_or_insert(&barcode)
            .ok_or(Rejection::UnlistedBarcode)?;

        Ok(Observation {
            cell,
            site: site_idx,
            channel,
            weight: record.weight,
            umi,
        })
    }

    fn classify_allele(&self, site_idx: u32, raw: &str) -> Result<AlleleChannel, Rejection> {
        let site = self.index.site(site_idx).ok_or(Rejection::UnknownSite)?;
        let allele = normalize_allele(raw).ok_or(Rejection::AmbiguousAllele)?;
        if allele == site.ref_allele {
            Ok(AlleleChannel::Ref)
        } else if allele == site.alt_allele {
            Ok(AlleleChannel::Alt)
        } else if self.track_other {
            Ok(AlleleChannel::Other)
        } else {
            Err(Rejection::OtherAllele)
        }
    }
}
