//! Cell × variant allele count matrices.
//!
//! Records stream in through a [`ShardSource`](crate::engine::shards::ShardSource),
//! are normalized by the [`ReadIngestor`], counted by worker-owned accumulators
//! and finalized by the [`MatrixBuilder`] into one CSR matrix per allele channel.

pub mod accumulator;
pub mod barcode;
pub mod builder;
pub mod config;
pub mod ingest;
pub mod matrices;
pub mod spill;
pub mod utils;
pub mod variant_index;

use serde::Serialize;
use std::fmt;

pub use barcode::{normalize_barcode, BarcodeRegistry, BarcodeTable};
pub use builder::MatrixBuilder;
pub use config::{BuildConfig, DedupMode};
pub use ingest::{Observation, RawRecord, ReadIngestor, Rejection, RejectionTally};
pub use matrices::{AlleleMatrices, BuildOutput, BuildSummary};
pub use utils::read_sites_from_tsv;
pub use variant_index::{VariantIndex, VariantSite};

/// Allele channel an observation is counted in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum AlleleChannel {
    Ref,
    Alt,
    Other,
}

impl AlleleChannel {
    pub const COUNT: usize = 3;
    pub const ALL: [AlleleChannel; 3] = [AlleleChannel::Ref, AlleleChannel::Alt, AlleleChannel::Other];

    /// Slot of this channel in a `[u32; 3]` count triple.
    #[inline(always)]
    pub fn index(self) -> usize {
        match self {
            AlleleChannel::Ref => 0,
            AlleleChannel::Alt => 1,
            AlleleChannel::Other => 2,
        }
    }

    #[inline]
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }
}

impl fmt::Display for AlleleChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AlleleChannel::Ref => "ref",
            AlleleChannel::Alt => "alt",
            AlleleChannel::Other => "other",
        };
        f.write_str(name)
    }
}
