//! Finalized allele count matrices and build bookkeeping

use nalgebra_sparse::CsrMatrix;
use serde::Serialize;

use crate::core::sparse::SparseOps;
use crate::pipeline::snvmat::barcode::BarcodeTable;
use crate::pipeline::snvmat::ingest::RejectionTally;
use crate::pipeline::snvmat::AlleleChannel;

/// Cell × site count matrices, one per allele channel plus coverage.
#[derive(Debug, Clone)]
pub struct AlleleMatrices {
    pub ref_counts: CsrMatrix<u32>,
    pub alt_counts: CsrMatrix<u32>,
    /// Present when other-allele tracking is enabled
    pub other_counts: Option<CsrMatrix<u32>>,
    /// Sum over all channels
    pub coverage: CsrMatrix<u32>,
}

impl AlleleMatrices {
    pub fn n_cells(&self) -> usize {
        self.coverage.nrows()
    }

    pub fn n_sites(&self) -> usize {
        self.coverage.ncols()
    }

    pub fn channel(&self, channel: AlleleChannel) -> Option<&CsrMatrix<u32>> {
        match channel {
            AlleleChannel::Ref => Some(&self.ref_counts),
            AlleleChannel::Alt => Some(&self.alt_counts),
            AlleleChannel::Other => self.other_counts.as_ref(),
        }
    }

    /// Count stored for one (cell, site) pair in one channel.
    pub fn get(&self, channel: AlleleChannel, cell: usize, site: usize) -> u32 {
        self.channel(channel)
            .and_then(|m| m.get_entry(cell, site))
            .map(|e| e.into_value())
            .unwrap_or(0)
    }

    /// Total depth per site across cells.
    pub fn site_depths(&self) -> Vec<u32> {
        SparseOps::compute_col_sums(&self.coverage)
    }

    /// Total depth per cell across sites.
    pub fn cell_depths(&self) -> Vec<u32> {
        SparseOps::compute_row_sums(&self.coverage)
    }

    pub fn channel_total(&self, channel: AlleleChannel) -> u64 {
        self.channel(channel).map(SparseOps::total).unwrap_or(0)
    }
}

/// Counters describing one build.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BuildSummary {
    pub shards: usize,
    /// Records read across all shards, rejected ones included
    pub records_read: u64,
    pub accepted_records: u64,
    /// Accepted weight per channel, before UMI collapse
    pub accepted_weight: [u64; AlleleChannel::COUNT],
    /// Per-channel matrix totals: reads in raw mode, molecules after UMI collapse
    pub counted_molecules: [u64; AlleleChannel::COUNT],
    pub rejections: RejectionTally,
    pub umis: u64,
    pub ambiguous_umis: u64,
    pub spill_runs: usize,
    pub retries: u64,
    pub cells: usize,
    pub sites: usize,
    pub nonzero_pairs: usize,
}

/// Everything a build hands to output adapters.
#[derive(Debug, Clone)]
pub struct BuildOutput {
    pub matrices: AlleleMatrices,
    pub barcodes: BarcodeTable,
    pub summary: BuildSummary,
}
