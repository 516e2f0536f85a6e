//! Parallel construction of allele count matrices
//!
//! Producers run on the shard scheduler's Rayon pool and route observations to
//! accumulator threads by `cell % worker_count`. The barcode registry is the only
//! state shared on the ingest side.

use std::thread;

use crossbeam::channel::{bounded, Sender};
use itertools::Itertools;
use log::*;
use parking_lot::Mutex;
use rayon::prelude::*;

use crate::core::error::{Result, ScsnvError};
use crate::core::fs::ensure_dir;
use crate::core::read_filter::RecordFilter;
use crate::core::sparse::{CsrAssembler, SparseOps};
use crate::engine::shards::{
    CancellationToken, MalformedRow, ShardReport, ShardScheduler, ShardSink, ShardSource,
};
use crate::pipeline::snvmat::accumulator::{
    Accumulator, AccumulatorSettings, Counts, WorkerOutput,
};
use crate::pipeline::snvmat::barcode::{BarcodeRegistry, BarcodeTable};
use crate::pipeline::snvmat::config::BuildConfig;
use crate::pipeline::snvmat::ingest::{
    Observation, RawRecord, ReadIngestor, Rejection, RejectionTally,
};
use crate::pipeline::snvmat::matrices::{AlleleMatrices, BuildOutput, BuildSummary};
use crate::pipeline::snvmat::variant_index::VariantIndex;
use crate::pipeline::snvmat::AlleleChannel;

/// Builds [`AlleleMatrices`] from a sharded record stream.
#[derive(Debug, Clone)]
pub struct MatrixBuilder {
    config: BuildConfig,
}

/// Ingest-side sink owned by one scheduler task.
struct Producer<'a, F: RecordFilter> {
    ingestor: &'a ReadIngestor<'a, F>,
    senders: Vec<Sender<Vec<Observation>>>,
    batches: Vec<Vec<Observation>>,
    batch_size: usize,
    tally: RejectionTally,
    shared_tally: &'a Mutex<RejectionTally>,
}

impl<'a, F: RecordFilter> Producer<'a, F> {
    fn new(
        ingestor: &'a ReadIngestor<'a, F>,
        senders: &[Sender<Vec<Observation>>],
        batch_size: usize,
        shared_tally: &'a Mutex<RejectionTally>,
    ) -> Self {
        Self {
            ingestor,
            senders: senders.to_vec(),
            batches: (0..senders.len())
                .map(|_| Vec::with_capacity(batch_size))
                .collect(),
            batch_size,
            tally: RejectionTally::default(),
            shared_tally,
        }
    }

    fn send(&mut self, worker: usize) -> Result<()> {
        let batch = std::mem::replace(
            &mut self.batches[worker],
            Vec::with_capacity(self.batch_size),
        );
        self.senders[worker]
            .send(batch)
            .map_err(|_| ScsnvError::WorkerDisconnected { worker })
    }
}

impl<F: RecordFilter> ShardSink for Producer<'_, F> {
    fn accept(&mut self, record: RawRecord) -> Result<()> {
        match self.ingestor.ingest(&record) {
            Ok(obs) => {
                let worker = obs.cell as usize % self.senders.len();
                self.batches[worker].push(obs);
                if self.batches[worker].len() >= self.batch_size {
                    self.send(worker)?;
                }
            }
            Err(rejection) => self.tally.record(rejection),
        }
        Ok(())
    }

    fn malformed(&mut self, _row: &MalformedRow) {
        self.tally.record(Rejection::MalformedRecord);
    }

    fn flush(&mut self) -> Result<()> {
        for worker in 0..self.batches.len() {
            if !self.batches[worker].is_empty() {
                self.send(worker)?;
            }
        }
        self.shared_tally.lock().merge(&self.tally);
        self.tally = RejectionTally::default();
        Ok(())
    }
}

/// Raw result of the parallel phase.
struct Accumulated {
    reports: Vec<ShardReport>,
    outputs: Vec<WorkerOutput>,
    rejections: RejectionTally,
}

impl MatrixBuilder {
    pub fn new(config: BuildConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    /// Build matrices for every site in `index`, using the configured whitelist if any.
    pub fn build<S>(&self, source: &S, index: &VariantIndex) -> Result<BuildOutput>
    where
        S: ShardSource + ?Sized,
    {
        self.build_with_cancel(source, index, &CancellationToken::new())
    }

    pub fn build_with_cancel<S>(
        &self,
        source: &S,
        index: &VariantIndex,
        cancel: &CancellationToken,
    ) -> Result<BuildOutput>
    where
        S: ShardSource + ?Sized,
    {
        let registry = match &self.config.whitelist {
            Some(path) => {
                let registry = BarcodeRegistry::from_whitelist_file(path)?;
                info!(
                    "Loaded {} whitelisted barcodes from {}",
                    registry.len(),
                    path.display()
                );
                registry
            }
            None => BarcodeRegistry::open(),
        };
        self.build_with_registry(source, index, registry, cancel)
    }

    /// Build with a caller-supplied registry (open or whitelist).
    ///
    /// Either every shard is counted and the matrices are returned, or the build
    /// fails and no matrix is produced.
    pub fn build_with_registry<S>(
        &self,
        source: &S,
        index: &VariantIndex,
        registry: BarcodeRegistry,
        cancel: &CancellationToken,
    ) -> Result<BuildOutput>
    where
        S: ShardSource + ?Sized,
    {
        if index.is_empty() {
            warn!("Variant index is empty; every record will be rejected");
        }
        if let Some(dir) = &self.config.spill_dir {
            ensure_dir(dir)?;
        }
        info!(
            "Building allele matrices for {} sites with {} workers ({:?}, {} barcodes)",
            index.len(),
            self.config.worker_count,
            self.config.dedup_mode,
            if registry.is_whitelist() { "whitelisted" } else { "open" }
        );

        let accumulated = {
            let ingestor = ReadIngestor::new(index, &registry, &self.config);
            self.accumulate(source, &ingestor, cancel)?
        };
        if cancel.is_cancelled() {
            return Err(ScsnvError::Cancelled);
        }

        let barcodes = registry.freeze();
        self.assemble(accumulated, barcodes, index.len())
    }

    fn accumulate<S, F>(
        &self,
        source: &S,
        ingestor: &ReadIngestor<'_, F>,
        cancel: &CancellationToken,
    ) -> Result<Accumulated>
    where
        S: ShardSource + ?Sized,
        F: RecordFilter,
    {
        let workers = self.config.worker_count;
        let batch_size = self.config.batch_size;
        let settings = AccumulatorSettings::from_config(&self.config);
        let shared_tally = Mutex::new(RejectionTally::default());
        let scheduler = ShardScheduler::new(workers, cancel.clone())?
            .with_retries(self.config.shard_retries)
            .with_timeout(self.config.shard_timeout)
            .with_check_interval(batch_size);

        let (shard_result, worker_results) = thread::scope(|scope| {
            let mut senders = Vec::with_capacity(workers);
            let mut handles = Vec::with_capacity(workers);
            for worker in 0..workers {
                let (tx, rx) = bounded::<Vec<Observation>>(self.config.channel_capacity);
                senders.push(tx);
                let accumulator = Accumulator::new(worker, settings.clone());
                handles.push(scope.spawn(move || accumulator.run(rx)));
            }

            let shard_result = scheduler.run(source, || {
                Producer::new(ingestor, &senders, batch_size, &shared_tally)
            });
            // accumulators finish once the last sender is gone
            drop(senders);

            let worker_results: Vec<Result<WorkerOutput>> = handles
                .into_iter()
                .enumerate()
                .map(|(worker, handle)| {
                    handle
                        .join()
                        .unwrap_or(Err(ScsnvError::WorkerDisconnected { worker }))
                })
                .collect();
            (shard_result, worker_results)
        });

        // a failed worker is the root cause of any disconnect seen by producers
        let mut outputs = Vec::with_capacity(workers);
        for result in worker_results {
            match result {
                Ok(output) => outputs.push(output),
                Err(err) => {
                    error!("Accumulator failed: {}", err);
                    return Err(err);
                }
            }
        }
        let reports = shard_result?;

        Ok(Accumulated {
            reports,
            outputs,
            rejections: shared_tally.into_inner(),
        })
    }

    fn assemble(
        &self,
        accumulated: Accumulated,
        barcodes: BarcodeTable,
        n_sites: usize,
    ) -> Result<BuildOutput> {
        let Accumulated {
            reports,
            mut outputs,
            rejections,
        } = accumulated;
        let n_cells = barcodes.len();

        let mut summary = BuildSummary {
            shards: reports.len(),
            records_read: reports.iter().map(|r| r.records).sum(),
            retries: reports.iter().map(|r| (r.attempts - 1) as u64).sum(),
            rejections,
            cells: n_cells,
            sites: n_sites,
            ..BuildSummary::default()
        };
        for output in &outputs {
            let stats = &output.stats;
            summary.accepted_records += stats.observations;
            for (total, weight) in summary.accepted_weight.iter_mut().zip(stats.accepted_weight) {
                *total += weight;
            }
            summary.umis += stats.umis;
            summary.ambiguous_umis += stats.ambiguous_umis;
            summary.spill_runs += stats.spill_runs;
        }

        outputs.par_iter_mut().for_each(|output| {
            for entry in output.entries.iter_mut() {
                entry.0 = barcodes.final_id(entry.0);
            }
            output.entries.sort_unstable_by_key(|&(cell, site, _)| (cell, site));
        });

        let nnz_hint = outputs.iter().map(|o| o.entries.len()).sum();
        let track_other = self.config.track_other_allele;
        let mut ref_asm = CsrAssembler::with_capacity(n_cells, n_sites, nnz_hint);
        let mut alt_asm = CsrAssembler::with_capacity(n_cells, n_sites, nnz_hint);
        let mut other_asm =
            track_other.then(|| CsrAssembler::with_capacity(n_cells, n_sites, nnz_hint / 4));
        let mut coverage_asm = CsrAssembler::with_capacity(n_cells, n_sites, nnz_hint);

        // worker key sets are disjoint, so the merge never sees a repeated pair
        let merged = outputs
            .into_iter()
            .map(|o| o.entries.into_iter())
            .kmerge_by(|a, b| (a.0, a.1) < (b.0, b.1));
        for (cell, site, counts) in merged {
            let (row, col) = (cell as usize, site as usize);
            ref_asm.push(row, col, counts[AlleleChannel::Ref.index()])?;
            alt_asm.push(row, col, counts[AlleleChannel::Alt.index()])?;
            if let Some(asm) = other_asm.as_mut() {
                asm.push(row, col, counts[AlleleChannel::Other.index()])?;
            }
            coverage_asm.push(row, col, coverage(cell, site, &counts)?)?;
        }
        summary.nonzero_pairs = coverage_asm.nnz();

        let matrices = AlleleMatrices {
            ref_counts: ref_asm.finish()?,
            alt_counts: alt_asm.finish()?,
            other_counts: other_asm.map(CsrAssembler::finish).transpose()?,
            coverage: coverage_asm.finish()?,
        };
        for channel in AlleleChannel::ALL {
            summary.counted_molecules[channel.index()] = matrices.channel_total(channel);
        }
        info!(
            "Built {} × {} matrices with {} non-zero pairs ({} records read, {} rejected, {} retries)",
            n_cells,
            n_sites,
            summary.nonzero_pairs,
            summary.records_read,
            summary.rejections.total(),
            summary.retries
        );
        let (density, _, _) = SparseOps::get_density_stats(&matrices.coverage);
        debug!("Coverage density: {:.6}", density);
        for (reason, count) in summary.rejections.iter() {
            debug!("Rejected {} records: {}", count, reason);
        }

        Ok(BuildOutput {
            matrices,
            barcodes,
            summary,
        })
    }
}

fn coverage(cell: u32, site: u32, counts: &Counts) -> Result<u32> {
    let mut total = 0u32;
    for channel in AlleleChannel::ALL {
        total = total
            .checked_add(counts[channel.index()])
            .ok_or(ScsnvError::CountOverflow {
                cell,
                site,
                channel,
            })?;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::sparse::SparseOps;
    use crate::engine::shards::{InMemoryShards, RecordStream, TsvShards};
    use crate::pipeline::snvmat::config::DedupMode;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::tempdir;

    fn index() -> VariantIndex {
        let mut index = VariantIndex::new();
        index.register("chr1", 100, "A", "G").unwrap();
        index.register("chr1", 200, "C", "T").unwrap();
        index.register("chr2", 50, "G", "A").unwrap();
        index
    }

    fn config(workers: usize) -> BuildConfig {
        BuildConfig {
            worker_count: workers,
            batch_size: 8,
            channel_capacity: 2,
            ..BuildConfig::default()
        }
    }

    fn entry(m: &nalgebra_sparse::CsrMatrix<u32>, row: usize, col: usize) -> Option<u32> {
        m.get_entry(row, col).map(|e| e.into_value()).filter(|&v| v > 0)
    }

    fn has_explicit_zero(m: &nalgebra_sparse::CsrMatrix<u32>) -> bool {
        m.values().iter().any(|&v| v == 0)
    }

    #[test]
    fn ref_and_alt_counts_land_in_their_channels() {
        let records = vec![
            RawRecord::new("AAAA-1", "chr1", 100, "A", 30).with_weight(10),
            RawRecord::new("AAAA-1", "chr1", 100, "G", 30).with_weight(0),
            RawRecord::new("CCCC-1", "chr1", 100, "A", 30).with_weight(0),
            RawRecord::new("CCCC-1", "chr1", 100, "G", 30).with_weight(8),
            // a zero-weight record still registers its barcode
            RawRecord::new("TTTT-1", "chr1", 200, "C", 30).with_weight(0),
        ];
        let builder = MatrixBuilder::new(config(2)).unwrap();
        let out = builder
            .build(&InMemoryShards::new(vec![records]), &index())
            .unwrap();
        let m = &out.matrices;
        let a = out.barcodes.id_of("AAAA").unwrap() as usize;
        let b = out.barcodes.id_of("CCCC").unwrap() as usize;

        assert_eq!(entry(&m.ref_counts, a, 0), Some(10));
        assert_eq!(entry(&m.ref_counts, b, 0), None);
        assert_eq!(entry(&m.alt_counts, b, 0), Some(8));
        assert_eq!(entry(&m.alt_counts, a, 0), None);
        assert_eq!(m.ref_counts.nnz(), 1);
        assert_eq!(m.alt_counts.nnz(), 1);
        assert_eq!(m.coverage.nnz(), 2);
        assert_eq!(m.site_depths(), vec![18, 0, 0]);
        assert_eq!(out.summary.accepted_records, 5);
        assert_eq!(out.summary.accepted_weight, [10, 8, 0]);
        assert_eq!(out.summary.counted_molecules, [10, 8, 0]);
        assert_eq!(out.barcodes.len(), 3);
        let t = out.barcodes.id_of("TTTT").unwrap() as usize;
        assert_eq!(m.cell_depths()[t], 0);
    }

    #[test]
    fn rejected_records_are_tallied_not_counted() {
        let records = vec![
            RawRecord::new("AAAA", "chr1", 100, "A", 5),
            RawRecord::new("AAAA", "chr9", 100, "A", 30),
            RawRecord::new("AAAA", "chr1", 100, "N", 30),
            RawRecord::new("A!AA", "chr1", 100, "A", 30),
            RawRecord::new("AAAA", "chr1", 200, "C", 30),
            RawRecord::new("GGGG", "chr1", 200, "A", 30),
        ];
        let builder = MatrixBuilder::new(config(3)).unwrap();
        let out = builder
            .build(&InMemoryShards::split(records, 2), &index())
            .unwrap();
        let tally = &out.summary.rejections;
        assert_eq!(tally.get(Rejection::LowQuality), 1);
        assert_eq!(tally.get(Rejection::UnknownSite), 1);
        assert_eq!(tally.get(Rejection::AmbiguousAllele), 1);
        assert_eq!(tally.get(Rejection::MalformedBarcode), 1);
        assert_eq!(out.summary.records_read, 6);
        assert_eq!(out.summary.accepted_records, 2);
        // only barcodes of accepted records become cells
        assert_eq!(out.barcodes.len(), 2);
        let other = out.matrices.other_counts.as_ref().unwrap();
        let g = out.barcodes.id_of("GGGG").unwrap() as usize;
        assert_eq!(entry(other, g, 1), Some(1));
    }

    #[test]
    fn unparseable_rows_are_tallied_and_skipped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("s0.tsv");
        std::fs::write(
            &path,
            "barcode\tcontig\tposition\tallele\tquality\n\
             AAAA\tchr1\t100\tA\t30\n\
             CCCC\tchr1\t100\tG\t30.5\n\
             GGGG\tchr1\t100\tG\t30\n",
        )
        .unwrap();
        let builder = MatrixBuilder::new(config(2)).unwrap();
        let out = builder.build(&TsvShards::new([&path]), &index()).unwrap();

        assert_eq!(out.summary.records_read, 3);
        assert_eq!(out.summary.retries, 0);
        assert_eq!(out.summary.rejections.get(Rejection::MalformedRecord), 1);
        assert_eq!(out.summary.accepted_weight, [1, 1, 0]);
        assert_eq!(out.barcodes.len(), 2);
        assert!(out.barcodes.id_of("CCCC").is_none());
        let g = out.barcodes.id_of("GGGG").unwrap() as usize;
        assert_eq!(entry(&out.matrices.alt_counts, g, 0), Some(1));
    }

    #[test]
    fn other_matrix_is_absent_when_untracked() {
        let records = vec![
            RawRecord::new("AAAA", "chr1", 100, "T", 30),
            RawRecord::new("AAAA", "chr1", 100, "A", 30),
        ];
        let builder = MatrixBuilder::new(BuildConfig {
            track_other_allele: false,
            ..config(1)
        })
        .unwrap();
        let out = builder
            .build(&InMemoryShards::new(vec![records]), &index())
            .unwrap();
        assert!(out.matrices.other_counts.is_none());
        assert_eq!(out.summary.rejections.get(Rejection::OtherAllele), 1);
        assert_eq!(out.matrices.channel_total(AlleleChannel::Ref), 1);
    }

    #[test]
    fn overflow_aborts_without_matrices() {
        let records = vec![
            RawRecord::new("AAAA", "chr1", 100, "A", 30).with_weight(u32::MAX),
            RawRecord::new("AAAA", "chr1", 100, "A", 30).with_weight(u32::MAX),
        ];
        let builder = MatrixBuilder::new(config(2)).unwrap();
        let result = builder.build(&InMemoryShards::new(vec![records]), &index());
        assert!(matches!(
            result,
            Err(ScsnvError::CountOverflow {
                site: 0,
                channel: AlleleChannel::Ref,
                ..
            })
        ));
    }

    #[test]
    fn coverage_overflow_across_channels_is_reported() {
        let records = vec![
            RawRecord::new("AAAA", "chr1", 100, "A", 30).with_weight(u32::MAX),
            RawRecord::new("AAAA", "chr1", 100, "G", 30).with_weight(1),
        ];
        let builder = MatrixBuilder::new(config(1)).unwrap();
        let result = builder.build(&InMemoryShards::new(vec![records]), &index());
        assert!(matches!(
            result,
            Err(ScsnvError::CountOverflow {
                channel: AlleleChannel::Alt,
                ..
            })
        ));
    }

    #[test]
    fn spilling_does_not_change_the_result() {
        let records: Vec<RawRecord> = (0..600u32)
            .map(|i| {
                let barcode = ["AAAA", "CCCC", "GGGG", "TTTT", "ACGT"][(i % 5) as usize];
                let (contig, pos, allele) = match i % 3 {
                    0 => ("chr1", 100, ["A", "G", "T"][(i % 7 % 3) as usize]),
                    1 => ("chr1", 200, ["C", "T"][(i % 2) as usize]),
                    _ => ("chr2", 50, "A"),
                };
                RawRecord::new(barcode, contig, pos, allele, 30).with_weight(1 + i % 3)
            })
            .collect();
        let source = InMemoryShards::split(records, 4);

        let plain = MatrixBuilder::new(config(2)).unwrap().build(&source, &index()).unwrap();
        let dir = tempdir().unwrap();
        let spilling = MatrixBuilder::new(BuildConfig {
            memory_ceiling_per_worker: 1,
            spill_dir: Some(dir.path().to_path_buf()),
            ..config(2)
        })
        .unwrap()
        .build(&source, &index())
        .unwrap();

        assert!(spilling.summary.spill_runs > 0);
        assert_eq!(plain.summary.spill_runs, 0);
        assert_eq!(plain.matrices.ref_counts, spilling.matrices.ref_counts);
        assert_eq!(plain.matrices.alt_counts, spilling.matrices.alt_counts);
        assert_eq!(plain.matrices.other_counts, spilling.matrices.other_counts);
        assert_eq!(plain.matrices.coverage, spilling.matrices.coverage);
    }

    #[test]
    fn thousands_of_spills_complete_with_one_worker() {
        let bases = ["A", "C", "G", "T"];
        let records: Vec<RawRecord> = (0..3000usize)
            .map(|i| {
                let cell = i / 3;
                let barcode: String = (0..5).map(|d| bases[(cell >> (2 * d)) & 3]).collect();
                let sites = [("chr1", 100, "A"), ("chr1", 200, "T"), ("chr2", 50, "G")];
                let (contig, pos, allele) = sites[i % 3];
                RawRecord::new(barcode, contig, pos, allele, 30)
            })
            .collect();
        let out = MatrixBuilder::new(BuildConfig {
            memory_ceiling_per_worker: 1,
            ..config(1)
        })
        .unwrap()
        .build(&InMemoryShards::new(vec![records]), &index())
        .unwrap();

        assert_eq!(out.summary.spill_runs, 3000);
        assert_eq!(out.barcodes.len(), 1000);
        assert_eq!(out.matrices.coverage.nnz(), 3000);
        assert_eq!(out.summary.accepted_weight, [2000, 1000, 0]);
    }

    #[test]
    fn umi_mode_counts_molecules() {
        let read = |barcode: &str, allele: &str, umi: &str| {
            RawRecord::new(barcode, "chr1", 100, allele, 30).with_umi(umi)
        };
        let records = vec![
            // three reads, one molecule, consensus ref
            read("AAAA", "A", "ACGTAC"),
            read("AAAA", "A", "ACGTAC"),
            read("AAAA", "G", "ACGTAC"),
            // single-read molecules
            read("AAAA", "G", "TTTTTT"),
            read("AAAA", "G", "GGGGGG"),
            // split molecule, dropped
            read("CCCC", "A", "CCCCCC"),
            read("CCCC", "G", "CCCCCC"),
            // same UMI in another cell is a different molecule
            read("CCCC", "G", "TTTTTT"),
        ];
        let builder = MatrixBuilder::new(BuildConfig {
            dedup_mode: DedupMode::UmiCollapsed,
            ..config(2)
        })
        .unwrap();
        let out = builder
            .build(&InMemoryShards::split(records, 3), &index())
            .unwrap();
        let m = &out.matrices;
        let a = out.barcodes.id_of("AAAA").unwrap() as usize;
        let c = out.barcodes.id_of("CCCC").unwrap() as usize;
        assert_eq!(entry(&m.ref_counts, a, 0), Some(1));
        assert_eq!(entry(&m.alt_counts, a, 0), Some(2));
        assert_eq!(entry(&m.ref_counts, c, 0), None);
        assert_eq!(entry(&m.alt_counts, c, 0), Some(1));
        assert_eq!(out.summary.umis, 5);
        assert_eq!(out.summary.ambiguous_umis, 1);
        assert_eq!(out.summary.accepted_weight, [3, 5, 0]);
        // molecules, not reads, reach the matrices
        assert_eq!(out.summary.counted_molecules, [1, 3, 0]);
        for channel in AlleleChannel::ALL {
            assert_eq!(
                m.channel_total(channel),
                out.summary.counted_molecules[channel.index()]
            );
        }
    }

    #[test]
    fn whitelist_fixes_rows_and_refuses_strangers() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("whitelist.tsv");
        std::fs::write(&path, "TTTT-1\nAAAA-1\nGGGG-1\n").unwrap();
        let records = vec![
            RawRecord::new("AAAA-1", "chr1", 100, "A", 30),
            RawRecord::new("CCCC-1", "chr1", 100, "A", 30),
        ];
        let builder = MatrixBuilder::new(BuildConfig {
            whitelist: Some(path),
            ..config(2)
        })
        .unwrap();
        let out = builder
            .build(&InMemoryShards::new(vec![records]), &index())
            .unwrap();
        assert_eq!(out.matrices.n_cells(), 3);
        assert_eq!(out.barcodes.barcode_by_id(1), Some("AAAA"));
        assert_eq!(entry(&out.matrices.ref_counts, 1, 0), Some(1));
        assert_eq!(out.summary.rejections.get(Rejection::UnlistedBarcode), 1);
        assert_eq!(out.matrices.cell_depths(), vec![0, 1, 0]);
    }

    /// Fails shard `shard` at record `fail_at` while the budget lasts.
    struct FlakyShards {
        inner: InMemoryShards,
        shard: usize,
        fail_at: u64,
        failures: AtomicU32,
    }

    impl ShardSource for FlakyShards {
        fn shard_count(&self) -> usize {
            self.inner.shard_count()
        }

        fn open(&self, shard: usize, offset: u64) -> anyhow::Result<RecordStream<'_>> {
            let stream = self.inner.open(shard, offset)?;
            if shard != self.shard {
                return Ok(stream);
            }
            Ok(Box::new(stream.enumerate().map(move |(i, item)| {
                if offset + i as u64 == self.fail_at
                    && self
                        .failures
                        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
                        .is_ok()
                {
                    anyhow::bail!("connection reset");
                }
                item
            })))
        }
    }

    fn flaky_records() -> Vec<Vec<RawRecord>> {
        (0..3)
            .map(|s| {
                (0..40)
                    .map(|i| {
                        let barcode = ["AAAA", "CCCC", "GGGG"][(i + s) % 3];
                        RawRecord::new(barcode, "chr1", 100, "A", 30)
                    })
                    .collect()
            })
            .collect()
    }

    #[test]
    fn retried_shard_is_counted_once() {
        let source = FlakyShards {
            inner: InMemoryShards::new(flaky_records()),
            shard: 1,
            fail_at: 21,
            failures: AtomicU32::new(1),
        };
        let out = MatrixBuilder::new(config(2))
            .unwrap()
            .build(&source, &index())
            .unwrap();
        assert_eq!(out.summary.retries, 1);
        assert_eq!(out.summary.records_read, 120);
        assert_eq!(out.matrices.channel_total(AlleleChannel::Ref), 120);
    }

    #[test]
    fn persistent_shard_failure_aborts_build() {
        let source = FlakyShards {
            inner: InMemoryShards::new(flaky_records()),
            shard: 0,
            fail_at: 5,
            failures: AtomicU32::new(u32::MAX),
        };
        let builder = MatrixBuilder::new(BuildConfig {
            shard_retries: 1,
            ..config(1)
        })
        .unwrap();
        match builder.build(&source, &index()) {
            Err(ScsnvError::BuildAborted { shard, offset, .. }) => {
                assert_eq!((shard, offset), (0, 5));
            }
            other => panic!("expected BuildAborted, got {other:?}"),
        }
    }

    #[test]
    fn cancelled_build_returns_no_matrices() {
        let token = CancellationToken::new();
        token.cancel();
        let builder = MatrixBuilder::new(config(2)).unwrap();
        let result = builder.build_with_cancel(
            &InMemoryShards::new(flaky_records()),
            &index(),
            &token,
        );
        assert!(matches!(result, Err(ScsnvError::Cancelled)));
    }

    #[test]
    fn empty_source_yields_empty_matrices() {
        let builder = MatrixBuilder::new(config(2)).unwrap();
        let out = builder
            .build(&InMemoryShards::default(), &index())
            .unwrap();
        assert_eq!(out.matrices.n_cells(), 0);
        assert_eq!(out.matrices.n_sites(), 3);
        assert_eq!(out.summary.shards, 0);
    }

    prop_compose! {
        fn arb_record()(
            cell in 0..12usize,
            site in 0..3usize,
            allele in 0..4usize,
            weight in 0..5u32,
            quality in 10..40u8,
        ) -> RawRecord {
            let barcodes = ["AAAC", "AAAG", "AACT", "ACGT", "CCCA", "CGTA",
                            "GGAT", "GTCA", "TACG", "TTGA", "TTTT", "NACG"];
            let (contig, pos) = [("chr1", 100), ("chr1", 200), ("chr2", 50)][site];
            let allele = ["A", "C", "G", "T"][allele];
            RawRecord::new(barcodes[cell], contig, pos, allele, quality).with_weight(weight)
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]
        #[test]
        fn matrices_do_not_depend_on_layout(
            records in prop::collection::vec(arb_record(), 0..300),
            workers in 1..5usize,
            shards in 1..6usize,
        ) {
            let index = index();
            let reference = MatrixBuilder::new(config(1))
                .unwrap()
                .build(&InMemoryShards::new(vec![records.clone()]), &index)
                .unwrap();
            let parallel = MatrixBuilder::new(config(workers))
                .unwrap()
                .build(&InMemoryShards::split(records.clone(), shards), &index)
                .unwrap();

            let expected_barcodes: Vec<&str> = reference.barcodes.barcodes().collect();
            let actual_barcodes: Vec<&str> = parallel.barcodes.barcodes().collect();
            prop_assert_eq!(expected_barcodes, actual_barcodes);
            prop_assert_eq!(&reference.matrices.ref_counts, &parallel.matrices.ref_counts);
            prop_assert_eq!(&reference.matrices.alt_counts, &parallel.matrices.alt_counts);
            prop_assert_eq!(&reference.matrices.other_counts, &parallel.matrices.other_counts);
            prop_assert_eq!(&reference.matrices.coverage, &parallel.matrices.coverage);

            // channel totals equal accepted weight in raw-read mode
            let m = &parallel.matrices;
            for channel in AlleleChannel::ALL {
                prop_assert_eq!(
                    m.channel_total(channel),
                    parallel.summary.accepted_weight[channel.index()]
                );
                prop_assert_eq!(
                    parallel.summary.counted_molecules[channel.index()],
                    parallel.summary.accepted_weight[channel.index()]
                );
            }
            let accepted: u64 = records
                .iter()
                .filter(|r| r.quality >= 20)
                .map(|r| r.weight as u64)
                .sum();
            prop_assert_eq!(SparseOps::total(&m.coverage), accepted);

            for matrix in [&m.ref_counts, &m.alt_counts, &m.coverage] {
                prop_assert!(!has_explicit_zero(matrix));
            }
            prop_assert_eq!(m.coverage.nnz(), parallel.summary.nonzero_pairs);
        }
    }
}
