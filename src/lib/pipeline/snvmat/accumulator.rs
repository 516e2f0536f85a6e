//! Worker-owned count accumulators
//!
//! Each accumulator owns every (cell, site) key routed to it, so counting never
//! takes a lock and finalization never merges a key across workers.

use std::path::PathBuf;

use crossbeam::channel::Receiver;
use itertools::Itertools;
use log::{debug, trace};
use rustc_hash::FxHashMap;

use crate::core::error::{Result, ScsnvError};
use crate::pipeline::snvmat::config::BuildConfig;
use crate::pipeline::snvmat::ingest::Observation;
use crate::pipeline::snvmat::spill::{SpillRun, SpillWriter};
use crate::pipeline::snvmat::AlleleChannel;

/// Per-channel counts in [`AlleleChannel::index`] order.
pub type Counts = [u32; AlleleChannel::COUNT];

/// Accumulator key. `umi` is 0 in raw-read mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryKey {
    pub cell: u32,
    pub site: u32,
    pub umi: u64,
}

/// Approximate resident bytes of one map entry, hash table overhead included.
pub const ENTRY_FOOTPRINT: usize = std::mem::size_of::<(EntryKey, Counts)>() + 8;

/// Most spill runs a worker keeps open. Reaching it merges all runs into one.
pub const MAX_OPEN_RUNS: usize = 64;

type EntryStream = Box<dyn Iterator<Item = Result<(EntryKey, Counts)>>>;

/// Settings an accumulator needs from [`BuildConfig`].
#[derive(Debug, Clone)]
pub struct AccumulatorSettings {
    pub max_entries: usize,
    pub spill_dir: Option<PathBuf>,
    pub umi_mode: bool,
    pub consensus_fraction: f64,
}

impl AccumulatorSettings {
    pub fn from_config(config: &BuildConfig) -> Self {
        Self {
            max_entries: (config.memory_ceiling_per_worker / ENTRY_FOOTPRINT).max(1),
            spill_dir: config.spill_dir.clone(),
            umi_mode: config.umi_mode(),
            consensus_fraction: config.umi_consensus_fraction,
        }
    }
}

/// Counters reported by one accumulator.
#[derive(Debug, Clone, Copy, Default)]
pub struct AccumulatorStats {
    pub observations: u64,
    pub accepted_weight: [u64; AlleleChannel::COUNT],
    pub spill_runs: usize,
    pub umis: u64,
    pub ambiguous_umis: u64,
}

/// Finalized, (cell, site)-sorted entries of one worker, still keyed by
/// provisional cell id.
#[derive(Debug, Default)]
pub struct WorkerOutput {
    pub worker: usize,
    pub entries: Vec<(u32, u32, Counts)>,
    pub stats: AccumulatorStats,
}

pub struct Accumulator {
    worker: usize,
    settings: AccumulatorSettings,
    entries: FxHashMap<EntryKey, Counts>,
    runs: Vec<SpillRun>,
    stats: AccumulatorStats,
}

#[inline]
fn add_count(counts: &mut Counts, channel: AlleleChannel, amount: u32, key: &EntryKey) -> Result<()> {
    let slot = &mut counts[channel.index()];
    *slot = slot
        .checked_add(amount)
        .ok_or(ScsnvError::CountOverflow {
            cell: key.cell,
            site: key.site,
            channel,
        })?;
    Ok(())
}

fn add_counts(into: &mut Counts, from: &Counts, key: &EntryKey) -> Result<()> {
    for channel in AlleleChannel::ALL {
        add_count(into, channel, from[channel.index()], key)?;
    }
    Ok(())
}

/// K-way merge of key-sorted streams, coalescing equal keys into `emit`.
///
/// Errors sort first so a failed read surfaces before any output.
fn merge_coalesced<F>(sources: Vec<EntryStream>, mut emit: F) -> Result<()>
where
    F: FnMut(EntryKey, Counts) -> Result<()>,
{
    let merged = sources.into_iter().kmerge_by(|a, b| match (a, b) {
        (Err(_), _) => true,
        (_, Err(_)) => false,
        (Ok((ka, _)), Ok((kb, _))) => ka < kb,
    });

    let mut current: Option<(EntryKey, Counts)> = None;
    for item in merged {
        let (key, counts) = item?;
        match current.as_mut() {
            Some((cur_key, cur_counts)) if *cur_key == key => {
                add_counts(cur_counts, &counts, &key)?;
            }
            _ => {
                if let Some((done_key, done_counts)) = current.take() {
                    emit(done_key, done_counts)?;
                }
                current = Some((key, counts));
            }
        }
    }
    if let Some((key, counts)) = current {
        emit(key, counts)?;
    }
    Ok(())
}

impl Accumulator {
    pub fn new(worker: usize, settings: AccumulatorSettings) -> Self {
        Self {
            worker,
            entries: FxHashMap::with_capacity_and_hasher(
                settings.max_entries.min(1 << 16),
                Default::default(),
            ),
            settings,
            runs: Vec::new(),
            stats: AccumulatorStats::default(),
        }
    }

    /// Drain batches until every sender is gone, then finalize.
    pub fn run(mut self, receiver: Receiver<Vec<Observation>>) -> Result<WorkerOutput> {
        for batch in receiver.iter() {
            for obs in &batch {
                self.add(obs)?;
            }
        }
        trace!("Accumulator {} input exhausted", self.worker);
        self.finalize()
    }

    pub fn add(&mut self, obs: &Observation) -> Result<()> {
        self.stats.observations += 1;
        if obs.weight == 0 {
            return Ok(());
        }
        let key = EntryKey {
            cell: obs.cell,
            site: obs.site,
            umi: obs.umi,
        };
        let counts = self.entries.entry(key).or_insert([0; AlleleChannel::COUNT]);
        add_count(counts, obs.channel, obs.weight, &key)?;
        self.stats.accepted_weight[obs.channel.index()] += obs.weight as u64;

        if self.entries.len() >= self.settings.max_entries {
            self.spill()?;
        }
        Ok(())
    }

    fn sorted_entries(&mut self) -> Vec<(EntryKey, Counts)> {
        let mut entries: Vec<_> = self.entries.drain().collect();
        entries.sort_unstable_by_key(|(key, _)| *key);
        entries
    }

    fn spill(&mut self) -> Result<()> {
        let entries = self.sorted_entries();
        let run = SpillRun::write(&entries, self.settings.spill_dir.as_deref())?;
        self.runs.push(run);
        self.stats.spill_runs += 1;
        self.entries.shrink_to(self.settings.max_entries.min(1 << 16));
        debug!(
            "Accumulator {} spilled {} entries (run {})",
            self.worker,
            entries.len(),
            self.stats.spill_runs
        );
        if self.runs.len() >= MAX_OPEN_RUNS {
            self.compact_runs()?;
        }
        Ok(())
    }

    /// Merge every open run into a single run.
    fn compact_runs(&mut self) -> Result<()> {
        let sources: Vec<EntryStream> = self
            .runs
            .drain(..)
            .map(|run| Box::new(run.into_reader()) as EntryStream)
            .collect();
        let merged_runs = sources.len();
        let mut writer = SpillWriter::create(self.settings.spill_dir.as_deref())?;
        merge_coalesced(sources, |key, counts| writer.push(&key, &counts))?;
        let run = writer.finish()?;
        debug!(
            "Accumulator {} compacted {} runs into {} entries",
            self.worker,
            merged_runs,
            run.len()
        );
        self.runs.push(run);
        Ok(())
    }

    /// Spill runs currently held open.
    pub fn open_runs(&self) -> usize {
        self.runs.len()
    }

    /// Merge spill runs with the in-memory entries, coalesce equal keys and
    /// collapse UMIs into per-(cell, site) counts.
    pub fn finalize(mut self) -> Result<WorkerOutput> {
        let memory = self.sorted_entries();

        let mut sources: Vec<EntryStream> = Vec::with_capacity(self.runs.len() + 1);
        sources.push(Box::new(memory.into_iter().map(Ok)));
        for run in self.runs.drain(..) {
            sources.push(Box::new(run.into_reader()));
        }

        let mut collapser = Collapser::new(&self.settings);
        merge_coalesced(sources, |key, counts| collapser.push(key, counts))?;
        let (entries, umis, ambiguous) = collapser.finish();
        self.stats.umis = umis;
        self.stats.ambiguous_umis = ambiguous;

        debug!(
            "Accumulator {} finalized {} entries from {} observations",
            self.worker,
            entries.len(),
            self.stats.observations
        );
        Ok(WorkerOutput {
            worker: self.worker,
            entries,
            stats: self.stats,
        })
    }
}

/// Folds key-sorted, coalesced entries into one count triple per (cell, site).
struct Collapser {
    umi_mode: bool,
    fraction: f64,
    pending: Option<(u32, u32, Counts)>,
    out: Vec<(u32, u32, Counts)>,
    umis: u64,
    ambiguous: u64,
}

impl Collapser {
    fn new(settings: &AccumulatorSettings) -> Self {
        Self {
            umi_mode: settings.umi_mode,
            fraction: settings.consensus_fraction,
            pending: None,
            out: Vec::new(),
            umis: 0,
            ambiguous: 0,
        }
    }

    /// Channel supported by at least `fraction` of a UMI's reads.
    fn consensus(&self, counts: &Counts) -> Option<AlleleChannel> {
        let total: u64 = counts.iter().map(|&c| c as u64).sum();
        if total == 0 {
            return None;
        }
        let (best, &max) = counts.iter().enumerate().max_by_key(|&(_, c)| *c)?;
        if max as f64 / total as f64 >= self.fraction {
            AlleleChannel::from_index(best)
        } else {
            None
        }
    }

    fn push(&mut self, key: EntryKey, counts: Counts) -> Result<()> {
        let contribution = if self.umi_mode {
            if counts.iter().all(|&c| c == 0) {
                return Ok(());
            }
            self.umis += 1;
            match self.consensus(&counts) {
                Some(channel) => {
                    let mut vote = [0; AlleleChannel::COUNT];
                    vote[channel.index()] = 1;
                    vote
                }
                None => {
                    self.ambiguous += 1;
                    return Ok(());
                }
            }
        } else {
            counts
        };

        match self.pending.as_mut() {
            Some((cell, site, acc)) if *cell == key.cell && *site == key.site => {
                add_counts(acc, &contribution, &key)?;
            }
            _ => {
                self.emit();
                self.pending = Some((key.cell, key.site, contribution));
            }
        }
        Ok(())
    }

    fn emit(&mut self) {
        if let Some(entry) = self.pending.take() {
            if entry.2.iter().any(|&c| c > 0) {
                self.out.push(entry);
            }
        }
    }

    fn finish(mut self) -> (Vec<(u32, u32, Counts)>, u64, u64) {
        self.emit();
        (self.out, self.umis, self.ambiguous)
    }
}
