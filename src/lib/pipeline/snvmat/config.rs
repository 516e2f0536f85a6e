//! Matrix builder configuration

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::concurrency::determine_allowed_cpus;
use crate::core::error::{Result, ScsnvError};

/// Default fraction of a UMI's reads that must agree on a channel.
pub const DEFAULT_UMI_CONSENSUS_FRACTION: f64 = 0.6;

/// How repeated evidence for a (cell, site) pair is counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum DedupMode {
    /// Every accepted read contributes its weight.
    #[default]
    RawReads,
    /// Reads sharing a UMI collapse into a single consensus molecule.
    UmiCollapsed,
}

/// Configuration for [`MatrixBuilder`](super::MatrixBuilder).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Read or UMI counting
    pub dedup_mode: DedupMode,
    /// Minimum base quality for an observation to be counted
    pub quality_threshold: u8,
    /// Number of producer threads and accumulator workers
    pub worker_count: usize,
    /// Approximate in-memory budget of one accumulator before it spills, in bytes
    pub memory_ceiling_per_worker: usize,
    /// Directory for spill runs (system temp dir when unset)
    pub spill_dir: Option<PathBuf>,
    /// Number of times a failing shard is resumed before the build aborts
    pub shard_retries: u32,
    /// Wall-clock budget of one shard attempt
    pub shard_timeout: Option<Duration>,
    /// Observations per batch sent to an accumulator
    pub batch_size: usize,
    /// Batches buffered per accumulator channel
    pub channel_capacity: usize,
    /// Share of a UMI's reads that must support one channel, in (0.5, 1]
    pub umi_consensus_fraction: f64,
    /// Count non-ref, non-alt nucleotides in the `other` channel
    pub track_other_allele: bool,
    /// Restrict cells to the barcodes listed in this file
    pub whitelist: Option<PathBuf>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            dedup_mode: DedupMode::RawReads,
            quality_threshold: 20,
            worker_count: num_cpus::get().clamp(1, 8),
            memory_ceiling_per_worker: 256 * 1024 * 1024,
            spill_dir: None,
            shard_retries: 2,
            shard_timeout: None,
            batch_size: 4096,
            channel_capacity: 64,
            umi_consensus_fraction: DEFAULT_UMI_CONSENSUS_FRACTION,
            track_other_allele: true,
            whitelist: None,
        }
    }
}

impl BuildConfig {
    /// Check parameter ranges and resolve the worker count against available CPUs.
    pub fn validate(&self) -> Result<()> {
        determine_allowed_cpus(self.worker_count)?;

        if self.batch_size == 0 {
            return Err(ScsnvError::Config(
                "batch_size must be greater than 0".to_string(),
            ));
        }
        if self.channel_capacity == 0 {
            return Err(ScsnvError::Config(
                "channel_capacity must be greater than 0".to_string(),
            ));
        }
        if self.memory_ceiling_per_worker == 0 {
            return Err(ScsnvError::Config(
                "memory_ceiling_per_worker must be greater than 0".to_string(),
            ));
        }
        let fraction = self.umi_consensus_fraction;
        if !(fraction > 0.5 && fraction <= 1.0) {
            return Err(ScsnvError::ThresholdValidation {
                field: "umi_consensus_fraction".to_string(),
                min: 0.5,
                max: 1.0,
                value: fraction,
            });
        }
        if let Some(timeout) = self.shard_timeout {
            if timeout.is_zero() {
                return Err(ScsnvError::Config(
                    "shard_timeout must be non-zero when set".to_string(),
                ));
            }
        }
        if let Some(dir) = &self.spill_dir {
            if dir.exists() && !dir.is_dir() {
                return Err(ScsnvError::Config(format!(
                    "spill_dir {} is not a directory",
                    dir.display()
                )));
            }
        }
        Ok(())
    }

    pub fn umi_mode(&self) -> bool {
        self.dedup_mode == DedupMode::UmiCollapsed
    }
}
