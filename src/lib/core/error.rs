//! Error types for the scSNV library

use thiserror::Error;

use crate::pipeline::snvmat::AlleleChannel;

#[derive(Error, Debug)]
pub enum ScsnvError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Input source error: {0}")]
    Source(#[from] anyhow::Error),

    #[error("Sparse matrix error: {0}")]
    SparseMatrix(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Threshold validation error: {field} must be between {min} and {max}, got {value}")]
    ThresholdValidation {
        field: String,
        min: f64,
        max: f64,
        value: f64,
    },

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: String, actual: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(
        "Site {contig}:{position} already registered as {existing_ref}>{existing_alt}, \
         refusing conflicting {ref_allele}>{alt_allele}"
    )]
    DuplicateSite {
        contig: String,
        position: u64,
        existing_ref: String,
        existing_alt: String,
        ref_allele: String,
        alt_allele: String,
    },

    #[error("Count overflow for cell {cell} at site {site} ({channel} channel)")]
    CountOverflow {
        cell: u32,
        site: u32,
        channel: AlleleChannel,
    },

    #[error("Shard {shard} exceeded its time budget of {limit_ms} ms")]
    ShardTimeout { shard: usize, limit_ms: u128 },

    #[error("Accumulator worker {worker} stopped before the stream was exhausted")]
    WorkerDisconnected { worker: usize },

    #[error(
        "Build aborted at shard {shard} (record offset {offset}); {} shard(s) already flushed: {source}",
        .flushed_shards.len()
    )]
    BuildAborted {
        shard: usize,
        offset: u64,
        flushed_shards: Vec<usize>,
        #[source]
        source: Box<ScsnvError>,
    },

    #[error("Build cancelled")]
    Cancelled,
}

impl ScsnvError {
    /// Whether a shard interrupted by this error may be resumed from its offset.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ScsnvError::Io(_) | ScsnvError::Source(_) | ScsnvError::ShardTimeout { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ScsnvError>;

impl From<nalgebra_sparse::SparseFormatError> for ScsnvError {
    fn from(err: nalgebra_sparse::SparseFormatError) -> Self {
        ScsnvError::SparseMatrix(format!("Sparse format error: {:?}", err))
    }
}

impl From<csv::Error> for ScsnvError {
    fn from(err: csv::Error) -> Self {
        ScsnvError::Parse(err.to_string())
    }
}
