use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::core::error::Result;
use crate::pipeline::snvmat::RawRecord;

/// Records between cancellation / timeout checks when no batch size is given.
pub const DEFAULT_CHECK_INTERVAL: usize = 1024;

/// An ordered stream of records from one shard.
///
/// A row that cannot be parsed is yielded as a [`MalformedRow`] error; the
/// stream keeps going past it. Any other error ends the attempt.
pub type RecordStream<'a> = Box<dyn Iterator<Item = anyhow::Result<RawRecord>> + 'a>;

/// A shard row that could not be turned into a [`RawRecord`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{location}: {reason}")]
pub struct MalformedRow {
    pub location: String,
    pub reason: String,
}

/// A partitioned record input whose shards can be reopened at a record offset.
///
/// Implementations live at the boundary with alignment front ends, so they report
/// failures through `anyhow`.
pub trait ShardSource: Send + Sync {
    fn shard_count(&self) -> usize;

    /// Open `shard` positioned so that the first item yielded is record `offset`.
    fn open(&self, shard: usize, offset: u64) -> anyhow::Result<RecordStream<'_>>;
}

/// Consumer side of a shard: receives records in order.
pub trait ShardSink {
    fn accept(&mut self, record: RawRecord) -> Result<()>;

    /// Called in place of `accept` for a row the source could not parse.
    fn malformed(&mut self, _row: &MalformedRow) {}

    /// Dispatch everything accepted so far. Records accepted before a successful
    /// flush are never re-read.
    fn flush(&mut self) -> Result<()>;
}

/// Cooperative cancellation flag shared with a running build.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Outcome of one fully processed shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardReport {
    pub shard: usize,
    /// Records read from the shard, accepted or rejected
    pub records: u64,
    /// Times the shard was opened
    pub attempts: u32,
}
