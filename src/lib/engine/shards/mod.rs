//! Parallel shard execution.
//!
//! The [`ShardScheduler`] fans the shards of a [`ShardSource`] out across a Rayon
//! pool and feeds each shard's records into a per-task [`ShardSink`]. Failed
//! shards are resumed at the first record their sink has not yet seen; a
//! [`CancellationToken`] stops the run at the next shard or batch boundary.

mod scheduler;
mod sources;
mod types;

pub use scheduler::ShardScheduler;
pub use sources::{InMemoryShards, TsvShards};
pub use types::{
    CancellationToken, MalformedRow, RecordStream, ShardReport, ShardSink, ShardSource, DEFAULT_CHECK_INTERVAL,
};
