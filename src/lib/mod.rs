//! SCSNV: single-cell SNV allele count matrices and genotype classification
//!
//! The library turns a stream of per-read allele observations into sparse
//! cell × site count matrices and classifies every cell's genotype at every
//! site with a mixture model.
//!
//! # Modules
//!
//! - [`core`]: errors, thread pools, IO helpers and sparse matrix utilities
//! - [`engine`]: sharded input sources and the parallel shard scheduler
//! - [`pipeline::snvmat`]: variant index, barcode registry and the matrix builder
//! - [`pipeline::genotype`]: EM mixture fitting and per-cell genotype calls

pub mod core;
pub mod engine;
pub mod pipeline;

pub mod prelude {
    pub use crate::core::prelude::*;
    pub use crate::engine::shards::{InMemoryShards, ShardSource, TsvShards};
    pub use crate::pipeline::prelude::*;
}
