pub mod concurrency;
pub mod error;
pub mod fs;
pub mod io;
pub mod read_filter;
pub mod sparse;

pub mod prelude {
    pub use super::concurrency::{build_thread_pool, determine_allowed_cpus};
    pub use super::error::{Result, ScsnvError};
    pub use super::fs::{ensure_dir, is_gzipped};
    pub use super::io::{column_index, get_reader};
    pub use super::read_filter::{DefaultRecordFilter, RecordFilter};
    pub use super::sparse::{CsrAssembler, SparseOps};
}
